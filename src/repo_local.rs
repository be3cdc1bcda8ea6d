//! The on-disk local repository: composes packs, idx, objects, config and refs.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hash::Oid;
use crate::idx::{Bloom, PackIdxList, PackIndex};
use crate::object::{
    decode_tree, encode_tree, oid_for, Commit, ObjectKind, TreeEntry,
};
use crate::pack::{Pack, PackWriter};
use crate::refs::{RefFamily, RefStore};
use crate::treebuilder::ObjectSink;

const DUMB_SERVER_SENTINEL: &str = "bup-dumb-server";

fn generate_repo_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..31)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn pack_dir(root: &Path) -> PathBuf {
    root.join("objects").join("pack")
}

/// `(oidx, kind, size, data)` as returned by `cat`/`get`.
pub struct CatResult {
    pub oid: Oid,
    pub kind: ObjectKind,
    pub size: u64,
    pub data: Vec<u8>,
}

pub struct LocalRepository {
    root: PathBuf,
    config: Config,
    refs: RefStore,
    idx_list: PackIdxList,
    writer: Option<PackWriter>,
    dumb_server: bool,
}

impl LocalRepository {
    /// Initializes a fresh repository layout at `root`.
    pub fn create(root: &Path) -> Result<LocalRepository> {
        if root.exists() && fs::read_dir(root)?.next().is_some() {
            return Err(Error::AlreadyExists(format!(
                "{} is not empty",
                root.display()
            )));
        }
        fs::create_dir_all(pack_dir(root))?;
        fs::create_dir_all(root.join("refs").join("heads"))?;
        fs::create_dir_all(root.join("refs").join("tags"))?;
        let mut config = Config::new();
        config.write("bup.repo-id", Some(&generate_repo_id()))?;
        config.save(&root.join("config"))?;
        LocalRepository::open(root)
    }

    pub fn open(root: &Path) -> Result<LocalRepository> {
        let config = Config::load(&root.join("config"))?;
        let dumb_server = root.join(DUMB_SERVER_SENTINEL).exists()
            || config.get_bool("bup.dumb-server")?.unwrap_or(false);
        let mut idx_list = PackIdxList::new();
        idx_list.refresh(&pack_dir(root))?;
        Ok(LocalRepository {
            root: root.to_path_buf(),
            config,
            refs: RefStore::new(root),
            idx_list,
            writer: None,
            dumb_server,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ---- config ----

    pub fn config_get(&self, name: &str) -> Result<Option<String>> {
        self.config.get_str(name)
    }

    pub fn config_write(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.config.write(name, value)?;
        self.config.save(&self.root.join("config"))
    }

    pub fn config_list(&self) -> Vec<(String, String)> {
        self.config
            .list()
            .map(|(k, v)| (k, v.to_string()))
            .collect()
    }

    // ---- refs ----

    fn split_ref(name: &str) -> Result<(RefFamily, &str)> {
        if let Some(rest) = name.strip_prefix("refs/heads/") {
            Ok((RefFamily::Head, rest))
        } else if let Some(rest) = name.strip_prefix("refs/tags/") {
            Ok((RefFamily::Tag, rest))
        } else {
            Err(Error::Config(format!("unrecognized ref namespace: {name}")))
        }
    }

    pub fn read_ref(&self, name: &str) -> Result<Option<Oid>> {
        let (family, short) = Self::split_ref(name)?;
        self.refs.read(family, short)
    }

    pub fn update_ref(&self, name: &str, new: Oid, old: Option<Oid>) -> Result<()> {
        let (family, short) = Self::split_ref(name)?;
        self.refs.update(family, short, new, old)
    }

    pub fn delete_ref(&self, name: &str, old: Option<Oid>) -> Result<()> {
        let (family, short) = Self::split_ref(name)?;
        self.refs.delete(family, short, old)
    }

    pub fn refs(
        &self,
        patterns: Option<&[String]>,
        heads: bool,
        tags: bool,
    ) -> Result<Vec<(String, Oid)>> {
        self.refs.list(patterns, heads, tags)
    }

    // ---- indexes ----

    pub fn list_indexes(&self) -> Vec<String> {
        self.idx_list
            .indexes()
            .iter()
            .filter_map(|i| i.path().file_name().map(|n| n.to_string_lossy().to_string()))
            .collect()
    }

    pub fn send_index(&self, name: &str, sink: &mut impl std::io::Write) -> Result<()> {
        let path = pack_dir(&self.root).join(name);
        let bytes = fs::read(&path)?;
        sink.write_all(&bytes)?;
        Ok(())
    }

    pub fn is_dumb_server(&self) -> bool {
        self.dumb_server
    }

    // ---- object existence / reads ----

    /// Name of the idx file already covering `oid`, if any - used by the wire server
    /// to emit `index <idxname>` suggestion lines for already-known objects.
    pub fn locate_index(&self, oid: &Oid) -> Option<String> {
        self.idx_list
            .locate(oid)
            .and_then(|(path, _)| path.file_name().map(|n| n.to_string_lossy().to_string()))
    }

    pub fn exists(&self, oid: &Oid) -> bool {
        if let Some(writer) = &self.writer {
            if writer.contains(oid) {
                return true;
            }
        }
        self.idx_list.exists(oid).is_some()
    }

    fn read_object(&mut self, oid: &Oid) -> Result<(ObjectKind, Vec<u8>)> {
        let (idx_path, entry) = self
            .idx_list
            .locate(oid)
            .ok_or_else(|| Error::NotFound(oid.to_hex()))?;
        let pack_path = idx_path.with_extension("pack");
        let mut pack = Pack::open(&pack_path)?;
        pack.read_at(entry.offset)
    }

    /// Resolves a ref name or literal 40-hex oid string to its oid.
    fn resolve(&self, ref_or_oid: &str) -> Result<Oid> {
        if ref_or_oid.len() == 40 {
            if let Ok(oid) = Oid::from_hex(ref_or_oid) {
                return Ok(oid);
            }
        }
        for candidate in [
            format!("refs/heads/{ref_or_oid}"),
            format!("refs/tags/{ref_or_oid}"),
            ref_or_oid.to_string(),
        ] {
            if Self::split_ref(&candidate).is_ok() {
                if let Some(oid) = self.read_ref(&candidate)? {
                    return Ok(oid);
                }
            }
        }
        Err(Error::NotFound(format!("no such ref or oid: {ref_or_oid}")))
    }

    pub fn cat(&mut self, ref_or_oid: &str) -> Result<CatResult> {
        let oid = self.resolve(ref_or_oid)?;
        let (kind, data) = self.read_object(&oid)?;
        Ok(CatResult {
            oid,
            kind,
            size: data.len() as u64,
            data,
        })
    }

    pub fn get(
        &mut self,
        ref_or_oid: &str,
        include_data: bool,
    ) -> Result<(Oid, ObjectKind, u64, Option<Vec<u8>>)> {
        let oid = self.resolve(ref_or_oid)?;
        if !include_data {
            let (idx_path, entry) = self
                .idx_list
                .locate(&oid)
                .ok_or_else(|| Error::NotFound(oid.to_hex()))?;
            let pack_path = idx_path.with_extension("pack");
            let mut pack = Pack::open(&pack_path)?;
            let (kind, data) = pack.read_at(entry.offset)?;
            return Ok((oid, kind, data.len() as u64, None));
        }
        let (kind, data) = self.read_object(&oid)?;
        let size = data.len() as u64;
        Ok((oid, kind, size, Some(data)))
    }

    /// Yields every object reachable from `oidx` exactly once.
    pub fn walk_object(&mut self, oidx: &str, include_data: bool) -> Result<Vec<CatResult>> {
        let root_oid = if oidx.len() == 40 {
            Oid::from_hex(oidx)?
        } else {
            self.resolve(oidx)?
        };
        let mut seen = HashSet::new();
        let mut stack = vec![root_oid];
        let mut out = Vec::new();
        while let Some(oid) = stack.pop() {
            if !seen.insert(oid) {
                continue;
            }
            let (kind, data) = self.read_object(&oid)?;
            match kind {
                ObjectKind::Commit => {
                    let commit = Commit::decode(&data)?;
                    stack.push(commit.tree);
                    stack.extend(commit.parents.iter().copied());
                }
                ObjectKind::Tree => {
                    for entry in decode_tree(&data)? {
                        stack.push(entry.oid);
                    }
                }
                ObjectKind::Blob => {}
            }
            out.push(CatResult {
                oid,
                kind,
                size: data.len() as u64,
                data: if include_data { data } else { Vec::new() },
            });
        }
        Ok(out)
    }

    // ---- writing ----

    fn writer_mut(&mut self) -> Result<&mut PackWriter> {
        if self.writer.is_none() {
            self.writer = Some(PackWriter::create(&pack_dir(&self.root))?);
        }
        Ok(self.writer.as_mut().unwrap())
    }

    fn rollover_if_needed(&mut self, incoming_len: usize) -> Result<()> {
        let needs_rollover = self
            .writer
            .as_ref()
            .map(|w| w.would_overflow(incoming_len))
            .unwrap_or(false);
        if needs_rollover {
            self.finish_writing(true)?;
        }
        Ok(())
    }

    pub fn maybe_write(&mut self, kind: ObjectKind, bytes: &[u8]) -> Result<Oid> {
        let oid = oid_for(kind, bytes);
        if self.exists(&oid) {
            return Ok(oid);
        }
        self.rollover_if_needed(bytes.len())?;
        let oid = match kind {
            ObjectKind::Blob => self.writer_mut()?.write_data(bytes)?,
            ObjectKind::Tree => self.writer_mut()?.write_tree(bytes)?,
            ObjectKind::Commit => self.writer_mut()?.write_commit(bytes)?,
        };
        Ok(oid)
    }

    /// Ingests an already-framed object (oid, crc32, `header ‖ compressed-payload`)
    /// exactly as received over the wire in a `receive-objects-v2` frame, skipping
    /// re-compression. Returns whether it was newly written.
    pub fn receive_raw_object(&mut self, oid: Oid, crc32: u32, raw: &[u8]) -> Result<bool> {
        if self.exists(&oid) {
            return Ok(false);
        }
        self.rollover_if_needed(raw.len())?;
        self.writer_mut()?.write_raw_object(oid, crc32, raw)?;
        Ok(true)
    }

    pub fn write_data(&mut self, bytes: &[u8]) -> Result<Oid> {
        self.maybe_write(ObjectKind::Blob, bytes)
    }

    pub fn write_symlink(&mut self, target: &[u8]) -> Result<Oid> {
        self.maybe_write(ObjectKind::Blob, target)
    }

    pub fn write_tree_entries(&mut self, entries: &[TreeEntry]) -> Result<Oid> {
        self.maybe_write(ObjectKind::Tree, &encode_tree(entries))
    }

    pub fn write_commit(&mut self, commit: &Commit) -> Result<Oid> {
        self.maybe_write(ObjectKind::Commit, &commit.encode())
    }

    /// Closes the active pack writer (if any), registers its idx, and - unless in
    /// dumb-server mode - rebuilds the midx and bloom.
    pub fn finish_writing(&mut self, run_midx: bool) -> Result<Option<String>> {
        let writer = match self.writer.take() {
            Some(w) => w,
            None => return Ok(None),
        };
        let base = writer.finish()?;
        if let Some(base) = &base {
            let idx_path = pack_dir(&self.root).join(format!("{base}.idx"));
            self.idx_list.add_index(PackIndex::open(&idx_path)?);
            if run_midx && !self.dumb_server {
                self.idx_list.rebuild_midx();
                let mut bloom = Bloom::new(
                    self.idx_list.indexes().iter().map(|i| i.len()).sum(),
                    5,
                );
                for idx in self.idx_list.indexes() {
                    for entry in idx.iter() {
                        bloom.add(&entry.oid);
                    }
                }
                self.idx_list.set_bloom(bloom);
            }
        }
        Ok(base)
    }

    pub fn abort_writing(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.abort()?;
        }
        Ok(())
    }
}

impl ObjectSink for LocalRepository {
    fn write_blob(&mut self, bytes: &[u8]) -> Result<Oid> {
        self.write_data(bytes)
    }

    fn write_tree(&mut self, entries: &[TreeEntry]) -> Result<Oid> {
        self.write_tree_entries(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Signature, GIT_MODE_FILE};
    use tempfile::tempdir;

    fn sig() -> Signature {
        Signature {
            name: "Test".into(),
            email: "test@example.com".into(),
            epoch_seconds: 1_700_000_000,
            tz_offset_minutes: 0,
        }
    }

    #[test]
    fn create_then_open_preserves_repo_id() {
        let dir = tempdir().unwrap();
        let repo_root = dir.path().join("repo");
        let repo = LocalRepository::create(&repo_root).unwrap();
        let id = repo.config_get("bup.repo-id").unwrap().unwrap();
        assert_eq!(id.len(), 31);

        let reopened = LocalRepository::open(&repo_root).unwrap();
        assert_eq!(reopened.config_get("bup.repo-id").unwrap(), Some(id));
    }

    #[test]
    fn write_object_then_finish_then_read_back() {
        let dir = tempdir().unwrap();
        let mut repo = LocalRepository::create(&dir.path().join("repo")).unwrap();
        let oid = repo.write_data(b"hello repository").unwrap();
        repo.finish_writing(true).unwrap();
        assert!(repo.exists(&oid));
        let cat = repo.cat(&oid.to_hex()).unwrap();
        assert_eq!(cat.data, b"hello repository");
    }

    #[test]
    fn dedup_returns_same_oid_without_rewriting() {
        let dir = tempdir().unwrap();
        let mut repo = LocalRepository::create(&dir.path().join("repo")).unwrap();
        let oid_a = repo.write_data(b"same content").unwrap();
        repo.finish_writing(true).unwrap();
        let oid_b = repo.write_data(b"same content").unwrap();
        assert_eq!(oid_a, oid_b);
    }

    #[test]
    fn ref_update_cas_and_cat_by_ref_name() {
        let dir = tempdir().unwrap();
        let mut repo = LocalRepository::create(&dir.path().join("repo")).unwrap();
        let tree_oid = repo.write_tree_entries(&[]).unwrap();
        let commit = Commit {
            tree: tree_oid,
            parents: vec![],
            author: sig(),
            committer: sig(),
            message: b"initial\n".to_vec(),
            extra_headers: vec![],
        };
        let commit_oid = repo.write_commit(&commit).unwrap();
        repo.finish_writing(true).unwrap();
        repo.update_ref("refs/heads/main", commit_oid, None).unwrap();

        let cat = repo.cat("main").unwrap();
        assert_eq!(cat.oid, commit_oid);
        assert_eq!(cat.kind, ObjectKind::Commit);
    }

    #[test]
    fn walk_object_visits_tree_and_blobs_once() {
        let dir = tempdir().unwrap();
        let mut repo = LocalRepository::create(&dir.path().join("repo")).unwrap();
        let blob = repo.write_data(b"file contents").unwrap();
        let tree_oid = repo
            .write_tree_entries(&[TreeEntry {
                mode: GIT_MODE_FILE,
                name: b"a.txt".to_vec(),
                oid: blob,
            }])
            .unwrap();
        repo.finish_writing(true).unwrap();
        let visited = repo.walk_object(&tree_oid.to_hex(), true).unwrap();
        assert_eq!(visited.len(), 2);
    }
}
