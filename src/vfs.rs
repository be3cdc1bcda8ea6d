//! Virtual filesystem resolution over stored commits.

use crate::error::{Error, Result};
use crate::hash::Oid;
use crate::object::{decode_tree, Commit, ObjectKind, TreeEntry, GIT_MODE_CHUNKED, GIT_MODE_TREE};
use crate::repo_local::LocalRepository;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VfsItem {
    Root,
    Tags,
    RevList { head_name: String },
    Commit { oid: Oid },
    /// A non-directory entry within a snapshot: its raw tree-entry mode and oid.
    Item { mode: u32, oid: Oid },
    /// A large file's hashsplit subtree, flattened and exposed as one seekable
    /// stream rather than as a directory of chunks.
    Chunky { oid: Oid, total_size: u64 },
    FakeLink { target: String },
}

/// `resolve` returns the ordered path from `('', Root)` down to the leaf.
pub type Resolution = Vec<(String, VfsItem)>;

/// A bad path shape (symlink loop, or a non-directory used as one) is a fault in
/// user-supplied data, not repository corruption, so it surfaces as an `io::Error`
/// carrying the matching errno rather than `Error::Corruption`.
fn too_many_symlinks() -> Error {
    Error::Io(std::io::Error::from_raw_os_error(libc::ELOOP))
}

fn not_a_directory() -> Error {
    Error::Io(std::io::Error::from_raw_os_error(libc::ENOTDIR))
}

fn tree_total_size(repo: &mut LocalRepository, oid: &Oid) -> Result<u64> {
    let (kind, data) = {
        let cat = repo.cat(&oid.to_hex())?;
        (cat.kind, cat.data)
    };
    if kind != ObjectKind::Tree {
        return Err(Error::Corruption(format!("{} is not a tree", oid.to_hex())));
    }
    let mut total = 0u64;
    for entry in decode_tree(&data)? {
        if entry.mode == GIT_MODE_CHUNKED {
            total += tree_total_size(repo, &entry.oid)?;
        } else {
            let cat = repo.cat(&entry.oid.to_hex())?;
            total += cat.size;
        }
    }
    Ok(total)
}

/// Walks `path` (slash-separated, no leading slash) starting from `Root`.
pub fn resolve(
    repo: &mut LocalRepository,
    path: &str,
    follow_symlinks: bool,
) -> Result<Resolution> {
    let mut resolution: Resolution = vec![(String::new(), VfsItem::Root)];
    if path.is_empty() {
        return Ok(resolution);
    }

    let mut seen_links = 0u32;
    let mut remaining: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    remaining.reverse();

    while let Some(component) = remaining.pop() {
        let (_, current) = resolution.last().cloned().unwrap();
        let mut entries = contents(repo, &current)?;

        let found = entries
            .iter()
            .position(|(name, _)| name == component)
            .map(|i| entries.remove(i));

        let (name, item) = found.ok_or_else(|| Error::NotFound(format!("no such path: {path}")))?;

        match &item {
            VfsItem::FakeLink { target } if follow_symlinks => {
                seen_links += 1;
                if seen_links > 40 {
                    return Err(too_many_symlinks());
                }
                let mut rest: Vec<&str> = target.split('/').filter(|c| !c.is_empty()).collect();
                rest.reverse();
                remaining.extend(rest);
                continue;
            }
            VfsItem::Item { .. } | VfsItem::Chunky { .. } => {
                if !remaining.is_empty() {
                    return Err(not_a_directory());
                }
            }
            _ => {}
        }
        resolution.push((name, item));
    }

    Ok(resolution)
}

/// Enumerates the direct children of `item`.
pub fn contents(repo: &mut LocalRepository, item: &VfsItem) -> Result<Vec<(String, VfsItem)>> {
    match item {
        VfsItem::Root => {
            let mut out: Vec<(String, VfsItem)> = repo
                .refs(None, true, false)?
                .into_iter()
                .map(|(name, _oid)| {
                    let head_name = name.trim_start_matches("refs/heads/").to_string();
                    (
                        head_name.clone(),
                        VfsItem::RevList { head_name },
                    )
                })
                .collect();
            out.push((".tag".to_string(), VfsItem::Tags));
            Ok(out)
        }
        VfsItem::Tags => Ok(repo
            .refs(None, false, true)?
            .into_iter()
            .map(|(name, oid)| {
                let short = name.trim_start_matches("refs/tags/").to_string();
                (short, VfsItem::Commit { oid })
            })
            .collect()),
        VfsItem::RevList { head_name } => {
            let head_oid = repo
                .read_ref(&format!("refs/heads/{head_name}"))?
                .ok_or_else(|| Error::NotFound(head_name.clone()))?;
            let mut out = Vec::new();
            let mut cursor = Some(head_oid);
            let mut latest_name = None;
            while let Some(oid) = cursor {
                let cat = repo.cat(&oid.to_hex())?;
                let commit = Commit::decode(&cat.data)?;
                let name = commit.author.epoch_seconds.to_string();
                if latest_name.is_none() {
                    latest_name = Some(name.clone());
                }
                out.push((name, VfsItem::Commit { oid }));
                cursor = commit.parents.first().copied();
            }
            if let Some(target) = latest_name {
                out.push(("latest".to_string(), VfsItem::FakeLink { target }));
            }
            Ok(out)
        }
        VfsItem::Commit { oid } => {
            let cat = repo.cat(&oid.to_hex())?;
            let commit = Commit::decode(&cat.data)?;
            let tree_cat = repo.cat(&commit.tree.to_hex())?;
            let mut out = tree_entries_to_items(repo, &tree_cat.data)?;
            out.push((".".to_string(), VfsItem::Commit { oid: *oid }));
            out.push(("..".to_string(), VfsItem::Root));
            Ok(out)
        }
        VfsItem::Item { mode, oid } if *mode == GIT_MODE_TREE => {
            let cat = repo.cat(&oid.to_hex())?;
            tree_entries_to_items(repo, &cat.data)
        }
        VfsItem::Item { .. } | VfsItem::Chunky { .. } | VfsItem::FakeLink { .. } => Ok(Vec::new()),
    }
}

fn tree_entries_to_items(repo: &mut LocalRepository, tree_bytes: &[u8]) -> Result<Vec<(String, VfsItem)>> {
    decode_tree(tree_bytes)?
        .into_iter()
        .map(|entry: TreeEntry| {
            let name = String::from_utf8(entry.name.clone())
                .map_err(|e| Error::Corruption(format!("invalid utf-8 tree entry name: {e}")))?;
            let item = if entry.mode == GIT_MODE_CHUNKED {
                VfsItem::Chunky {
                    oid: entry.oid,
                    total_size: tree_total_size(repo, &entry.oid)?,
                }
            } else {
                VfsItem::Item {
                    mode: entry.mode,
                    oid: entry.oid,
                }
            };
            Ok((name, item))
        })
        .collect()
}

/// POSIX-style mode for `item`, used by callers rendering directory listings.
pub fn item_mode(repo: &mut LocalRepository, item: &VfsItem) -> Result<u32> {
    match item {
        VfsItem::Item { mode, .. } => Ok(*mode),
        VfsItem::Chunky { .. } => Ok(crate::object::GIT_MODE_FILE),
        VfsItem::Root | VfsItem::Tags | VfsItem::RevList { .. } => Ok(GIT_MODE_TREE),
        VfsItem::Commit { .. } => Ok(GIT_MODE_TREE),
        VfsItem::FakeLink { .. } => Ok(crate::object::GIT_MODE_SYMLINK),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Signature, TreeEntry, GIT_MODE_FILE};
    use tempfile::tempdir;

    fn sig() -> Signature {
        Signature {
            name: "T".into(),
            email: "t@example.com".into(),
            epoch_seconds: 1_700_000_000,
            tz_offset_minutes: 0,
        }
    }

    fn setup() -> (tempfile::TempDir, LocalRepository, Oid) {
        let dir = tempdir().unwrap();
        let mut repo = LocalRepository::create(&dir.path().join("repo")).unwrap();
        let blob = repo.write_data(b"contents").unwrap();
        let tree = repo
            .write_tree_entries(&[TreeEntry {
                mode: GIT_MODE_FILE,
                name: b"file.txt".to_vec(),
                oid: blob,
            }])
            .unwrap();
        let commit = Commit {
            tree,
            parents: vec![],
            author: sig(),
            committer: sig(),
            message: b"msg\n".to_vec(),
            extra_headers: vec![],
        };
        let commit_oid = repo.write_commit(&commit).unwrap();
        repo.finish_writing(true).unwrap();
        repo.update_ref("refs/heads/main", commit_oid, None).unwrap();
        (dir, repo, commit_oid)
    }

    #[test]
    fn root_lists_heads_and_tag_dir() {
        let (_dir, mut repo, _commit) = setup();
        let entries = contents(&mut repo, &VfsItem::Root).unwrap();
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"main"));
        assert!(names.contains(&".tag"));
    }

    #[test]
    fn resolve_path_into_a_file() {
        let (_dir, mut repo, commit_oid) = setup();
        let resolution = resolve(&mut repo, "main/latest/file.txt", true).unwrap();
        let (name, item) = resolution.last().unwrap();
        assert_eq!(name, "file.txt");
        match item {
            VfsItem::Item { mode, .. } => assert_eq!(*mode, GIT_MODE_FILE),
            other => panic!("unexpected leaf: {other:?}"),
        }
        let _ = commit_oid;
    }

    #[test]
    fn missing_component_is_not_found() {
        let (_dir, mut repo, _commit) = setup();
        let err = resolve(&mut repo, "main/latest/missing.txt", true).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn descending_into_a_file_fails() {
        let (_dir, mut repo, _commit) = setup();
        let err = resolve(&mut repo, "main/latest/file.txt/nope", true).unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.raw_os_error(), Some(libc::ENOTDIR)),
            other => panic!("expected Io(ENOTDIR), got {other:?}"),
        }
    }

    #[test]
    fn item_mode_reports_root_as_a_directory() {
        let (_dir, mut repo, _commit) = setup();
        let mode = item_mode(&mut repo, &VfsItem::Root).unwrap();
        assert_eq!(mode, GIT_MODE_TREE);
    }
}
