//! Pack index v2, multi-pack index, and the existence bloom filter.
//!
//! The teacher never wrote a sorted on-disk index, so this is built straight off the
//! specification's bit-exact layout description rather than an adapted teacher file;
//! the surrounding style (explicit `ReadExt`/`WriteExt` cursors, `thiserror`-typed
//! failures) matches the rest of this crate.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32Hasher;

use crate::binio::{ReadExt, WriteExt};
use crate::error::{Error, Result};
use crate::hash::{sha1sum, Oid, OID_LEN};

pub const IDX_MAGIC: &[u8; 4] = b"\xffTOc";
pub const IDX_VERSION: u32 = 2;
const FANOUT_SIZE: usize = 256;
/// Offsets at or above this value store the real 64-bit offset in the large-offset
/// table and record only this sentinel (top bit set) in the 32-bit offset table.
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdxEntry {
    pub oid: Oid,
    pub crc32: u32,
    pub offset: u64,
}

/// Writes a pack index in the bit-exact v2 layout.
pub fn write_idx_v2(path: &Path, pack_sha: &[u8; OID_LEN], entries: &mut [IdxEntry]) -> Result<()> {
    entries.sort_by(|a, b| a.oid.cmp(&b.oid));

    let mut fanout = [0u32; FANOUT_SIZE];
    for entry in entries.iter() {
        for slot in fanout.iter_mut().skip(entry.oid.first_byte() as usize) {
            *slot += 1;
        }
    }

    let mut large_offsets = Vec::new();
    let mut body = Vec::new();
    body.write_all(IDX_MAGIC)?;
    body.write_u32_be(IDX_VERSION)?;
    for count in fanout.iter() {
        body.write_u32_be(*count)?;
    }
    for entry in entries.iter() {
        body.write_all(entry.oid.as_bytes())?;
    }
    for entry in entries.iter() {
        body.write_u32_be(entry.crc32)?;
    }
    for entry in entries.iter() {
        if entry.offset >= u64::from(LARGE_OFFSET_FLAG) {
            let idx = large_offsets.len() as u32;
            large_offsets.push(entry.offset);
            body.write_u32_be(LARGE_OFFSET_FLAG | idx)?;
        } else {
            body.write_u32_be(entry.offset as u32)?;
        }
    }
    for offset in &large_offsets {
        body.write_u64_be(*offset)?;
    }
    body.write_all(pack_sha)?;

    let idx_sha = sha1sum(&body);
    body.write_all(&idx_sha)?;

    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(&body)?;
    file.flush()?;
    Ok(())
}

/// A parsed, in-memory view of a `.idx` file, enough to binary-search for an oid.
pub struct PackIndex {
    path: PathBuf,
    fanout: [u32; FANOUT_SIZE],
    oids: Vec<Oid>,
    crcs: Vec<u32>,
    offsets: Vec<u64>,
    pub pack_sha: [u8; OID_LEN],
}

impl PackIndex {
    pub fn open(path: &Path) -> Result<PackIndex> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Self::parse(path.to_path_buf(), &data)
    }

    fn parse(path: PathBuf, data: &[u8]) -> Result<PackIndex> {
        let mut cur = std::io::Cursor::new(data);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)?;
        if &magic != IDX_MAGIC {
            return Err(Error::Corruption(format!("bad idx magic in {}", path.display())));
        }
        let version = cur.read_u32_be()?;
        if version != IDX_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported idx version {version} in {}",
                path.display()
            )));
        }
        let mut fanout = [0u32; FANOUT_SIZE];
        for slot in fanout.iter_mut() {
            *slot = cur.read_u32_be()?;
        }
        let count = *fanout.last().unwrap() as usize;

        let mut oids = Vec::with_capacity(count);
        for _ in 0..count {
            oids.push(Oid::from_slice(&cur.read_exact_vec(OID_LEN)?)?);
        }
        let mut crcs = Vec::with_capacity(count);
        for _ in 0..count {
            crcs.push(cur.read_u32_be()?);
        }
        let mut raw_offsets = Vec::with_capacity(count);
        for _ in 0..count {
            raw_offsets.push(cur.read_u32_be()?);
        }
        let large_count = raw_offsets
            .iter()
            .filter(|&&o| o & LARGE_OFFSET_FLAG != 0)
            .count();
        let mut large_table = Vec::with_capacity(large_count);
        for _ in 0..large_count {
            large_table.push(cur.read_u64_be()?);
        }
        let offsets: Vec<u64> = raw_offsets
            .iter()
            .map(|&o| {
                if o & LARGE_OFFSET_FLAG != 0 {
                    large_table[(o & !LARGE_OFFSET_FLAG) as usize]
                } else {
                    u64::from(o)
                }
            })
            .collect();

        let mut pack_sha = [0u8; OID_LEN];
        cur.read_exact(&mut pack_sha)?;
        let mut idx_sha = [0u8; OID_LEN];
        cur.read_exact(&mut idx_sha)?;

        let covered = &data[..data.len() - OID_LEN];
        if sha1sum(covered) != idx_sha {
            return Err(Error::Corruption(format!(
                "idx self-hash mismatch in {}",
                path.display()
            )));
        }

        Ok(PackIndex {
            path,
            fanout,
            oids,
            crcs,
            offsets,
            pack_sha,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.oids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }

    fn search_window(&self, oid: &Oid) -> (usize, usize) {
        let first = oid.first_byte() as usize;
        let lo = if first == 0 { 0 } else { self.fanout[first - 1] as usize };
        let hi = self.fanout[first] as usize;
        (lo, hi)
    }

    pub fn find(&self, oid: &Oid) -> Option<IdxEntry> {
        let (lo, hi) = self.search_window(oid);
        match self.oids[lo..hi].binary_search(oid) {
            Ok(rel) => {
                let i = lo + rel;
                Some(IdxEntry {
                    oid: self.oids[i],
                    crc32: self.crcs[i],
                    offset: self.offsets[i],
                })
            }
            Err(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = IdxEntry> + '_ {
        (0..self.oids.len()).map(move |i| IdxEntry {
            oid: self.oids[i],
            crc32: self.crcs[i],
            offset: self.offsets[i],
        })
    }
}

/// Merged read-only view across every idx currently in the pack directory, so a
/// lookup doesn't need to probe each idx file in turn once a midx exists.
pub struct MultiIdx {
    entries: HashMap<Oid, (usize, IdxEntry)>,
    source_paths: Vec<PathBuf>,
}

impl MultiIdx {
    pub fn build(indexes: &[PackIndex]) -> MultiIdx {
        let mut entries = HashMap::new();
        for (i, idx) in indexes.iter().enumerate() {
            for entry in idx.iter() {
                entries.entry(entry.oid).or_insert((i, entry));
            }
        }
        MultiIdx {
            entries,
            source_paths: indexes.iter().map(|i| i.path().to_path_buf()).collect(),
        }
    }

    pub fn find(&self, oid: &Oid) -> Option<(usize, IdxEntry)> {
        self.entries.get(oid).copied()
    }

    /// True if the set of idx files this midx was built from still matches
    /// `current` - used by `PackIdxList::refresh` to decide whether to rebuild.
    pub fn covers(&self, current: &[PathBuf]) -> bool {
        let mut a = self.source_paths.clone();
        let mut b = current.to_vec();
        a.sort();
        b.sort();
        a == b
    }
}

/// Lossy existence pre-filter. Never gives a false negative: an oid present in any
/// backing idx is always reported "maybe present"; absent oids are usually (not
/// always) reported absent.
pub struct Bloom {
    bits: Vec<u8>,
    k: u32,
    entries: usize,
}

impl Bloom {
    pub fn new(expected_entries: usize, k: u32) -> Bloom {
        let bits_needed = (expected_entries.max(1) * 10).next_power_of_two();
        Bloom {
            bits: vec![0u8; bits_needed / 8 + 1],
            k,
            entries: 0,
        }
    }

    fn positions(&self, oid: &Oid) -> Vec<usize> {
        let nbits = self.bits.len() * 8;
        let h1 = u64::from_be_bytes(oid.as_bytes()[0..8].try_into().unwrap());
        let h2 = u64::from_be_bytes(oid.as_bytes()[8..16].try_into().unwrap());
        (0..self.k)
            .map(|i| (h1.wrapping_add(h2.wrapping_mul(i as u64)) as usize) % nbits)
            .collect()
    }

    pub fn add(&mut self, oid: &Oid) {
        for pos in self.positions(oid) {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
        self.entries += 1;
    }

    /// `false` is a hard guarantee of absence; `true` means "maybe present".
    pub fn maybe_contains(&self, oid: &Oid) -> bool {
        self.positions(oid)
            .into_iter()
            .all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Capacity heuristic mirroring the specification's "not full" test: once actual
    /// entries exceed the design load factor, further additions are unreliable and
    /// the caller should invalidate rather than extend.
    pub fn is_full(&self) -> bool {
        self.entries * 10 >= self.bits.len() * 8
    }
}

/// The set of open idx readers plus an optional midx and bloom, giving a single
/// `exists` entry point that fast-rejects via the bloom before falling back to the
/// midx and then each idx in most-recent-first order.
pub struct PackIdxList {
    indexes: Vec<PackIndex>,
    midx: Option<MultiIdx>,
    bloom: Option<Bloom>,
}

impl PackIdxList {
    pub fn new() -> PackIdxList {
        PackIdxList {
            indexes: Vec::new(),
            midx: None,
            bloom: None,
        }
    }

    pub fn set_bloom(&mut self, bloom: Bloom) {
        self.bloom = Some(bloom);
    }

    pub fn add_index(&mut self, index: PackIndex) {
        self.indexes.push(index);
    }

    pub fn rebuild_midx(&mut self) {
        self.midx = Some(MultiIdx::build(&self.indexes));
    }

    pub fn exists(&self, oid: &Oid) -> Option<IdxEntry> {
        self.locate(oid).map(|(_, entry)| entry)
    }

    /// Like `exists`, but also reports which idx file the entry came from so the
    /// caller can derive the sibling pack path.
    pub fn locate(&self, oid: &Oid) -> Option<(&Path, IdxEntry)> {
        if let Some(bloom) = &self.bloom {
            if !bloom.maybe_contains(oid) {
                return None;
            }
        }
        if let Some(midx) = &self.midx {
            if let Some((i, entry)) = midx.find(oid) {
                return Some((self.indexes[i].path(), entry));
            }
        }
        for index in self.indexes.iter().rev() {
            if let Some(entry) = index.find(oid) {
                return Some((index.path(), entry));
            }
        }
        None
    }

    pub fn indexes(&self) -> &[PackIndex] {
        &self.indexes
    }

    /// Rescans `dir` for `.idx` files, opening new ones and dropping ones that
    /// vanished; invalidates the midx if it no longer matches the current set.
    pub fn refresh(&mut self, dir: &Path) -> Result<()> {
        let mut current_paths = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("idx") {
                    current_paths.push(path);
                }
            }
        }
        current_paths.sort();

        self.indexes
            .retain(|idx| current_paths.contains(&idx.path().to_path_buf()));
        let known: Vec<PathBuf> = self.indexes.iter().map(|i| i.path().to_path_buf()).collect();
        for path in &current_paths {
            if !known.contains(path) {
                self.indexes.push(PackIndex::open(path)?);
            }
        }

        if let Some(midx) = &self.midx {
            if !midx.covers(&current_paths) {
                self.midx = None;
            }
        }
        Ok(())
    }
}

impl Default for PackIdxList {
    fn default() -> PackIdxList {
        PackIdxList::new()
    }
}

pub fn crc32_of(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(byte0: u8, rest: u8, offset: u64) -> IdxEntry {
        let mut bytes = [rest; OID_LEN];
        bytes[0] = byte0;
        IdxEntry {
            oid: Oid::from_bytes(bytes),
            crc32: 0xdead_beef,
            offset,
        }
    }

    #[test]
    fn write_and_read_back_idx() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack-test.idx");
        let mut entries = vec![entry(0x01, 0x11, 100), entry(0x01, 0x22, 200), entry(0xff, 0x33, 300)];
        let pack_sha = [7u8; OID_LEN];
        write_idx_v2(&path, &pack_sha, &mut entries).unwrap();

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.pack_sha, pack_sha);
        for e in &entries {
            let found = idx.find(&e.oid).unwrap();
            assert_eq!(found.offset, e.offset);
            assert_eq!(found.crc32, e.crc32);
        }
        let missing = Oid::from_bytes([0x02; OID_LEN]);
        assert!(idx.find(&missing).is_none());
    }

    #[test]
    fn large_offsets_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack-large.idx");
        let big_offset = u64::from(u32::MAX) + 4096;
        let mut entries = vec![entry(0x10, 0x01, big_offset)];
        write_idx_v2(&path, &[1u8; OID_LEN], &mut entries).unwrap();
        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.find(&entries[0].oid).unwrap().offset, big_offset);
    }

    #[test]
    fn offset_just_past_2gib_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack-2gib.idx");
        let offset = u64::from(LARGE_OFFSET_FLAG) + 1;
        let mut entries = vec![entry(0x20, 0x02, offset)];
        write_idx_v2(&path, &[2u8; OID_LEN], &mut entries).unwrap();
        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.find(&entries[0].oid).unwrap().offset, offset);
    }

    #[test]
    fn corrupted_self_hash_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack-bad.idx");
        let mut entries = vec![entry(0x01, 0x11, 1)];
        write_idx_v2(&path, &[0u8; OID_LEN], &mut entries).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();
        assert!(PackIndex::open(&path).is_err());
    }

    #[test]
    fn bloom_never_false_negatives() {
        let mut bloom = Bloom::new(1000, 5);
        let oids: Vec<Oid> = (0..500u32)
            .map(|i| {
                let mut b = [0u8; OID_LEN];
                b[0..4].copy_from_slice(&i.to_be_bytes());
                Oid::from_bytes(b)
            })
            .collect();
        for oid in &oids {
            bloom.add(oid);
        }
        for oid in &oids {
            assert!(bloom.maybe_contains(oid));
        }
    }

    #[test]
    fn pack_idx_list_exists_across_indexes() {
        let dir = tempdir().unwrap();
        let path_a = dir.path().join("pack-a.idx");
        let path_b = dir.path().join("pack-b.idx");
        write_idx_v2(&path_a, &[1u8; OID_LEN], &mut vec![entry(0x01, 0x01, 10)]).unwrap();
        write_idx_v2(&path_b, &[2u8; OID_LEN], &mut vec![entry(0x02, 0x02, 20)]).unwrap();

        let mut list = PackIdxList::new();
        list.add_index(PackIndex::open(&path_a).unwrap());
        list.add_index(PackIndex::open(&path_b).unwrap());

        assert!(list.exists(&Oid::from_bytes([0x01; OID_LEN])).is_some());
        assert!(list.exists(&Oid::from_bytes([0x02; OID_LEN])).is_some());
        assert!(list.exists(&Oid::from_bytes([0x09; OID_LEN])).is_none());
    }
}
