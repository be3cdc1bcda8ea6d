//! Turns a stream of `(blob, level)` pairs into a single file-oid.
//!
//! A direct generalization of the stack-of-levels approach in
//! `orig:lib/bup/hashsplit.py` (`_squish`/`_make_shalist`/`split_to_blob_or_tree`),
//! rewritten against this crate's `ObjectSink` seam instead of Python closures.

use crate::error::Result;
use crate::hash::Oid;
use crate::object::{TreeEntry, GIT_MODE_CHUNKED, GIT_MODE_FILE};

const MAX_PER_TREE: usize = 256;

/// Where the tree builder deposits the blobs and trees it creates. `LocalRepository`
/// and friends implement this directly against their pack writer.
pub trait ObjectSink {
    fn write_blob(&mut self, bytes: &[u8]) -> Result<Oid>;
    fn write_tree(&mut self, entries: &[TreeEntry]) -> Result<Oid>;
}

#[derive(Clone, Debug)]
struct StackEntry {
    mode: u32,
    oid: Oid,
    size: u64,
}

/// Assigns each item a lexicographically-sortable offset name, padded to the width
/// needed for the group's total size.
fn make_shalist(items: &[StackEntry]) -> (Vec<TreeEntry>, u64) {
    let total: u64 = items.iter().map(|i| i.size).sum();
    let vlen = format!("{total:x}").len();
    let mut ofs = 0u64;
    let mut shalist = Vec::with_capacity(items.len());
    for item in items {
        let name = format!("{ofs:0vlen$x}");
        shalist.push(TreeEntry {
            mode: item.mode,
            name: name.into_bytes(),
            oid: item.oid,
        });
        ofs += item.size;
    }
    (shalist, total)
}

fn squish(sink: &mut impl ObjectSink, stacks: &mut Vec<Vec<StackEntry>>, n: usize) -> Result<()> {
    let mut i = 0usize;
    while i < n || stacks[i].len() >= MAX_PER_TREE {
        while stacks.len() <= i + 1 {
            stacks.push(Vec::new());
        }
        if stacks[i].len() == 1 {
            let item = stacks[i][0].clone();
            stacks[i + 1].push(item);
        } else if !stacks[i].is_empty() {
            let (shalist, size) = make_shalist(&stacks[i]);
            let tree_oid = sink.write_tree(&shalist)?;
            stacks[i + 1].push(StackEntry {
                mode: GIT_MODE_CHUNKED,
                oid: tree_oid,
                size,
            });
        }
        stacks[i].clear();
        i += 1;
    }
    Ok(())
}

/// Consumes a full hashsplit stream and returns the resulting `(mode, oid)`: a plain
/// file-blob mode for zero or one produced chunks, `GIT_MODE_CHUNKED` when the
/// stream needed a subtree to describe it.
pub fn build_tree(
    splitter: impl Iterator<Item = Result<(Vec<u8>, u32)>>,
    sink: &mut impl ObjectSink,
) -> Result<(u32, Oid)> {
    let mut stacks: Vec<Vec<StackEntry>> = vec![Vec::new()];
    let mut saw_any = false;

    for item in splitter {
        let (blob, level) = item?;
        saw_any = true;
        let oid = sink.write_blob(&blob)?;
        stacks[0].push(StackEntry {
            mode: GIT_MODE_FILE,
            oid,
            size: blob.len() as u64,
        });
        squish(sink, &mut stacks, level as usize)?;
    }

    if !saw_any {
        let oid = sink.write_blob(&[])?;
        return Ok((GIT_MODE_FILE, oid));
    }

    let top = stacks.len() - 1;
    squish(sink, &mut stacks, top)?;
    let (shalist, _total) = make_shalist(&stacks[stacks.len() - 1]);

    match shalist.len() {
        0 => {
            let oid = sink.write_blob(&[])?;
            Ok((GIT_MODE_FILE, oid))
        }
        1 => Ok((shalist[0].mode, shalist[0].oid)),
        _ => {
            let oid = sink.write_tree(&shalist)?;
            Ok((GIT_MODE_CHUNKED, oid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{oid_for, ObjectKind};
    use std::collections::HashMap;

    struct MemSink {
        objects: HashMap<Oid, Vec<u8>>,
    }

    impl MemSink {
        fn new() -> MemSink {
            MemSink {
                objects: HashMap::new(),
            }
        }
    }

    impl ObjectSink for MemSink {
        fn write_blob(&mut self, bytes: &[u8]) -> Result<Oid> {
            let oid = oid_for(ObjectKind::Blob, bytes);
            self.objects.insert(oid, bytes.to_vec());
            Ok(oid)
        }

        fn write_tree(&mut self, entries: &[TreeEntry]) -> Result<Oid> {
            let encoded = crate::object::encode_tree(entries);
            let oid = oid_for(ObjectKind::Tree, &encoded);
            self.objects.insert(oid, encoded);
            Ok(oid)
        }
    }

    #[test]
    fn empty_stream_yields_empty_blob() {
        let mut sink = MemSink::new();
        let items: Vec<Result<(Vec<u8>, u32)>> = Vec::new();
        let (mode, oid) = build_tree(items.into_iter(), &mut sink).unwrap();
        assert_eq!(mode, GIT_MODE_FILE);
        assert_eq!(oid, oid_for(ObjectKind::Blob, b""));
    }

    #[test]
    fn single_chunk_returns_blob_directly() {
        let mut sink = MemSink::new();
        let items: Vec<Result<(Vec<u8>, u32)>> = vec![Ok((b"hello world".to_vec(), 0))];
        let (mode, oid) = build_tree(items.into_iter(), &mut sink).unwrap();
        assert_eq!(mode, GIT_MODE_FILE);
        assert_eq!(oid, oid_for(ObjectKind::Blob, b"hello world"));
    }

    #[test]
    fn many_chunks_produce_a_root_tree() {
        let mut sink = MemSink::new();
        let items: Vec<Result<(Vec<u8>, u32)>> = (0..10)
            .map(|i| Ok((vec![i as u8; 100], 0)))
            .collect();
        let (mode, oid) = build_tree(items.into_iter(), &mut sink).unwrap();
        assert_eq!(mode, GIT_MODE_CHUNKED);
        let tree_bytes = sink.objects.get(&oid).unwrap();
        let entries = crate::object::decode_tree(tree_bytes).unwrap();
        assert_eq!(entries.len(), 10);
    }

    #[test]
    fn overflowing_a_level_creates_a_subtree() {
        let mut sink = MemSink::new();
        // 300 single-byte chunks at level 0 forces the first level to squish into a
        // subtree once it exceeds MAX_PER_TREE entries.
        let items: Vec<Result<(Vec<u8>, u32)>> = (0..300u32)
            .map(|i| Ok((vec![(i % 256) as u8], 0)))
            .collect();
        let (mode, oid) = build_tree(items.into_iter(), &mut sink).unwrap();
        assert_eq!(mode, GIT_MODE_CHUNKED);
        let entries = crate::object::decode_tree(sink.objects.get(&oid).unwrap()).unwrap();
        assert!(entries.iter().any(|e| e.mode == GIT_MODE_CHUNKED));
    }
}
