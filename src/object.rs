//! Object kinds, and the wire/on-disk encoding of trees and commits.
//!
//! The tag-and-payload framing is the same discipline the teacher's `tree.rs` and
//! `object_encryption.rs` use for Arq's own record formats (a small typed header
//! followed by a length-known body); the concrete byte layouts here follow
//! `orig:lib/bup/git.py`'s `Commit`/tree encodings rather than Arq's.

use std::fmt;

use crate::error::{Error, Result};
use crate::hash::{object_oid, Oid};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    /// The single-byte tag used in the pack's variable-length object header and in
    /// the first plaintext byte of an encrypted object frame.
    pub fn tag(&self) -> u8 {
        match self {
            ObjectKind::Blob => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Commit => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<ObjectKind> {
        match tag {
            1 => Ok(ObjectKind::Blob),
            2 => Ok(ObjectKind::Tree),
            3 => Ok(ObjectKind::Commit),
            other => Err(Error::Corruption(format!("unknown object kind tag {other}"))),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Computes the object's oid from its kind and raw (uncompressed) payload.
pub fn oid_for(kind: ObjectKind, payload: &[u8]) -> Oid {
    object_oid(kind.name(), payload)
}

pub const GIT_MODE_FILE: u32 = 0o100644;
pub const GIT_MODE_SYMLINK: u32 = 0o120000;
pub const GIT_MODE_TREE: u32 = 0o40000;
/// Marks a tree entry whose child is a hashsplit subtree (internal structure of one
/// large file), not a real directory - reusing git's unused "gitlink" mode value as
/// a distinct sentinel.
pub const GIT_MODE_CHUNKED: u32 = 0o160000;

/// One `(mode, name, child-oid)` record within a tree object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: Vec<u8>,
    pub oid: Oid,
}

impl TreeEntry {
    /// The name used for sort ordering: directories get a virtual `/` suffix so
    /// `"foo"` (a file) sorts before `"foo/"` (a directory) even when the raw name
    /// bytes would otherwise collide with a prefix relationship. Losing this rule
    /// would silently change tree oids.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.clone();
        if self.mode == GIT_MODE_TREE {
            key.push(b'/');
        }
        key
    }
}

/// Encodes a tree object: `mode<space>name<NUL>oid(20 raw bytes)` per entry,
/// entries sorted by `TreeEntry::sort_key`.
pub fn encode_tree(entries: &[TreeEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let mut out = Vec::new();
    for entry in sorted {
        out.extend_from_slice(format!("{:o}", entry.mode).as_bytes());
        out.push(b' ');
        out.extend_from_slice(&entry.name);
        out.push(0);
        out.extend_from_slice(entry.oid.as_bytes());
    }
    out
}

pub fn decode_tree(bytes: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let space = bytes[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::Corruption("tree entry missing mode separator".into()))?;
        let mode_str = std::str::from_utf8(&bytes[pos..pos + space])?;
        let mode = u32::from_str_radix(mode_str, 8)
            .map_err(|_| Error::Corruption(format!("invalid tree mode {mode_str}")))?;
        pos += space + 1;
        let nul = bytes[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Corruption("tree entry missing name terminator".into()))?;
        let name = bytes[pos..pos + nul].to_vec();
        pos += nul + 1;
        if pos + crate::hash::OID_LEN > bytes.len() {
            return Err(Error::Corruption("truncated tree entry oid".into()));
        }
        let oid = Oid::from_slice(&bytes[pos..pos + crate::hash::OID_LEN])?;
        pos += crate::hash::OID_LEN;
        entries.push(TreeEntry { mode, name, oid });
    }
    Ok(entries)
}

/// Author/committer line: `<name> <<email>> <epoch> <±HHMM>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub epoch_seconds: i64,
    pub tz_offset_minutes: i32,
}

impl Signature {
    pub fn encode(&self) -> String {
        let sign = if self.tz_offset_minutes < 0 { '-' } else { '+' };
        let abs = self.tz_offset_minutes.unsigned_abs();
        format!(
            "{} <{}> {} {}{:02}{:02}",
            self.name,
            self.email,
            self.epoch_seconds,
            sign,
            abs / 60,
            abs % 60
        )
    }

    pub fn decode(line: &str) -> Result<Signature> {
        let open = line
            .find(" <")
            .ok_or_else(|| Error::Corruption(format!("malformed signature: {line}")))?;
        let name = line[..open].to_string();
        let close = line[open..]
            .find('>')
            .ok_or_else(|| Error::Corruption(format!("malformed signature: {line}")))?
            + open;
        let email = line[open + 2..close].to_string();
        let rest: Vec<&str> = line[close + 1..].trim().splitn(2, ' ').collect();
        if rest.len() != 2 {
            return Err(Error::Corruption(format!("malformed signature tail: {line}")));
        }
        let epoch_seconds: i64 = rest[0].parse()?;
        let tz = rest[1];
        if tz.len() != 5 || (tz.as_bytes()[0] != b'+' && tz.as_bytes()[0] != b'-') {
            return Err(Error::Corruption(format!("malformed timezone: {tz}")));
        }
        let sign = if tz.as_bytes()[0] == b'-' { -1 } else { 1 };
        let hh: i32 = tz[1..3].parse()?;
        let mm: i32 = tz[3..5].parse()?;
        Ok(Signature {
            name,
            email,
            epoch_seconds,
            tz_offset_minutes: sign * (hh * 60 + mm),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author: Signature,
    pub committer: Signature,
    pub message: Vec<u8>,
    /// Headers the encoder didn't recognize, preserved verbatim on roundtrip.
    pub extra_headers: Vec<String>,
}

impl Commit {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("tree {}\n", self.tree.to_hex()));
        for parent in &self.parents {
            out.push_str(&format!("parent {}\n", parent.to_hex()));
        }
        out.push_str(&format!("author {}\n", self.author.encode()));
        out.push_str(&format!("committer {}\n", self.committer.encode()));
        for header in &self.extra_headers {
            out.push_str(header);
            out.push('\n');
        }
        out.push('\n');
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.message);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Commit> {
        let text = std::str::from_utf8(bytes)?;
        let split = text
            .find("\n\n")
            .ok_or_else(|| Error::Corruption("commit missing header/message separator".into()))?;
        let (header, rest) = text.split_at(split);
        let message = rest[2..].as_bytes().to_vec();

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut extra_headers = Vec::new();

        for line in header.lines() {
            if let Some(hex) = line.strip_prefix("tree ") {
                tree = Some(Oid::from_hex(hex)?);
            } else if let Some(hex) = line.strip_prefix("parent ") {
                parents.push(Oid::from_hex(hex)?);
            } else if let Some(sig) = line.strip_prefix("author ") {
                author = Some(Signature::decode(sig)?);
            } else if let Some(sig) = line.strip_prefix("committer ") {
                committer = Some(Signature::decode(sig)?);
            } else {
                extra_headers.push(line.to_string());
            }
        }

        Ok(Commit {
            tree: tree.ok_or_else(|| Error::Corruption("commit missing tree header".into()))?,
            parents,
            author: author
                .ok_or_else(|| Error::Corruption("commit missing author header".into()))?,
            committer: committer
                .ok_or_else(|| Error::Corruption("commit missing committer header".into()))?,
            message,
            extra_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig() -> Signature {
        Signature {
            name: "Test User".into(),
            email: "test@example.com".into(),
            epoch_seconds: 1_700_000_000,
            tz_offset_minutes: -300,
        }
    }

    #[test]
    fn signature_roundtrip() {
        let s = sig();
        let encoded = s.encode();
        assert!(encoded.ends_with("-0500"));
        let decoded = Signature::decode(&encoded).unwrap();
        assert_eq!(s, decoded);
    }

    #[test]
    fn positive_offset_roundtrip() {
        let mut s = sig();
        s.tz_offset_minutes = 330;
        let encoded = s.encode();
        assert!(encoded.ends_with("+0530"));
        assert_eq!(Signature::decode(&encoded).unwrap(), s);
    }

    #[test]
    fn commit_roundtrip() {
        let commit = Commit {
            tree: oid_for(ObjectKind::Tree, b"tree body"),
            parents: vec![oid_for(ObjectKind::Commit, b"parent commit")],
            author: sig(),
            committer: sig(),
            message: b"a commit message\n".to_vec(),
            extra_headers: Vec::new(),
        };
        let encoded = commit.encode();
        let decoded = Commit::decode(&encoded).unwrap();
        assert_eq!(commit, decoded);
    }

    #[test]
    fn tree_sorts_directories_after_same_named_files() {
        let file_oid = oid_for(ObjectKind::Blob, b"file body");
        let dir_oid = oid_for(ObjectKind::Tree, b"dir body");
        let entries = vec![
            TreeEntry {
                mode: GIT_MODE_TREE,
                name: b"foo".to_vec(),
                oid: dir_oid,
            },
            TreeEntry {
                mode: GIT_MODE_FILE,
                name: b"foo".to_vec(),
                oid: file_oid,
            },
        ];
        let encoded = encode_tree(&entries);
        let decoded = decode_tree(&encoded).unwrap();
        assert_eq!(decoded[0].mode, GIT_MODE_FILE);
        assert_eq!(decoded[1].mode, GIT_MODE_TREE);
    }

    #[test]
    fn tree_roundtrip() {
        let entries = vec![
            TreeEntry {
                mode: GIT_MODE_FILE,
                name: b"a.txt".to_vec(),
                oid: oid_for(ObjectKind::Blob, b"aaa"),
            },
            TreeEntry {
                mode: GIT_MODE_SYMLINK,
                name: b"link".to_vec(),
                oid: oid_for(ObjectKind::Blob, b"target"),
            },
        ];
        let encoded = encode_tree(&entries);
        let mut decoded = decode_tree(&encoded).unwrap();
        decoded.sort_by(|a, b| a.name.cmp(&b.name));
        let mut expected = entries.clone();
        expected.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(decoded, expected);
    }
}
