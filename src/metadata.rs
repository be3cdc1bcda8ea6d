//! Packed filesystem metadata blob.
//!
//! A self-delimiting record separate from the tree/commit text encodings, closer in
//! spirit to the teacher's `blob.rs` packed binary records. Absence is meaningful:
//! older trees never carried one, so every reader here treats a missing metadata
//! blob as "infer from the tree mode" rather than an error.

use crate::binio::{ReadExt, WriteExt};
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ExtendedAttr {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub owner_name: String,
    pub gid: u32,
    pub group_name: String,
    pub atime_sec: i64,
    pub atime_nsec: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub ctime_sec: i64,
    pub ctime_nsec: u32,
    pub symlink_target: Option<Vec<u8>>,
    pub xattrs: Vec<ExtendedAttr>,
    pub acl: Option<Vec<u8>>,
}

impl Default for Metadata {
    fn default() -> Metadata {
        Metadata {
            mode: 0,
            uid: 0,
            owner_name: String::new(),
            gid: 0,
            group_name: String::new(),
            atime_sec: 0,
            atime_nsec: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
            ctime_sec: 0,
            ctime_nsec: 0,
            symlink_target: None,
            xattrs: Vec::new(),
            acl: None,
        }
    }
}

const METADATA_MAGIC: u32 = 0x4d455441; // "META"
const METADATA_VERSION: u8 = 1;

impl Metadata {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32_be(METADATA_MAGIC).unwrap();
        out.write_u8_be(METADATA_VERSION).unwrap();
        out.write_vuint(u64::from(self.mode)).unwrap();
        out.write_vuint(u64::from(self.uid)).unwrap();
        out.write_bvec(self.owner_name.as_bytes()).unwrap();
        out.write_vuint(u64::from(self.gid)).unwrap();
        out.write_bvec(self.group_name.as_bytes()).unwrap();
        out.write_vint(self.atime_sec).unwrap();
        out.write_vuint(u64::from(self.atime_nsec)).unwrap();
        out.write_vint(self.mtime_sec).unwrap();
        out.write_vuint(u64::from(self.mtime_nsec)).unwrap();
        out.write_vint(self.ctime_sec).unwrap();
        out.write_vuint(u64::from(self.ctime_nsec)).unwrap();
        match &self.symlink_target {
            Some(target) => {
                out.write_u8_be(1).unwrap();
                out.write_bvec(target).unwrap();
            }
            None => out.write_u8_be(0).unwrap(),
        }
        out.write_vuint(self.xattrs.len() as u64).unwrap();
        for xattr in &self.xattrs {
            out.write_bvec(&xattr.name).unwrap();
            out.write_bvec(&xattr.value).unwrap();
        }
        match &self.acl {
            Some(acl) => {
                out.write_u8_be(1).unwrap();
                out.write_bvec(acl).unwrap();
            }
            None => out.write_u8_be(0).unwrap(),
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Metadata> {
        let mut cur = std::io::Cursor::new(bytes);
        let magic = cur.read_u32_be()?;
        if magic != METADATA_MAGIC {
            return Err(crate::error::Error::Corruption(
                "bad metadata blob magic".into(),
            ));
        }
        let version = cur.read_u8_be()?;
        if version != METADATA_VERSION {
            return Err(crate::error::Error::Corruption(format!(
                "unsupported metadata version {version}"
            )));
        }
        let mode = cur.read_vuint()? as u32;
        let uid = cur.read_vuint()? as u32;
        let owner_name = String::from_utf8(cur.read_bvec()?)?;
        let gid = cur.read_vuint()? as u32;
        let group_name = String::from_utf8(cur.read_bvec()?)?;
        let atime_sec = cur.read_vint()?;
        let atime_nsec = cur.read_vuint()? as u32;
        let mtime_sec = cur.read_vint()?;
        let mtime_nsec = cur.read_vuint()? as u32;
        let ctime_sec = cur.read_vint()?;
        let ctime_nsec = cur.read_vuint()? as u32;
        let symlink_target = if cur.read_u8_be()? == 1 {
            Some(cur.read_bvec()?)
        } else {
            None
        };
        let xattr_count = cur.read_vuint()?;
        let mut xattrs = Vec::with_capacity(xattr_count as usize);
        for _ in 0..xattr_count {
            let name = cur.read_bvec()?;
            let value = cur.read_bvec()?;
            xattrs.push(ExtendedAttr { name, value });
        }
        let acl = if cur.read_u8_be()? == 1 {
            Some(cur.read_bvec()?)
        } else {
            None
        };
        Ok(Metadata {
            mode,
            uid,
            owner_name,
            gid,
            group_name,
            atime_sec,
            atime_nsec,
            mtime_sec,
            mtime_nsec,
            ctime_sec,
            ctime_nsec,
            symlink_target,
            xattrs,
            acl,
        })
    }
}

impl From<std::string::FromUtf8Error> for crate::error::Error {
    fn from(e: std::string::FromUtf8Error) -> crate::error::Error {
        crate::error::Error::Corruption(format!("invalid utf-8 in metadata: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_full_record() {
        let meta = Metadata {
            mode: 0o100644,
            uid: 1000,
            owner_name: "alice".into(),
            gid: 1000,
            group_name: "alice".into(),
            atime_sec: 1_700_000_000,
            atime_nsec: 123,
            mtime_sec: 1_700_000_001,
            mtime_nsec: 456,
            ctime_sec: 1_700_000_002,
            ctime_nsec: 789,
            symlink_target: Some(b"/etc/passwd".to_vec()),
            xattrs: vec![ExtendedAttr {
                name: b"user.comment".to_vec(),
                value: b"hello".to_vec(),
            }],
            acl: Some(b"acl-blob".to_vec()),
        };
        let encoded = meta.encode();
        let decoded = Metadata::decode(&encoded).unwrap();
        assert_eq!(meta, decoded);
    }

    #[test]
    fn roundtrip_minimal_record() {
        let meta = Metadata::default();
        let encoded = meta.encode();
        let decoded = Metadata::decode(&encoded).unwrap();
        assert_eq!(meta, decoded);
        assert!(decoded.symlink_target.is_none());
        assert!(decoded.xattrs.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let err = Metadata::decode(&[0, 0, 0, 0, 1]).unwrap_err();
        assert!(matches!(err, crate::error::Error::Corruption(_)));
    }
}
