//! 160-bit content identifiers.
//!
//! Grounded on `object_encryption.rs::calculate_sha1sum` (the teacher already shins
//! a raw SHA-1 digest through the crate) and `utils.rs::convert_to_hex_string` for
//! the external hex rendering. The hash algorithm is fixed at SHA-1 per the
//! specification's Non-goals - there is no generic-over-hash abstraction here.

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

pub const OID_LEN: usize = 20;

/// A 20-byte object identifier. Renders as 40 lowercase hex characters externally.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid([u8; OID_LEN]);

impl Oid {
    pub fn from_bytes(bytes: [u8; OID_LEN]) -> Oid {
        Oid(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Oid> {
        if bytes.len() != OID_LEN {
            return Err(Error::Corruption(format!(
                "oid must be {OID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut buf = [0u8; OID_LEN];
        buf.copy_from_slice(bytes);
        Ok(Oid(buf))
    }

    pub fn from_hex(hex: &str) -> Result<Oid> {
        if hex.len() != OID_LEN * 2 {
            return Err(Error::Corruption(format!(
                "oidx must be {} hex characters, got {}",
                OID_LEN * 2,
                hex.len()
            )));
        }
        let mut buf = [0u8; OID_LEN];
        for i in 0..OID_LEN {
            let byte_str = &hex[i * 2..i * 2 + 2];
            buf[i] = u8::from_str_radix(byte_str, 16)
                .map_err(|_| Error::Corruption(format!("invalid hex in oidx: {hex}")))?;
        }
        Ok(Oid(buf))
    }

    pub fn as_bytes(&self) -> &[u8; OID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        crate::utils::convert_to_hex_string(&self.0)
    }

    /// The first byte, used as the fanout-table index in idx v2.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }
}

impl std::fmt::Debug for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn sha1sum(message: &[u8]) -> [u8; OID_LEN] {
    let mut sha = Sha1::new();
    sha.update(message);
    let digest = sha.finalize();
    let mut out = [0u8; OID_LEN];
    out.copy_from_slice(&digest);
    out
}

/// `oid = SHA1(kind-name || " " || decimal-size || NUL || payload)`.
pub fn object_oid(kind_name: &str, payload: &[u8]) -> Oid {
    let mut hasher = Sha1::new();
    hasher.update(kind_name.as_bytes());
    hasher.update(b" ");
    hasher.update(payload.len().to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut out = [0u8; OID_LEN];
    out.copy_from_slice(&digest);
    Oid(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_sha1sum() {
        let message = "message".as_bytes();
        assert_eq!(
            hex_literal::hex!("6f9b9af3cd6e8b8a73c2cdced37fe9f59226e27d"),
            sha1sum(message)
        );
    }

    #[test]
    fn oid_hex_roundtrip() {
        let oid = object_oid("blob", b"hello\n");
        let hex = oid.to_hex();
        assert_eq!(hex.len(), 40);
        let parsed = Oid::from_hex(&hex).unwrap();
        assert_eq!(oid, parsed);
    }

    #[test]
    fn empty_blob_oid_is_stable() {
        // The well-known "empty blob" oid, same constant as git's.
        let oid = object_oid("blob", b"");
        assert_eq!(oid.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }
}
