//! Binary primitives shared by packs, idx files and the wire protocol.
//!
//! `ReadExt`/`WriteExt` generalize the teacher's `ArqRead` trait (which only read
//! Arq's big-endian plist-adjacent primitives) to the vocabulary this engine needs:
//! fixed-width big-endian integers (reused verbatim from the teacher's approach of
//! layering on `byteorder`), plus `vuint`/`vint`/`bvec`, the variable-length wire
//! primitives grounded on `orig:lib/bup/protocol.py`'s use of `bup.vint`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Error, Result};

pub trait ReadExt: Read {
    fn read_exact_vec(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_u8_be(&mut self) -> Result<u8> {
        Ok(self.read_u8()?)
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        Ok(self.read_u32::<BigEndian>()?)
    }

    fn read_u64_be(&mut self) -> Result<u64> {
        Ok(self.read_u64::<BigEndian>()?)
    }

    /// Unsigned LEB128-style varint, 7 bits of payload per byte, high bit = more.
    fn read_vuint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::Protocol("vuint too long".into()));
            }
        }
        Ok(result)
    }

    /// Zig-zag encoded signed varint.
    fn read_vint(&mut self) -> Result<i64> {
        let u = self.read_vuint()?;
        Ok(zigzag_decode(u))
    }

    /// `vuint length` followed by that many raw bytes.
    fn read_bvec(&mut self) -> Result<Vec<u8>> {
        let len = self.read_vuint()? as usize;
        self.read_exact_vec(len)
    }

    /// Big-endian u32 length prefix followed by that many bytes - the wire
    /// protocol's length-prefixed-chunk primitive (not the vuint `bvec`).
    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_u32::<BigEndian>()?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_exact_vec(len as usize)?))
    }
}

impl<R: Read + ?Sized> ReadExt for R {}

pub trait WriteExt: Write {
    fn write_u8_be(&mut self, v: u8) -> Result<()> {
        Ok(self.write_u8(v)?)
    }

    fn write_u32_be(&mut self, v: u32) -> Result<()> {
        Ok(self.write_u32::<BigEndian>(v)?)
    }

    fn write_u64_be(&mut self, v: u64) -> Result<()> {
        Ok(self.write_u64::<BigEndian>(v)?)
    }

    fn write_vuint(&mut self, mut v: u64) -> Result<()> {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.write_u8(byte)?;
                break;
            } else {
                self.write_u8(byte | 0x80)?;
            }
        }
        Ok(())
    }

    fn write_vint(&mut self, v: i64) -> Result<()> {
        self.write_vuint(zigzag_encode(v))
    }

    fn write_bvec(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_vuint(bytes.len() as u64)?;
        self.write_all(bytes)?;
        Ok(())
    }

    /// `None` writes the `L=0` terminator.
    fn write_chunk(&mut self, bytes: Option<&[u8]>) -> Result<()> {
        match bytes {
            Some(b) => {
                self.write_u32::<BigEndian>(b.len() as u32)?;
                self.write_all(b)?;
            }
            None => self.write_u32::<BigEndian>(0)?,
        }
        Ok(())
    }
}

impl<W: Write + ?Sized> WriteExt for W {}

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn vuint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            buf.write_vuint(v).unwrap();
            let mut cur = Cursor::new(buf);
            assert_eq!(cur.read_vuint().unwrap(), v);
        }
    }

    #[test]
    fn vint_roundtrip_negative() {
        for v in [0i64, -1, 1, -128, 128, i64::MIN + 1, i64::MAX] {
            let mut buf = Vec::new();
            buf.write_vint(v).unwrap();
            let mut cur = Cursor::new(buf);
            assert_eq!(cur.read_vint().unwrap(), v);
        }
    }

    #[test]
    fn bvec_roundtrip() {
        let mut buf = Vec::new();
        buf.write_bvec(b"hello world").unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(cur.read_bvec().unwrap(), b"hello world");
    }

    #[test]
    fn chunk_roundtrip_and_terminator() {
        let mut buf = Vec::new();
        buf.write_chunk(Some(b"abc")).unwrap();
        buf.write_chunk(None).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(cur.read_chunk().unwrap(), Some(b"abc".to_vec()));
        assert_eq!(cur.read_chunk().unwrap(), None);
    }
}
