//! Wire protocol framing primitives shared by the client and server.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::binio::{ReadExt, WriteExt};
use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 1982;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Err,
}

impl FrameKind {
    fn tag(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Err => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<FrameKind> {
        match tag {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Err),
            other => Err(Error::Protocol(format!("unknown demux frame kind {other}"))),
        }
    }
}

/// Multiplexes a single TCP socket into a protocol stream and an error/log stream,
/// each frame tagged `u8 kind, u32 length, bytes`.
pub struct DemuxConn {
    stream: TcpStream,
    pending_data: Vec<u8>,
}

impl DemuxConn {
    pub fn new(stream: TcpStream) -> DemuxConn {
        DemuxConn {
            stream,
            pending_data: Vec::new(),
        }
    }

    pub fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_frame(FrameKind::Data, bytes)
    }

    pub fn write_err(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_frame(FrameKind::Err, bytes)
    }

    fn write_frame(&mut self, kind: FrameKind, bytes: &[u8]) -> Result<()> {
        self.stream.write_u8_be(kind.tag())?;
        self.stream.write_u32_be(bytes.len() as u32)?;
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Reads frames from the socket until a `Data` frame is available, mirroring any
    /// `Err` frames to `log_sink` along the way.
    pub fn read_data(&mut self, log_sink: &mut impl Write) -> Result<Vec<u8>> {
        while self.pending_data.is_empty() {
            let tag = self.stream.read_u8_be()?;
            let kind = FrameKind::from_tag(tag)?;
            let len = self.stream.read_u32_be()? as usize;
            let bytes = self.stream.read_exact_vec(len)?;
            match kind {
                FrameKind::Data => self.pending_data = bytes,
                FrameKind::Err => log_sink.write_all(&bytes)?,
            }
        }
        Ok(std::mem::take(&mut self.pending_data))
    }
}

/// Reads a `\n`-terminated line (without the trailing newline).
pub fn read_line(reader: &mut impl Read) -> Result<String> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 {
            if bytes.is_empty() {
                return Err(Error::Protocol("connection closed reading line".into()));
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(String::from_utf8(bytes)?)
}

pub fn write_line(writer: &mut impl Write, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Consumes the trailing blank line + `ok`/`error <message>` that terminates every
/// command response, returning `Ok(())` or the classified remote error.
pub fn read_response_tail(reader: &mut impl Read) -> Result<()> {
    let blank = read_line(reader)?;
    if !blank.is_empty() {
        return Err(Error::Protocol(format!(
            "expected blank line before status, got {blank:?}"
        )));
    }
    let status = read_line(reader)?;
    if status == "ok" {
        Ok(())
    } else if let Some(message) = status.strip_prefix("error ") {
        Err(Error::classify_remote(message))
    } else {
        Err(Error::Protocol(format!("malformed status line: {status}")))
    }
}

pub fn write_ok(writer: &mut impl Write) -> Result<()> {
    write_line(writer, "")?;
    write_line(writer, "ok")
}

pub fn write_error(writer: &mut impl Write, err: &Error) -> Result<()> {
    write_line(writer, "")?;
    write_line(writer, &format!("error {}", err.to_wire_message()))
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Error {
        Error::Protocol(format!("invalid utf-8 on wire: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn line_roundtrip() {
        let mut buf = Vec::new();
        write_line(&mut buf, "help").unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_line(&mut cur).unwrap(), "help");
    }

    #[test]
    fn response_tail_ok() {
        let mut buf = Vec::new();
        write_ok(&mut buf).unwrap();
        let mut cur = Cursor::new(buf);
        assert!(read_response_tail(&mut cur).is_ok());
    }

    #[test]
    fn response_tail_error_classified() {
        let mut buf = Vec::new();
        write_error(&mut buf, &Error::NotFound("deadbeef".into())).unwrap();
        let mut cur = Cursor::new(buf);
        match read_response_tail(&mut cur) {
            Err(Error::NotFound(what)) => assert_eq!(what, "deadbeef"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
