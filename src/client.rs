//! Client-side protocol state machine, grounded on
//! `original_source/lib/bup/client.py`'s `Client`/`PackWriter_Remote`.
//!
//! Every call here is `idle → busy(<command>) → idle`: it writes the command line,
//! reads the response body, then consumes the trailing blank+status line. On a
//! protocol-level error mid-response the call still drains to the next blank+status
//! before surfacing the error, so the connection is left usable for the next command.

use std::io::{Read, Write};

use crate::binio::{ReadExt, WriteExt};
use crate::error::{Error, Result};
use crate::hash::Oid;
use crate::object::ObjectKind;
use crate::pack::build_raw_object;
use crate::wire::{read_line, read_response_tail, write_line};

#[derive(Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Busy(String),
}

pub struct Client<R, W> {
    reader: R,
    writer: W,
    state: State,
    advertised: Vec<String>,
}

impl<R: Read, W: Write> Client<R, W> {
    /// Performs the handshake: sends `help`, records the advertised command set.
    pub fn connect(mut reader: R, mut writer: W) -> Result<Client<R, W>> {
        write_line(&mut writer, "help")?;
        let header = read_line(&mut reader)?;
        if header != "Commands:" {
            return Err(Error::Protocol(format!("unexpected handshake header: {header}")));
        }
        let mut advertised = Vec::new();
        loop {
            let line = read_line(&mut reader)?;
            if line.is_empty() {
                break;
            }
            advertised.push(line.trim().to_string());
        }
        read_response_tail(&mut reader)?;
        Ok(Client {
            reader,
            writer,
            state: State::Idle,
            advertised,
        })
    }

    pub fn advertises(&self, command: &str) -> bool {
        self.advertised.iter().any(|c| c == command)
    }

    fn begin(&mut self, command: &str) -> Result<()> {
        if !self.advertises(command) {
            return Err(Error::PermissionDenied(format!(
                "server did not advertise {command}"
            )));
        }
        self.state = State::Busy(command.to_string());
        Ok(())
    }

    /// Consumes the blank+status tail and returns to `idle`, regardless of outcome.
    /// On error, any lines already buffered by the caller before the tail must have
    /// been fully read; if a mid-response desync is suspected, `resync` drains extra
    /// lines first.
    fn finish(&mut self) -> Result<()> {
        let result = read_response_tail(&mut self.reader);
        self.state = State::Idle;
        result
    }

    /// Drains lines until a blank+status tail is found, recovering from a command
    /// whose response shape the caller didn't fully consume.
    fn resync(&mut self) -> Result<()> {
        loop {
            match read_line(&mut self.reader) {
                Ok(line) if line.is_empty() => {
                    let status = read_line(&mut self.reader)?;
                    self.state = State::Idle;
                    return if status == "ok" {
                        Ok(())
                    } else if let Some(message) = status.strip_prefix("error ") {
                        Err(Error::classify_remote(message))
                    } else {
                        Err(Error::Protocol(format!("malformed status line: {status}")))
                    };
                }
                Ok(_) => continue,
                Err(e) => {
                    self.state = State::Idle;
                    return Err(e);
                }
            }
        }
    }

    pub fn set_dir(&mut self, path: &str) -> Result<()> {
        self.begin("set-dir")?;
        write_line(&mut self.writer, &format!("set-dir {path}"))?;
        self.finish()
    }

    pub fn init_dir(&mut self, path: &str) -> Result<()> {
        self.begin("init-dir")?;
        write_line(&mut self.writer, &format!("init-dir {path}"))?;
        self.finish()
    }

    pub fn list_indexes(&mut self) -> Result<Vec<String>> {
        self.begin("list-indexes")?;
        write_line(&mut self.writer, "list-indexes")?;
        let mut names = Vec::new();
        loop {
            match read_line(&mut self.reader) {
                Ok(line) if line.is_empty() => break,
                Ok(line) => names.push(line),
                Err(e) => {
                    self.state = State::Idle;
                    return Err(e);
                }
            }
        }
        read_response_tail(&mut self.reader)?;
        self.state = State::Idle;
        Ok(names)
    }

    pub fn send_index(&mut self, name: &str) -> Result<Vec<u8>> {
        self.begin("send-index")?;
        write_line(&mut self.writer, &format!("send-index {name}"))?;
        let mut out = Vec::new();
        while let Some(chunk) = self.reader.read_chunk()? {
            out.extend_from_slice(&chunk);
        }
        self.finish()?;
        Ok(out)
    }

    pub fn read_ref(&mut self, name: &str) -> Result<Option<Oid>> {
        self.begin("read-ref")?;
        write_line(&mut self.writer, &format!("read-ref {name}"))?;
        let line = read_line(&mut self.reader)?;
        self.finish()?;
        if line.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Oid::from_hex(&line)?))
        }
    }

    pub fn update_ref(&mut self, name: &str, new: Oid, old: Option<Oid>) -> Result<()> {
        self.begin("update-ref")?;
        let old_hex = old.map(|o| o.to_hex()).unwrap_or_default();
        write_line(&mut self.writer, &format!("update-ref {name} {} {old_hex}", new.to_hex()))?;
        self.finish()
    }

    pub fn delete_ref(&mut self, name: &str, old: Option<Oid>) -> Result<()> {
        self.begin("delete-ref")?;
        let old_hex = old.map(|o| o.to_hex()).unwrap_or_default();
        write_line(&mut self.writer, &format!("delete-ref {name} {old_hex}"))?;
        self.finish()
    }

    pub fn cat(&mut self, ref_or_oid: &str) -> Result<(ObjectKind, Vec<u8>)> {
        self.begin("cat")?;
        write_line(&mut self.writer, &format!("cat {ref_or_oid}"))?;
        let header = read_line(&mut self.reader)?;
        let mut parts = header.splitn(2, ' ');
        let kind_name = parts.next().unwrap_or("");
        let kind = match kind_name {
            "blob" => ObjectKind::Blob,
            "tree" => ObjectKind::Tree,
            "commit" => ObjectKind::Commit,
            other => {
                let _ = self.resync();
                return Err(Error::Protocol(format!("unrecognized object kind: {other}")));
            }
        };
        let mut data = Vec::new();
        while let Some(chunk) = self.reader.read_chunk()? {
            data.extend_from_slice(&chunk);
        }
        self.finish()?;
        Ok((kind, data))
    }

    pub fn refs(&mut self, selector: &str) -> Result<Vec<(String, Oid)>> {
        self.begin("refs")?;
        write_line(&mut self.writer, &format!("refs {selector}"))?;
        let mut out = Vec::new();
        loop {
            match read_line(&mut self.reader) {
                Ok(line) if line.is_empty() => break,
                Ok(line) => {
                    let mut parts = line.splitn(2, ' ');
                    let oid = Oid::from_hex(parts.next().unwrap_or(""))?;
                    let name = parts.next().unwrap_or("").to_string();
                    out.push((name, oid));
                }
                Err(e) => {
                    self.state = State::Idle;
                    return Err(e);
                }
            }
        }
        read_response_tail(&mut self.reader)?;
        self.state = State::Idle;
        Ok(out)
    }

    pub fn config_get(&mut self, name: &str) -> Result<Option<String>> {
        self.begin("config-get")?;
        write_line(&mut self.writer, &format!("config-get {name}"))?;
        let value = read_line(&mut self.reader)?;
        self.finish()?;
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    pub fn config_write(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.begin("config-write")?;
        write_line(
            &mut self.writer,
            &format!("config-write {name} {}", value.unwrap_or("")),
        )?;
        self.finish()
    }

    /// Begins a `receive-objects-v2` session; stays `busy` across many `push_object`
    /// calls until `finish_receive` sends the terminating `L=0` frame.
    pub fn begin_receive_objects(&mut self) -> Result<()> {
        self.begin("receive-objects-v2")?;
        write_line(&mut self.writer, "receive-objects-v2")?;
        Ok(())
    }

    /// Sends one object frame and returns any `index <name>` suggestion the server
    /// sent back for it, which the caller should route to its local idx cache.
    /// The server always replies with exactly one line per frame - blank for
    /// a new object, `index <name>` for a duplicate - so this always reads that line
    /// before returning, keeping the connection in sync for the next frame. Requires
    /// `begin_receive_objects` to have been called first.
    pub fn push_object(&mut self, kind: ObjectKind, payload: &[u8]) -> Result<Option<String>> {
        if self.state != State::Busy("receive-objects-v2".to_string()) {
            return Err(Error::Protocol("push_object outside a receive-objects-v2 session".into()));
        }
        let (oid, crc32, raw) = build_raw_object(kind, payload)?;
        self.writer.write_u32_be((raw.len() + 24) as u32)?;
        self.writer.write_all(oid.as_bytes())?;
        self.writer.write_u32_be(crc32)?;
        self.writer.write_all(&raw)?;
        let line = read_line(&mut self.reader)?;
        Ok(line.strip_prefix("index ").map(|name| name.to_string()))
    }

    /// Suspends the in-progress session: sends the `0xFFFFFFFF` frame and reads the
    /// server's `suspended` acknowledgement, leaving the pack open on the server side
    /// for a later `begin_receive_objects` to resume.
    pub fn suspend_receive(&mut self) -> Result<()> {
        self.writer.write_u32_be(0xFFFF_FFFF)?;
        let line = read_line(&mut self.reader)?;
        if line != "suspended" {
            return Err(Error::Protocol(format!("expected suspended ack, got {line:?}")));
        }
        self.finish()
    }

    /// Resumes a session suspended by `suspend_receive`, picking up the same pack
    /// the server left open.
    pub fn resume_receive_objects(&mut self) -> Result<()> {
        self.begin_receive_objects()
    }

    pub fn finish_receive(&mut self) -> Result<()> {
        self.writer.write_u32_be(0)?;
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn handshake_records_advertised_commands() {
        let mut response = Vec::new();
        write_line(&mut response, "Commands:").unwrap();
        for cmd in ["quit", "help", "set-dir", "config-get"] {
            write_line(&mut response, &format!("    {cmd}")).unwrap();
        }
        write_line(&mut response, "").unwrap();
        write_line(&mut response, "ok").unwrap();

        let client = Client::connect(Cursor::new(response), Vec::new()).unwrap();
        assert!(client.advertises("config-get"));
        assert!(!client.advertises("receive-objects-v2"));
    }
}
