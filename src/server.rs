//! Server-side command dispatch, grounded on
//! `original_source/lib/bup/protocol.py`'s `_get_commands`/`BupProtocolServer`.
//!
//! Runs over any `Read + Write` pair: a pipe for the exec'd subprocess transport, or
//! the protocol half of a `DemuxConn` for TCP (the demultiplexed error/log stream is
//! the caller's concern, not this dispatcher's).

use std::io::{Read, Write};
use std::path::PathBuf;

use crate::binio::{ReadExt, WriteExt};
use crate::error::{Error, Result};
use crate::hash::Oid;
use crate::repo_local::LocalRepository;
use crate::wire::{read_line, write_error, write_line, write_ok};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerMode {
    Unrestricted,
    Append,
    ReadAppend,
    Read,
}

impl ServerMode {
    fn allows_read(self) -> bool {
        matches!(self, ServerMode::Unrestricted | ServerMode::ReadAppend | ServerMode::Read)
    }

    fn allows_write(self) -> bool {
        matches!(self, ServerMode::Unrestricted | ServerMode::Append | ServerMode::ReadAppend)
    }
}

const ALWAYS_COMMANDS: &[&str] = &[
    "quit",
    "help",
    "set-dir",
    "init-dir",
    "list-indexes",
    "send-index",
    "config-get",
    "config-write",
    "config-list",
];
const READ_COMMANDS: &[&str] = &["join", "cat", "cat-batch", "refs", "rev-list", "resolve", "read-ref"];
const WRITE_COMMANDS: &[&str] = &["receive-objects-v2", "update-ref", "delete-ref"];

fn allowed_commands(mode: ServerMode) -> Vec<&'static str> {
    let mut out = ALWAYS_COMMANDS.to_vec();
    if mode.allows_read() {
        out.extend(READ_COMMANDS);
    }
    if mode.allows_write() {
        out.extend(WRITE_COMMANDS);
    }
    out
}

pub struct Server<R, W> {
    reader: R,
    writer: W,
    mode: ServerMode,
    root: Option<PathBuf>,
    repo: Option<LocalRepository>,
}

impl<R: Read, W: Write> Server<R, W> {
    pub fn new(reader: R, writer: W, mode: ServerMode) -> Server<R, W> {
        Server {
            reader,
            writer,
            mode,
            root: None,
            repo: None,
        }
    }

    /// Serves commands until `quit` or the connection closes.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let line = match read_line(&mut self.reader) {
                Ok(l) => l,
                Err(Error::Protocol(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            if line == "quit" {
                tracing::debug!(target: "wire::server", "quit");
                return Ok(());
            }
            if let Err(e) = self.dispatch(&line) {
                tracing::debug!(target: "wire::server", error = %e, command = %line, "command failed");
                write_error(&mut self.writer, &e)?;
            }
        }
    }

    fn require_mode(&self, command: &str) -> Result<()> {
        let allowed = allowed_commands(self.mode);
        if allowed.contains(&command) {
            Ok(())
        } else {
            tracing::debug!(target: "wire::server", %command, mode = ?self.mode, "rejected by mode");
            Err(Error::PermissionDenied(format!(
                "{command} not permitted in this server's mode"
            )))
        }
    }

    fn repo_mut(&mut self) -> Result<&mut LocalRepository> {
        self.repo
            .as_mut()
            .ok_or_else(|| Error::Config("no repository selected (send set-dir/init-dir first)".into()))
    }

    fn dispatch(&mut self, line: &str) -> Result<()> {
        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();
        self.require_mode(command)?;

        match command {
            "help" => self.cmd_help(),
            "init-dir" => self.cmd_init_dir(rest),
            "set-dir" => self.cmd_set_dir(rest),
            "list-indexes" => self.cmd_list_indexes(),
            "send-index" => self.cmd_send_index(rest),
            "receive-objects-v2" => self.cmd_receive_objects_v2(),
            "read-ref" => self.cmd_read_ref(rest),
            "update-ref" => self.cmd_update_ref(rest),
            "delete-ref" => self.cmd_delete_ref(rest),
            "join" | "cat" => self.cmd_cat(rest),
            "cat-batch" => self.cmd_cat_batch(),
            "refs" => self.cmd_refs(rest),
            "rev-list" => self.cmd_rev_list(rest),
            "resolve" => self.cmd_resolve(rest),
            "config-get" => self.cmd_config_get(rest),
            "config-write" => self.cmd_config_write(rest),
            "config-list" => self.cmd_config_list(),
            other => Err(Error::Protocol(format!("unrecognized command: {other}"))),
        }
    }

    fn cmd_help(&mut self) -> Result<()> {
        write_line(&mut self.writer, "Commands:")?;
        for cmd in allowed_commands(self.mode) {
            write_line(&mut self.writer, &format!("    {cmd}"))?;
        }
        write_ok(&mut self.writer)
    }

    fn cmd_init_dir(&mut self, path: &str) -> Result<()> {
        let root = PathBuf::from(path);
        self.repo = Some(LocalRepository::create(&root)?);
        self.root = Some(root);
        write_ok(&mut self.writer)
    }

    fn cmd_set_dir(&mut self, path: &str) -> Result<()> {
        let root = PathBuf::from(path);
        self.repo = Some(LocalRepository::open(&root)?);
        self.root = Some(root);
        write_ok(&mut self.writer)
    }

    fn cmd_list_indexes(&mut self) -> Result<()> {
        let names = self.repo_mut()?.list_indexes();
        for name in names {
            write_line(&mut self.writer, &name)?;
        }
        write_ok(&mut self.writer)
    }

    fn cmd_send_index(&mut self, name: &str) -> Result<()> {
        let mut bytes = Vec::new();
        self.repo_mut()?.send_index(name, &mut bytes)?;
        self.writer.write_chunk(Some(&bytes))?;
        self.writer.write_chunk(None)?;
        write_ok(&mut self.writer)
    }

    /// `u32 L; L==0` finish, `L==0xFFFFFFFF` suspend, else `oid(20) ‖ crc32(4) ‖
    /// raw-object((L-24) bytes)` per object.
    fn cmd_receive_objects_v2(&mut self) -> Result<()> {
        loop {
            let l = self.reader.read_u32_be()?;
            if l == 0 {
                let base = self.repo_mut()?.finish_writing(true)?;
                tracing::debug!(target: "wire::server", pack = ?base, "receive-objects-v2 finished");
                break;
            }
            if l == 0xFFFF_FFFF {
                tracing::debug!(target: "wire::server", "receive-objects-v2 suspended");
                write_line(&mut self.writer, "suspended")?;
                return write_ok(&mut self.writer);
            }
            if l < 24 {
                return Err(Error::Protocol(format!("receive-objects-v2 frame too short: {l}")));
            }
            let oid_bytes = self.reader.read_exact_vec(20)?;
            let oid = Oid::from_slice(&oid_bytes)?;
            let crc32 = self.reader.read_u32_be()?;
            let raw = self.reader.read_exact_vec((l - 24) as usize)?;
            let repo = self.repo_mut()?;
            let is_new = repo.receive_raw_object(oid, crc32, &raw)?;
            // Every frame gets exactly one reply line so the client can always read
            // one response per object it sends, rather than guessing whether a
            // suggestion is coming: blank for a new object, `index <name>` for a
            // duplicate the client should fetch that index for.
            match repo.locate_index(&oid).filter(|_| !is_new) {
                Some(name) => {
                    tracing::debug!(target: "wire::server", oid = %oid, idx = %name, "object already present, suggesting index");
                    write_line(&mut self.writer, &format!("index {name}"))?;
                }
                None => write_line(&mut self.writer, "")?,
            }
        }
        write_ok(&mut self.writer)
    }

    fn cmd_read_ref(&mut self, name: &str) -> Result<()> {
        let oid = self.repo_mut()?.read_ref(name)?;
        write_line(&mut self.writer, &oid.map(|o| o.to_hex()).unwrap_or_default())?;
        write_ok(&mut self.writer)
    }

    fn cmd_update_ref(&mut self, rest: &str) -> Result<()> {
        let (name, new_hex, old_hex) = parse_three(rest)?;
        let new = Oid::from_hex(&new_hex)?;
        let old = if old_hex.is_empty() {
            None
        } else {
            Some(Oid::from_hex(&old_hex)?)
        };
        self.repo_mut()?.update_ref(&name, new, old)?;
        write_ok(&mut self.writer)
    }

    fn cmd_delete_ref(&mut self, rest: &str) -> Result<()> {
        let mut parts = rest.splitn(2, ' ');
        let name = parts.next().unwrap_or("").to_string();
        let old_hex = parts.next().unwrap_or("").trim();
        let old = if old_hex.is_empty() {
            None
        } else {
            Some(Oid::from_hex(old_hex)?)
        };
        self.repo_mut()?.delete_ref(&name, old)?;
        write_ok(&mut self.writer)
    }

    fn cmd_cat(&mut self, ref_or_oid: &str) -> Result<()> {
        let cat = self.repo_mut()?.cat(ref_or_oid)?;
        write_line(&mut self.writer, &format!("{} {}", cat.kind, cat.size))?;
        self.writer.write_chunk(Some(&cat.data))?;
        self.writer.write_chunk(None)?;
        write_ok(&mut self.writer)
    }

    fn cmd_cat_batch(&mut self) -> Result<()> {
        loop {
            let line = read_line(&mut self.reader)?;
            if line.is_empty() {
                break;
            }
            match self.repo_mut()?.cat(&line) {
                Ok(cat) => {
                    write_line(&mut self.writer, &format!("{} {} {}", cat.oid, cat.kind, cat.size))?;
                    self.writer.write_chunk(Some(&cat.data))?;
                }
                Err(Error::NotFound(_)) => {
                    write_line(&mut self.writer, "missing")?;
                }
                Err(e) => return Err(e),
            }
        }
        write_ok(&mut self.writer)
    }

    fn cmd_refs(&mut self, rest: &str) -> Result<()> {
        let (heads, tags) = match rest {
            "" | "heads" => (true, false),
            "tags" => (false, true),
            "all" => (true, true),
            other => return Err(Error::Protocol(format!("unrecognized refs selector: {other}"))),
        };
        for (name, oid) in self.repo_mut()?.refs(None, heads, tags)? {
            write_line(&mut self.writer, &format!("{} {}", oid.to_hex(), name))?;
        }
        write_ok(&mut self.writer)
    }

    fn cmd_rev_list(&mut self, head: &str) -> Result<()> {
        let repo = self.repo_mut()?;
        let mut cursor = repo.read_ref(&format!("refs/heads/{head}"))?;
        while let Some(oid) = cursor {
            let cat = repo.cat(&oid.to_hex())?;
            write_line(&mut self.writer, &oid.to_hex())?;
            let commit = crate::object::Commit::decode(&cat.data)?;
            cursor = commit.parents.first().copied();
        }
        write_ok(&mut self.writer)
    }

    fn cmd_resolve(&mut self, path: &str) -> Result<()> {
        let resolution = crate::vfs::resolve(self.repo_mut()?, path, true)?;
        for (name, item) in &resolution {
            write_line(&mut self.writer, &format!("{name:?} {item:?}"))?;
        }
        write_ok(&mut self.writer)
    }

    fn cmd_config_get(&mut self, name: &str) -> Result<()> {
        let value = self.repo_mut()?.config_get(name)?;
        write_line(&mut self.writer, &value.unwrap_or_default())?;
        write_ok(&mut self.writer)
    }

    fn cmd_config_write(&mut self, rest: &str) -> Result<()> {
        let mut parts = rest.splitn(2, ' ');
        let name = parts.next().unwrap_or("").to_string();
        let value = parts.next();
        self.repo_mut()?.config_write(&name, value)?;
        write_ok(&mut self.writer)
    }

    fn cmd_config_list(&mut self) -> Result<()> {
        for (k, v) in self.repo_mut()?.config_list() {
            write_line(&mut self.writer, &format!("{k}={v}"))?;
        }
        write_ok(&mut self.writer)
    }
}

fn parse_three(rest: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = rest.split(' ').collect();
    if parts.len() < 2 {
        return Err(Error::Protocol(format!("expected `name new [old]`, got {rest:?}")));
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parts.get(2).copied().unwrap_or("").to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn run_session(mode: ServerMode, input: &str) -> (String, Server<Cursor<Vec<u8>>, Vec<u8>>) {
        let mut server = Server::new(Cursor::new(input.as_bytes().to_vec()), Vec::new(), mode);
        server.run().unwrap();
        let out = String::from_utf8(server.writer.clone()).unwrap();
        (out, server)
    }

    #[test]
    fn help_lists_mode_filtered_commands() {
        let (out, _) = run_session(ServerMode::Read, "help\nquit\n");
        assert!(out.contains("config-get"));
        assert!(!out.contains("receive-objects-v2"));
    }

    #[test]
    fn write_commands_rejected_in_read_mode() {
        let dir = tempdir().unwrap();
        let input = format!(
            "init-dir {}\nreceive-objects-v2\nquit\n",
            dir.path().join("repo").display()
        );
        // init-dir itself is always-allowed, but the repo is created under Unrestricted
        // first so the rejection below is exercised against an existing repository.
        let _ = run_session(ServerMode::Unrestricted, &input);

        let input2 = format!("set-dir {}\nupdate-ref refs/heads/x 0000000000000000000000000000000000000000\nquit\n", dir.path().join("repo").display());
        let (out, _) = run_session(ServerMode::Read, &input2);
        assert!(out.contains("error"));
    }

    #[test]
    fn config_roundtrip_over_protocol() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        let input = format!(
            "init-dir {}\nconfig-write bup.split.files 13\nconfig-get bup.split.files\nquit\n",
            repo_path.display()
        );
        let (out, _) = run_session(ServerMode::Unrestricted, &input);
        assert!(out.contains("13"));
        assert!(!out.contains("error"));
    }
}
