//! Named, mutable pointers to commits, with compare-and-swap updates.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::hash::Oid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefFamily {
    Head,
    Tag,
}

impl RefFamily {
    fn dir_name(&self) -> &'static str {
        match self {
            RefFamily::Head => "heads",
            RefFamily::Tag => "tags",
        }
    }
}

/// Manages `refs/heads/*` and `refs/tags/*` under a repository root.
pub struct RefStore {
    root: PathBuf,
}

fn is_valid_component(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && !name.starts_with('/')
        && !name.contains('\0')
        && name.chars().all(|c| c != '\\')
}

impl RefStore {
    pub fn new(repo_root: &Path) -> RefStore {
        RefStore {
            root: repo_root.join("refs"),
        }
    }

    fn path_for(&self, family: RefFamily, name: &str) -> Result<PathBuf> {
        if !is_valid_component(name) {
            return Err(Error::Config(format!("invalid ref name {name}")));
        }
        Ok(self.root.join(family.dir_name()).join(name))
    }

    pub fn read(&self, family: RefFamily, name: &str) -> Result<Option<Oid>> {
        let path = self.path_for(family, name)?;
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let hex = text.trim();
        Ok(Some(Oid::from_hex(hex)?))
    }

    /// CAS update: `old == None` requires the ref to not already exist.
    pub fn update(
        &self,
        family: RefFamily,
        name: &str,
        new: Oid,
        old: Option<Oid>,
    ) -> Result<()> {
        let path = self.path_for(family, name)?;
        let current = self.read(family, name)?;
        if current != old {
            return Err(Error::CasFailure {
                name: name.to_string(),
                expected: old.map(|o| o.to_hex()),
                found: current.map(|o| o.to_hex()),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", new.to_hex()))?;
        Ok(())
    }

    pub fn delete(&self, family: RefFamily, name: &str, old: Option<Oid>) -> Result<()> {
        let path = self.path_for(family, name)?;
        let current = self.read(family, name)?;
        if current != old {
            return Err(Error::CasFailure {
                name: name.to_string(),
                expected: old.map(|o| o.to_hex()),
                found: current.map(|o| o.to_hex()),
            });
        }
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Lists every ref across both families, optionally restricted to `heads`/`tags`
    /// and to glob-like patterns matching whole path components (`*` only).
    pub fn list(
        &self,
        patterns: Option<&[String]>,
        heads: bool,
        tags: bool,
    ) -> Result<Vec<(String, Oid)>> {
        let mut out = Vec::new();
        if heads {
            self.collect_family(RefFamily::Head, "refs/heads", patterns, &mut out)?;
        }
        if tags {
            self.collect_family(RefFamily::Tag, "refs/tags", patterns, &mut out)?;
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn collect_family(
        &self,
        family: RefFamily,
        prefix: &str,
        patterns: Option<&[String]>,
        out: &mut Vec<(String, Oid)>,
    ) -> Result<()> {
        let dir = self.root.join(family.dir_name());
        if !dir.exists() {
            return Ok(());
        }
        for entry in walk_files(&dir)? {
            let rel = entry
                .strip_prefix(&dir)
                .unwrap()
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            let full_name = format!("{prefix}/{rel}");
            if let Some(patterns) = patterns {
                if !patterns.iter().any(|p| glob_match(p, &full_name)) {
                    continue;
                }
            }
            if let Some(oid) = self.read(family, &rel)? {
                out.push((full_name, oid));
            }
        }
        Ok(())
    }
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_files(&path)?);
        } else {
            out.push(path);
        }
    }
    Ok(out)
}

/// Matches `pattern` against the *trailing* run of `candidate`'s path components,
/// one `*` wildcard per component: `main` and `heads/*` both match
/// `refs/heads/main`, but `refs/heads/*` does not match `refs/heads/a/b` (too many
/// trailing components).
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let candidate_parts: Vec<&str> = candidate.split('/').collect();
    if pattern_parts.len() > candidate_parts.len() {
        return false;
    }
    let offset = candidate_parts.len() - pattern_parts.len();
    pattern_parts
        .iter()
        .zip(candidate_parts[offset..].iter())
        .all(|(p, c)| *p == "*" || p == c)
}
