//! Typed ini-like configuration store.
//!
//! Generalizes the teacher's plist-backed structs (`folder.rs::Folder`,
//! `computer.rs::ComputerInfo` each held a flat bag of typed settings parsed from a
//! property list) to the `git-config`-shaped text format this engine's repositories
//! actually use: `[section]` headers, `key = value` lines, `#`/`;` comments.

use std::path::Path;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Ordered by insertion so a read-then-write roundtrip preserves section/key
    /// order for comment-free content.
    entries: Vec<(String, String, String)>,
}

fn split_name(name: &str) -> Result<(&str, &str)> {
    name.split_once('.')
        .ok_or_else(|| Error::Config(format!("config key {name} is missing a section prefix")))
}

impl Config {
    pub fn new() -> Config {
        Config { entries: Vec::new() }
    }

    pub fn parse(text: &str) -> Result<Config> {
        let mut config = Config::new();
        let mut section = String::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                let end = line.find(']').ok_or_else(|| {
                    Error::Config(format!("line {}: unterminated section header", lineno + 1))
                })?;
                section = line[1..end].trim().to_string();
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("line {}: expected key = value", lineno + 1))
            })?;
            config.set_raw(&section, key.trim(), value.trim());
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Ok(Config::new());
        }
        let text = std::fs::read_to_string(path)?;
        Config::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.serialize())?;
        Ok(())
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let mut current_section: Option<&str> = None;
        for (section, key, value) in &self.entries {
            if current_section != Some(section.as_str()) {
                if current_section.is_some() {
                    out.push('\n');
                }
                out.push_str(&format!("[{section}]\n"));
                current_section = Some(section.as_str());
            }
            out.push_str(&format!("\t{key} = {value}\n"));
        }
        out
    }

    fn set_raw(&mut self, section: &str, key: &str, value: &str) {
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|(s, k, _)| s == section && k == key)
        {
            e.2 = value.to_string();
        } else {
            self.entries
                .push((section.to_string(), key.to_string(), value.to_string()));
        }
    }

    fn get_raw(&self, section: &str, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(s, k, _)| s == section && k == key)
            .map(|(_, _, v)| v.as_str())
    }

    /// `name` is `section.key`, e.g. `bup.repo-id`.
    pub fn get_str(&self, name: &str) -> Result<Option<String>> {
        let (section, key) = split_name(name)?;
        Ok(self.get_raw(section, key).map(|v| v.to_string()))
    }

    pub fn get_int(&self, name: &str) -> Result<Option<i64>> {
        match self.get_str(name)? {
            Some(v) => Ok(Some(v.parse().map_err(|_| {
                Error::Config(format!("{name} is not a valid integer: {v}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get_str(name)? {
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "0" | "off" => Ok(Some(false)),
                _ => Err(Error::Config(format!("{name} is not a valid boolean: {v}"))),
            },
            None => Ok(None),
        }
    }

    pub fn get_path(&self, name: &str) -> Result<Option<std::path::PathBuf>> {
        Ok(self.get_str(name)?.map(std::path::PathBuf::from))
    }

    /// `None` deletes the key.
    pub fn write(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let (section, key) = split_name(name)?;
        match value {
            Some(v) => self.set_raw(section, key, v),
            None => self
                .entries
                .retain(|(s, k, _)| !(s == section && k == key)),
        }
        Ok(())
    }

    /// Iterates `(section.key, value)` pairs in file order.
    pub fn list(&self) -> impl Iterator<Item = (String, &str)> {
        self.entries
            .iter()
            .map(|(s, k, v)| (format!("{s}.{k}"), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_comments() {
        let text = "# comment\n[bup]\n\trepo-id = abc123\n\tdumb-server = true\n";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.get_str("bup.repo-id").unwrap(), Some("abc123".to_string()));
        assert_eq!(config.get_bool("bup.dumb-server").unwrap(), Some(true));
    }

    #[test]
    fn write_then_delete_roundtrip() {
        let mut config = Config::new();
        config.write("bup.split.files", Some("seq:15")).unwrap();
        assert_eq!(
            config.get_str("bup.split.files").unwrap(),
            Some("seq:15".to_string())
        );
        config.write("bup.split.files", None).unwrap();
        assert_eq!(config.get_str("bup.split.files").unwrap(), None);
    }

    #[test]
    fn serialize_parse_roundtrip_preserves_order() {
        let mut config = Config::new();
        config.write("bup.repo-id", Some("r1")).unwrap();
        config.write("bup.dumb-server", Some("false")).unwrap();
        config.write("pack.compression", Some("6")).unwrap();
        let text = config.serialize();
        let reparsed = Config::parse(&text).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn rejects_malformed_int() {
        let mut config = Config::new();
        config.write("pack.compression", Some("nope")).unwrap();
        assert!(config.get_int("pack.compression").is_err());
    }

    #[test]
    fn key_without_section_prefix_is_rejected() {
        let config = Config::new();
        assert!(config.get_str("repo-id").is_err());
    }
}
