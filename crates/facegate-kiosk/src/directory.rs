//! The `name,phone` contact book used to reach users for fallback codes.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("cannot write directory {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Lower-cased name → phone number, backed by a line-oriented file.
pub struct Directory {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl Directory {
    /// Read the contact book. A missing or unreadable file yields an empty
    /// book; the kiosk keeps running without fallback contacts.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => parse(&text),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "directory unavailable; starting empty");
                HashMap::new()
            }
        };
        tracing::info!(path = %path.display(), contacts = entries.len(), "loaded directory");
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Phone number for `name`, compared case-insensitively.
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.trim().to_lowercase())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `name,phone` to the file unless the name is already present.
    /// An existing entry only has its in-memory number replaced; the file
    /// keeps the original line and `false` is returned.
    pub fn register(&self, name: &str, phone: &str) -> Result<bool, DirectoryError> {
        let key = name.trim().to_lowercase();
        let phone = phone.trim();
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = entries.get_mut(&key) {
            tracing::info!(name = %key, "contact already registered; file left unchanged");
            *current = phone.to_string();
            return Ok(false);
        }

        let write_err = |source| DirectoryError::Write {
            path: self.path.clone(),
            source,
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;
        write!(file, "\n{key},{phone}").map_err(write_err)?;

        entries.insert(key.clone(), phone.to_string());
        tracing::info!(name = %key, "registered contact");
        Ok(true)
    }
}

fn parse(text: &str) -> HashMap<String, String> {
    text.trim_start_matches('\u{feff}')
        .lines()
        .filter_map(|line| {
            let (name, phone) = line.split_once(',')?;
            let (name, phone) = (name.trim(), phone.trim());
            if name.is_empty() || phone.is_empty() {
                return None;
            }
            Some((name.to_lowercase(), phone.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bom_and_blank_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("phone_numbers.txt");
        std::fs::write(&path, "\u{feff}Alice , +15550001\n\n  \nbob,+15550002\nbroken line\n").unwrap();

        let dir = Directory::load(&path);
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.lookup("alice").as_deref(), Some("+15550001"));
        assert_eq!(dir.lookup("ALICE").as_deref(), Some("+15550001"));
        assert_eq!(dir.lookup("Bob").as_deref(), Some("+15550002"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = Directory::load("/nonexistent/phone_numbers.txt");
        assert!(dir.is_empty());
        assert!(dir.lookup("alice").is_none());
    }

    #[test]
    fn test_register_appends_and_skips_duplicates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("phone_numbers.txt");
        std::fs::write(&path, "alice,+15550001").unwrap();
        let dir = Directory::load(&path);

        assert!(dir.register("Carol", "+15550003").unwrap());
        assert!(!dir.register("ALICE", "+19999999").unwrap());
        assert_eq!(dir.lookup("carol").as_deref(), Some("+15550003"));
        assert_eq!(dir.lookup("alice").as_deref(), Some("+19999999"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "alice,+15550001\ncarol,+15550003");
        let reloaded = Directory::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.lookup("alice").as_deref(), Some("+15550001"));
    }
}
