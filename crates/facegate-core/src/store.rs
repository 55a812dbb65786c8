//! Enrolled identities and their face embeddings.
//!
//! The durable form is a single JSON document with two parallel arrays,
//! `identities` and `embeddings`. Every mutation rewrites the whole document
//! through a temp file in the same directory followed by a rename, so a
//! reader never observes a half-written database.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::types::{EncodingRecord, Embedding};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read encoding database {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write encoding database {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt encoding database {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// On-disk shape of the encoding database.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EncodingDatabase {
    identities: Vec<String>,
    embeddings: Vec<Vec<f32>>,
}

impl EncodingDatabase {
    fn from_records(records: &[EncodingRecord]) -> Self {
        Self {
            identities: records.iter().map(|r| r.identity.clone()).collect(),
            embeddings: records.iter().map(|r| r.embedding.values.clone()).collect(),
        }
    }

    fn into_records(self, path: &Path) -> Result<Vec<EncodingRecord>, StoreError> {
        if self.identities.len() != self.embeddings.len() {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                message: format!(
                    "{} identities but {} embeddings",
                    self.identities.len(),
                    self.embeddings.len()
                ),
            });
        }
        Ok(self
            .identities
            .into_iter()
            .zip(self.embeddings)
            .map(|(identity, values)| EncodingRecord::new(identity, Embedding::new(values)))
            .collect())
    }
}

/// In-memory encoding store backed by a JSON database file.
///
/// Reads take a shared lock, mutations an exclusive one, so enrollment and
/// verification may share one store across threads.
#[derive(Debug)]
pub struct EncodingStore {
    path: PathBuf,
    records: RwLock<Vec<EncodingRecord>>,
}

impl EncodingStore {
    /// Load the database, degrading to an empty store when it is missing or
    /// unreadable. The kiosk must stay startable with nobody enrolled.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match read_database(&path) {
            Ok(records) => {
                tracing::info!(
                    path = %path.display(),
                    records = records.len(),
                    "loaded face encodings"
                );
                Self::with_records(path, records)
            }
            Err(e) => {
                tracing::warn!(error = %e, "encoding database unavailable; starting empty");
                Self::with_records(path, Vec::new())
            }
        }
    }

    /// Strict load: a corrupt database is an error, a missing one is empty.
    pub fn try_load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            read_database(&path)?
        } else {
            Vec::new()
        };
        Ok(Self::with_records(path, records))
    }

    pub fn with_records(path: impl Into<PathBuf>, records: Vec<EncodingRecord>) -> Self {
        Self {
            path: path.into(),
            records: RwLock::new(records),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Case-sensitive identity lookup.
    pub fn contains(&self, identity: &str) -> bool {
        self.read().iter().any(|r| r.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Distinct identities in enrollment order, with their record counts.
    pub fn identities(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = Vec::new();
        for record in self.read().iter() {
            match out.iter_mut().find(|(name, _)| *name == record.identity) {
                Some((_, count)) => *count += 1,
                None => out.push((record.identity.clone(), 1)),
            }
        }
        out
    }

    /// Run `f` against the current records without copying them.
    pub fn with_gallery<R>(&self, f: impl FnOnce(&[EncodingRecord]) -> R) -> R {
        f(&self.read())
    }

    pub fn snapshot(&self) -> Vec<EncodingRecord> {
        self.read().clone()
    }

    /// Append records for `identity` and persist the full updated set.
    ///
    /// The in-memory view only changes once the file has been replaced.
    pub fn append(&self, identity: &str, embeddings: Vec<Embedding>) -> Result<usize, StoreError> {
        let mut records = self.write();
        let added = embeddings.len();
        let mut updated = records.clone();
        updated.extend(
            embeddings
                .into_iter()
                .map(|embedding| EncodingRecord::new(identity, embedding)),
        );

        write_database(&self.path, &updated)?;
        *records = updated;

        tracing::info!(identity, added, total = records.len(), "encodings appended");
        Ok(added)
    }

    /// Replace every record, as done by a full retrain.
    pub fn replace_all(&self, replacement: Vec<EncodingRecord>) -> Result<(), StoreError> {
        let mut records = self.write();
        write_database(&self.path, &replacement)?;
        *records = replacement;
        tracing::info!(total = records.len(), "encoding database rebuilt");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<EncodingRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<EncodingRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_database(path: &Path) -> Result<Vec<EncodingRecord>, StoreError> {
    let data = fs::read(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let db: EncodingDatabase =
        serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    db.into_records(path)
}

fn write_database(path: &Path, records: &[EncodingRecord]) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_err)?;

    let serialized = serde_json::to_vec(&EncodingDatabase::from_records(records))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        writer.write_all(&serialized).map_err(write_err)?;
        writer.flush().map_err(write_err)?;
    }
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    Ok(())
}
