//! Enrollment: photos of an identity → embeddings → encoding store.
//!
//! Two entry points: `enroll_new` adds an identity that is not enrolled yet,
//! `retrain` rebuilds the whole store from a dataset tree laid out as
//! `<root>/<identity>/<photo>`. Re-enrolling an existing identity must go
//! through `retrain`.

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use thiserror::Error;

use crate::encoder::{DetectionMode, FaceEncoder};
use crate::store::{EncodingStore, StoreError};
use crate::types::{EncodingRecord, Embedding};

/// Photos wider than this are downsized before detection.
pub const MAX_IMAGE_WIDTH: u32 = 800;

const PHOTO_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("{0} is already enrolled; run a full retrain to re-enroll")]
    AlreadyEnrolled(String),
    #[error("photo directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no face could be encoded for {0}")]
    NoFacesEncoded(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoFace,
    Unreadable(String),
    EncodeFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPhoto {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// What one identity's enrollment produced.
#[derive(Debug, Clone)]
pub struct EnrollmentReport {
    pub identity: String,
    pub encoded: usize,
    pub skipped: Vec<SkippedPhoto>,
}

pub struct EnrollmentPipeline<'a, E: FaceEncoder + ?Sized> {
    encoder: &'a mut E,
    max_width: u32,
}

impl<'a, E: FaceEncoder + ?Sized> EnrollmentPipeline<'a, E> {
    pub fn new(encoder: &'a mut E) -> Self {
        Self {
            encoder,
            max_width: MAX_IMAGE_WIDTH,
        }
    }

    pub fn with_max_width(mut self, max_width: u32) -> Self {
        self.max_width = max_width.max(1);
        self
    }

    /// Encode every photo of `identity` and merge the embeddings into `store`.
    ///
    /// The store is left untouched when no photo yields an embedding.
    pub fn enroll_new(
        &mut self,
        store: &EncodingStore,
        identity: &str,
        dir: &Path,
    ) -> Result<EnrollmentReport, EnrollError> {
        if store.contains(identity) {
            return Err(EnrollError::AlreadyEnrolled(identity.to_string()));
        }

        let (embeddings, skipped) = self.encode_directory(dir)?;
        if embeddings.is_empty() {
            tracing::warn!(identity, skipped = skipped.len(), "no encodings produced; store not updated");
            return Err(EnrollError::NoFacesEncoded(identity.to_string()));
        }

        let encoded = store.append(identity, embeddings)?;
        tracing::info!(identity, encoded, skipped = skipped.len(), "identity enrolled");

        Ok(EnrollmentReport {
            identity: identity.to_string(),
            encoded,
            skipped,
        })
    }

    /// Rebuild the store from every identity directory under `dataset_root`.
    pub fn retrain(
        &mut self,
        store: &EncodingStore,
        dataset_root: &Path,
    ) -> Result<Vec<EnrollmentReport>, EnrollError> {
        let mut identities: Vec<(String, PathBuf)> = list_dir(dataset_root)?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| Some((p.file_name()?.to_str()?.to_string(), p)))
            .collect();
        identities.sort();

        let mut records = Vec::new();
        let mut reports = Vec::with_capacity(identities.len());
        for (identity, dir) in identities {
            tracing::info!(identity = %identity, "processing photos");
            let (embeddings, skipped) = self.encode_directory(&dir)?;
            reports.push(EnrollmentReport {
                identity: identity.clone(),
                encoded: embeddings.len(),
                skipped,
            });
            records.extend(
                embeddings
                    .into_iter()
                    .map(|e| EncodingRecord::new(identity.clone(), e)),
            );
        }

        store.replace_all(records)?;
        Ok(reports)
    }

    /// Encode all photos in `dir`, in file-name order.
    pub fn encode_directory(
        &mut self,
        dir: &Path,
    ) -> Result<(Vec<Embedding>, Vec<SkippedPhoto>), EnrollError> {
        if !dir.is_dir() {
            return Err(EnrollError::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut photos: Vec<PathBuf> = list_dir(dir)?.into_iter().filter(|p| is_photo(p)).collect();
        photos.sort();

        let mut embeddings = Vec::with_capacity(photos.len());
        let mut skipped = Vec::new();
        for path in photos {
            match self.encode_photo(&path) {
                Ok(embedding) => embeddings.push(embedding),
                Err(reason) => {
                    match &reason {
                        SkipReason::NoFace => {
                            tracing::warn!(photo = %path.display(), "no face found; skipping")
                        }
                        SkipReason::Unreadable(e) | SkipReason::EncodeFailed(e) => {
                            tracing::error!(photo = %path.display(), error = %e, "failed to process photo")
                        }
                    }
                    skipped.push(SkippedPhoto { path, reason });
                }
            }
        }

        Ok((embeddings, skipped))
    }

    /// Embedding of the most prominent face in one photo.
    fn encode_photo(&mut self, path: &Path) -> Result<Embedding, SkipReason> {
        let img = image::open(path).map_err(|e| SkipReason::Unreadable(e.to_string()))?;

        let img = if img.width() > self.max_width {
            let height = (img.height() as f64 * self.max_width as f64 / img.width() as f64)
                .round()
                .max(1.0) as u32;
            img.resize_exact(self.max_width, height, FilterType::Triangle)
        } else {
            img
        };
        let gray = img.to_luma8();
        let (width, height) = gray.dimensions();

        let faces = self
            .encoder
            .locate(gray.as_raw(), width, height, DetectionMode::Enrollment)
            .map_err(|e| SkipReason::EncodeFailed(e.to_string()))?;
        let face = faces
            .iter()
            .max_by(|a, b| a.area().total_cmp(&b.area()))
            .ok_or(SkipReason::NoFace)?;

        self.encoder
            .encode(gray.as_raw(), width, height, face)
            .map_err(|e| SkipReason::EncodeFailed(e.to_string()))
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, EnrollError> {
    let read_err = |source| EnrollError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    fs::read_dir(dir)
        .map_err(read_err)?
        .map(|entry| entry.map(|e| e.path()).map_err(read_err))
        .collect()
}

fn is_photo(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| PHOTO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}
