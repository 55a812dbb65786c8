//! New-user registration: photo capture into the dataset, contact
//! registration, and enrollment of the captured photos.

use facegate_core::enrollment::EnrollmentReport;
use facegate_core::{EncodingStore, EnrollError, EnrollmentPipeline, FaceEncoder};
use facegate_hw::{Frame, FrameError};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::directory::{Directory, DirectoryError};

pub const MIN_CAPTURES: usize = 3;
pub const MAX_CAPTURES: usize = 10;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("'{0}' is not a usable name; use a single word without path separators")]
    InvalidName(String),
    #[error("'{0}' is already enrolled")]
    AlreadyEnrolled(String),
    #[error("phone number must not be empty")]
    EmptyPhone,
    #[error("{taken} photos captured; at least {required} are needed")]
    TooFewCaptures { taken: usize, required: usize },
    #[error("capture limit of {0} photos reached")]
    CaptureLimit(usize),
    #[error("cannot create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to save photo: {0}")]
    Photo(#[from] FrameError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
}

pub struct RegistrationSession {
    name: String,
    phone: String,
    dir: PathBuf,
    /// Photos written by this session, in capture order.
    photos: Vec<PathBuf>,
    created_dir: bool,
}

impl RegistrationSession {
    /// Photos land in `<dataset_root>/<name>/`. The name must be a single
    /// plain path component and not yet enrolled in `store`.
    pub fn new(
        dataset_root: &Path,
        name: &str,
        phone: &str,
        store: &EncodingStore,
    ) -> Result<Self, RegistrationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        let mut components = Path::new(name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) || name.contains(|c| c == '/' || c == '\\')
        {
            return Err(RegistrationError::InvalidName(name.to_string()));
        }
        if store.contains(name) {
            return Err(RegistrationError::AlreadyEnrolled(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            phone: phone.trim().to_string(),
            dir: dataset_root.join(name),
            photos: Vec::new(),
            created_dir: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn captured(&self) -> usize {
        self.photos.len()
    }

    pub fn photo_dir(&self) -> &Path {
        &self.dir
    }

    /// Save `frame` as `<name>_NN.png`, NN counting from 01.
    pub fn capture(&mut self, frame: &Frame) -> Result<PathBuf, RegistrationError> {
        if self.photos.len() >= MAX_CAPTURES {
            return Err(RegistrationError::CaptureLimit(MAX_CAPTURES));
        }
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(|source| RegistrationError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;
            self.created_dir = true;
        }

        let path = self
            .dir
            .join(format!("{}_{:02}.png", self.name, self.photos.len() + 1));
        frame.save(&path)?;
        self.photos.push(path.clone());
        tracing::info!(name = %self.name, count = self.photos.len(), path = %path.display(), "photo captured");
        Ok(path)
    }

    /// Record the contact number, then enroll the captured photos.
    ///
    /// Validation failures leave the session untouched so capturing can
    /// continue. The contact is written first, so `finish` can be retried
    /// after a failed enrollment.
    pub fn finish<E: FaceEncoder + ?Sized>(
        &self,
        directory: &Directory,
        pipeline: &mut EnrollmentPipeline<'_, E>,
        store: &EncodingStore,
    ) -> Result<EnrollmentReport, RegistrationError> {
        if self.phone.is_empty() {
            return Err(RegistrationError::EmptyPhone);
        }
        if self.photos.len() < MIN_CAPTURES {
            return Err(RegistrationError::TooFewCaptures {
                taken: self.photos.len(),
                required: MIN_CAPTURES,
            });
        }

        directory.register(&self.name, &self.phone)?;
        let report = pipeline.enroll_new(store, &self.name, &self.dir)?;
        tracing::info!(name = %self.name, encoded = report.encoded, "registration complete");
        Ok(report)
    }

    /// Abandon registration, deleting the photos this session took. The
    /// photo directory goes too when this session created it and it is
    /// empty afterwards.
    pub fn cancel(self) {
        for photo in &self.photos {
            if let Err(e) = std::fs::remove_file(photo) {
                tracing::warn!(path = %photo.display(), error = %e, "failed to remove photo");
            }
        }
        if self.created_dir {
            if let Err(e) = std::fs::remove_dir(&self.dir) {
                tracing::warn!(dir = %self.dir.display(), error = %e, "photo directory left in place");
            }
        }
        tracing::info!(name = %self.name, removed = self.photos.len(), "registration cancelled");
    }
}
