//! Evidence of failed verification attempts.

use facegate_hw::Frame;
use std::path::PathBuf;

pub trait FailureSink {
    /// Persist `frame` as evidence of a failed attempt on `identity`.
    /// Errors are logged; nothing is returned to the caller.
    fn record(&self, frame: &Frame, identity: Option<&str>);
}

/// Writes `<YYYY-MM-DD_HH-MM-SS>_<identity|unknown>.jpg` files into a directory.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn file_name(timestamp: chrono::DateTime<chrono::Local>, identity: Option<&str>) -> String {
        let who = identity.filter(|s| !s.is_empty()).unwrap_or("unknown");
        format!("{}_{who}.jpg", timestamp.format("%Y-%m-%d_%H-%M-%S"))
    }
}

impl FailureSink for DirectorySink {
    fn record(&self, frame: &Frame, identity: Option<&str>) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::error!(dir = %self.dir.display(), error = %e, "cannot create capture directory");
            return;
        }
        let path = self.dir.join(Self::file_name(chrono::Local::now(), identity));
        match frame.save(&path) {
            Ok(()) => tracing::warn!(path = %path.display(), "unauthorized access attempt recorded"),
            Err(e) => tracing::error!(error = %e, "failed to record unauthorized access"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_file_name_format() {
        let ts = chrono::Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .unwrap();
        assert_eq!(
            DirectorySink::file_name(ts, Some("alice")),
            "2024-03-09_14-05-07_alice.jpg"
        );
        assert_eq!(
            DirectorySink::file_name(ts, None),
            "2024-03-09_14-05-07_unknown.jpg"
        );
        assert_eq!(
            DirectorySink::file_name(ts, Some("")),
            "2024-03-09_14-05-07_unknown.jpg"
        );
    }

    #[test]
    fn test_record_writes_jpeg() {
        let tmp = TempDir::new().unwrap();
        let sink = DirectorySink::new(tmp.path().join("unauthorized_access"));
        let frame = Frame::new(vec![90u8; 64 * 48], 64, 48, 1).unwrap();

        sink.record(&frame, Some("bob"));

        let files: Vec<_> = std::fs::read_dir(tmp.path().join("unauthorized_access"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("_bob.jpg"));
    }

    #[test]
    fn test_record_error_is_swallowed() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let sink = DirectorySink::new(blocker.join("nested"));
        let frame = Frame::new(vec![0u8; 4], 2, 2, 0).unwrap();
        sink.record(&frame, None);
    }
}
