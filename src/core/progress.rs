//! Durable upload progress.
//!
//! A single JSON record describing the one in-flight (or most recently
//! interrupted) transfer. It lives outside the monitored volume so it survives
//! the volume being detached, a crash, or a power cut, and lets the next
//! attempt resume with FTP append semantics instead of starting over.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Records older than this are ignored.
pub const MAX_RECORD_AGE_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Absolute path of the file being uploaded.
    pub file_identity: String,
    pub bytes_sent: u64,
    pub recorded_at: DateTime<Utc>,
}

impl TransferProgress {
    pub fn new(file: &Path, bytes_sent: u64) -> Self {
        Self {
            file_identity: file.to_string_lossy().into_owned(),
            bytes_sent,
            recorded_at: Utc::now(),
        }
    }

    /// Usable for resuming `file` at `now`. A record stamped after `now`
    /// means the clock moved backwards and its age is unknown.
    pub fn is_valid_for(&self, file: &Path, now: DateTime<Utc>) -> bool {
        let age = now - self.recorded_at;
        self.file_identity == file.to_string_lossy()
            && age >= TimeDelta::zero()
            && age.num_seconds() < MAX_RECORD_AGE_SECS
    }

    pub fn percentage(&self, file_size: u64) -> u8 {
        percentage(self.bytes_sent, file_size)
    }
}

/// `floor(100 * sent / total)`, clamped to 100. Empty totals report 100.
pub fn percentage(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent as u128 * 100) / total as u128).min(100) as u8
}

/// File-backed store for the single progress record. Last writer wins.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record, if one exists and parses.
    pub fn load(&self) -> Option<TransferProgress> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read progress record");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt progress record");
                None
            }
        }
    }

    /// Offset to resume `file` from, when a fresh record for it exists.
    pub fn resume_offset(&self, file: &Path, now: DateTime<Utc>) -> Option<u64> {
        let record = self.load()?;
        if record.is_valid_for(file, now) {
            Some(record.bytes_sent)
        } else {
            debug!(
                recorded = %record.file_identity,
                recorded_at = %record.recorded_at,
                "Progress record not applicable"
            );
            None
        }
    }

    pub fn save(&self, file: &Path, bytes_sent: u64) -> io::Result<()> {
        self.save_record(&TransferProgress::new(file, bytes_sent))
    }

    /// Write via a temp file and rename, so a power cut never leaves a torn
    /// record behind.
    pub fn save_record(&self, record: &TransferProgress) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec(record).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_resume_same_file() {
        let temp = tempdir().unwrap();
        let store = ProgressStore::new(temp.path().join("state/progress.json"));
        let file = Path::new("/mnt/usb_share/log.bin");

        store.save(file, 4096).unwrap();

        assert_eq!(store.resume_offset(file, Utc::now()), Some(4096));
        assert_eq!(store.load().unwrap().bytes_sent, 4096);
    }

    #[test]
    fn test_other_file_is_not_resumed() {
        let temp = tempdir().unwrap();
        let store = ProgressStore::new(temp.path().join("progress.json"));

        store.save(Path::new("/mnt/a.bin"), 100).unwrap();

        assert_eq!(store.resume_offset(Path::new("/mnt/b.bin"), Utc::now()), None);
    }

    #[test]
    fn test_stale_record_is_ignored() {
        let temp = tempdir().unwrap();
        let store = ProgressStore::new(temp.path().join("progress.json"));
        let file = Path::new("/mnt/a.bin");

        let record = TransferProgress {
            file_identity: file.to_string_lossy().into_owned(),
            bytes_sent: 100,
            recorded_at: Utc::now() - TimeDelta::minutes(61),
        };
        store.save_record(&record).unwrap();

        assert_eq!(store.resume_offset(file, Utc::now()), None);
    }

    #[test]
    fn test_record_from_the_future_is_ignored() {
        let file = Path::new("/mnt/a.bin");
        let now = Utc::now();
        let record = TransferProgress {
            file_identity: file.to_string_lossy().into_owned(),
            bytes_sent: 100,
            recorded_at: now + TimeDelta::minutes(5),
        };

        assert!(!record.is_valid_for(file, now));
        assert!(record.is_valid_for(file, now + TimeDelta::minutes(6)));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let temp = tempdir().unwrap();
        let store = ProgressStore::new(temp.path().join("progress.json"));

        store.save(Path::new("/mnt/a.bin"), 1).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();

        assert!(store.load().is_none());
    }

    #[test]
    fn test_corrupt_record_is_absent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("progress.json");
        fs::write(&path, b"{not json").unwrap();

        let store = ProgressStore::new(path);
        assert!(store.load().is_none());
    }

    #[test]
    fn test_percentage_floors() {
        assert_eq!(percentage(0, 3), 0);
        assert_eq!(percentage(2, 3), 66);
        assert_eq!(percentage(3, 3), 100);
        assert_eq!(percentage(0, 0), 100);
        assert_eq!(percentage(u64::MAX, u64::MAX), 100);
    }
}
