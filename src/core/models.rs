use std::path::PathBuf;

/// A file found on the locally mounted volume during one harvest cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestCandidate {
    pub absolute_path: PathBuf,
    /// Directory relative to the scanned root, mirrored on the server so
    /// equal names in different folders never overwrite each other.
    pub relative_dir: PathBuf,
    pub size_bytes: u64,
}

/// Outcome of one harvest cycle or boot drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestReport {
    /// Uploaded and deleted from the volume.
    pub uploaded: Vec<PathBuf>,
    /// Left on the volume for the next cycle.
    pub failed: Vec<PathBuf>,
    pub bytes_uploaded: u64,
}

impl HarvestReport {
    pub fn is_empty(&self) -> bool {
        self.uploaded.is_empty() && self.failed.is_empty()
    }
}
