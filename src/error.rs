use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::GadgetMode;

/// Failures raised by the modem, transfer and gadget subsystems.
#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for {expected:?} after `{command}`")]
    TransportTimeout { command: String, expected: String },

    #[error("modem transport I/O failed: {0}")]
    Transport(#[source] io::Error),

    #[error("failed to open serial port: {0}")]
    Serial(#[from] serialport::Error),

    #[error("modem did not answer the liveness probe")]
    ModemUnresponsive,

    #[error("network registration not confirmed after {attempts} polls")]
    RegistrationTimeout { attempts: u32 },

    #[error("bearer opened but no IP address was assigned")]
    NoIpAssigned,

    #[error("chunk at offset {offset} failed after {attempts} attempt(s)")]
    ChunkFailed { offset: u64, attempts: u32 },

    #[error("FTP PUT session failed to open: {0}")]
    SessionOpenFailed(String),

    #[error("FTP session close not confirmed after {bytes_sent} bytes")]
    CloseUnconfirmed { bytes_sent: u64 },

    #[error("upload cancelled at offset {offset}")]
    Cancelled { offset: u64 },

    #[error("failed to mount {}: {reason}", path.display())]
    MountFailed { path: PathBuf, reason: String },

    #[error("failed to unmount {}: {reason}", path.display())]
    UnmountFailed { path: PathBuf, reason: String },

    #[error("failed to load USB gadget: {0}")]
    GadgetLoadFailed(String),

    #[error("failed to unload USB gadget: {0}")]
    GadgetUnloadFailed(String),

    #[error("refusing to {requested} while device is {current}")]
    ModeConflict {
        current: GadgetMode,
        requested: &'static str,
    },

    #[error("source file missing: {}", .0.display())]
    FileMissing(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
