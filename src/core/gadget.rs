//! USB gadget duty cycle.
//!
//! The backing store is either exposed to the host, mounted locally for
//! harvesting, or neither. It must never be both: the host and the local
//! kernel would each cache their own view of the filesystem.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Settle time after unloading the gadget before the device is reused.
pub const UNLOAD_SETTLE: Duration = Duration::from_secs(1);
/// Settle time between `sync` and unmount.
pub const SYNC_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GadgetMode {
    Exposed,
    LocallyMounted,
    Neither,
}

impl fmt::Display for GadgetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exposed => "exposed",
            Self::LocallyMounted => "locally mounted",
            Self::Neither => "detached",
        };
        f.write_str(s)
    }
}

/// OS operations behind the gadget controller.
///
/// NOTE: implementations may block (module loading, mount, sync). The daemon
/// runs a single cooperative loop, so nothing else is starved meanwhile.
pub trait GadgetBackend: Send + Sync {
    /// Expose `backing` as a removable, non-stalling mass-storage gadget.
    fn load_gadget(&self, backing: &Path) -> anyhow::Result<()>;

    fn unload_gadget(&self) -> anyhow::Result<()>;

    /// Mount `backing` at `mount_point`, clearing any stale mount first.
    fn mount(&self, backing: &Path, mount_point: &Path) -> anyhow::Result<()>;

    /// Flush dirty filesystem buffers.
    fn sync(&self);

    fn unmount(&self, mount_point: &Path) -> anyhow::Result<()>;
}

pub struct GadgetController {
    backend: Box<dyn GadgetBackend>,
    backing_path: PathBuf,
    mount_point: PathBuf,
    mode: GadgetMode,
    unload_settle: Duration,
    sync_settle: Duration,
}

impl GadgetController {
    pub fn new(
        backend: Box<dyn GadgetBackend>,
        backing_path: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            backing_path: backing_path.into(),
            mount_point: mount_point.into(),
            mode: GadgetMode::Neither,
            unload_settle: UNLOAD_SETTLE,
            sync_settle: SYNC_SETTLE,
        }
    }

    #[must_use]
    pub fn with_settle_delays(mut self, unload: Duration, sync: Duration) -> Self {
        self.unload_settle = unload;
        self.sync_settle = sync;
        self
    }

    pub fn mode(&self) -> GadgetMode {
        self.mode
    }

    /// Bring the device into a known `Neither` state at start-up, whatever a
    /// previous run left behind. Failures only mean there was nothing to
    /// undo.
    pub fn reset_to_neither(&mut self) {
        if let Err(e) = self.backend.unload_gadget() {
            debug!(error = %e, "No gadget to unload at start-up");
        }
        if let Err(e) = self.backend.unmount(&self.mount_point) {
            debug!(error = %e, "No stale mount at start-up");
        }
        self.mode = GadgetMode::Neither;
    }

    /// Expose the backing store to the host.
    pub async fn expose(&mut self) -> Result<()> {
        match self.mode {
            GadgetMode::Exposed => return Ok(()),
            GadgetMode::LocallyMounted => {
                return Err(Error::ModeConflict {
                    current: self.mode,
                    requested: "expose",
                });
            }
            GadgetMode::Neither => {}
        }

        self.backend
            .load_gadget(&self.backing_path)
            .map_err(|e| Error::GadgetLoadFailed(format!("{e:#}")))?;
        self.mode = GadgetMode::Exposed;
        info!(backing = %self.backing_path.display(), "Device exposed to host");
        Ok(())
    }

    pub async fn unexpose(&mut self) -> Result<()> {
        if self.mode != GadgetMode::Exposed {
            return Ok(());
        }

        self.backend
            .unload_gadget()
            .map_err(|e| Error::GadgetUnloadFailed(format!("{e:#}")))?;
        self.mode = GadgetMode::Neither;
        info!("Device detached from host");
        sleep(self.unload_settle).await;
        Ok(())
    }

    pub async fn mount_local(&mut self) -> Result<()> {
        match self.mode {
            GadgetMode::LocallyMounted => return Ok(()),
            GadgetMode::Exposed => {
                return Err(Error::ModeConflict {
                    current: self.mode,
                    requested: "mount locally",
                });
            }
            GadgetMode::Neither => {}
        }

        self.backend
            .mount(&self.backing_path, &self.mount_point)
            .map_err(|e| Error::MountFailed {
                path: self.mount_point.clone(),
                reason: format!("{e:#}"),
            })?;
        self.mode = GadgetMode::LocallyMounted;
        info!(mount_point = %self.mount_point.display(), "Mounted locally");
        Ok(())
    }

    pub async fn unmount_local(&mut self) -> Result<()> {
        if self.mode != GadgetMode::LocallyMounted {
            return Ok(());
        }

        self.backend.sync();
        sleep(self.sync_settle).await;
        self.backend
            .unmount(&self.mount_point)
            .map_err(|e| Error::UnmountFailed {
                path: self.mount_point.clone(),
                reason: format!("{e:#}"),
            })?;
        self.mode = GadgetMode::Neither;
        info!(mount_point = %self.mount_point.display(), "Unmounted");
        Ok(())
    }

    /// Flush the local mount after modifying it.
    pub fn sync(&self) {
        if self.mode == GadgetMode::LocallyMounted {
            self.backend.sync();
        }
    }

    /// Return to host exposure from any mode.
    pub async fn restore_exposure(&mut self) -> Result<()> {
        if let Err(e) = self.unmount_local().await {
            warn!(error = %e, "Cannot re-expose while the local mount persists");
            return Err(e);
        }
        self.expose().await
    }
}
