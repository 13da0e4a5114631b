//! In-memory gadget, host and activity counters for simulation mode and
//! tests. The "volume" is a plain directory; mount and unmount are
//! bookkeeping only.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;

use crate::core::activity::{ActivitySource, ControllerState, SECTOR_SIZE};
use crate::core::gadget::GadgetBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GadgetOp {
    Load,
    Unload,
    Mount,
    Unmount,
    Sync,
}

#[derive(Debug, Default)]
pub struct GadgetState {
    pub fail_load: bool,
    pub fail_mount: bool,
    pub fail_unmount: bool,

    loaded: bool,
    mounted: bool,
    host_connected: bool,
    write_sectors: u64,
    ops: Vec<GadgetOp>,
    /// Times the device was exposed and mounted at once.
    violations: u32,
}

fn lock(state: &Mutex<GadgetState>) -> MutexGuard<'_, GadgetState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimulatedGadget {
    state: Arc<Mutex<GadgetState>>,
}

pub struct SimulatedActivity {
    state: Arc<Mutex<GadgetState>>,
}

/// Drives the simulated host and inspects the simulated gadget.
#[derive(Clone)]
pub struct SimulatedHost {
    state: Arc<Mutex<GadgetState>>,
    volume: PathBuf,
}

impl SimulatedGadget {
    pub fn new(volume: PathBuf) -> (Self, SimulatedActivity, SimulatedHost) {
        let state = Arc::new(Mutex::new(GadgetState::default()));
        (
            Self {
                state: state.clone(),
            },
            SimulatedActivity {
                state: state.clone(),
            },
            SimulatedHost { state, volume },
        )
    }
}

impl GadgetBackend for SimulatedGadget {
    fn load_gadget(&self, _backing: &Path) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.ops.push(GadgetOp::Load);
        if state.fail_load {
            bail!("simulated gadget load failure");
        }
        if state.mounted {
            state.violations += 1;
        }
        state.loaded = true;
        Ok(())
    }

    fn unload_gadget(&self) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.ops.push(GadgetOp::Unload);
        if !state.loaded {
            bail!("gadget module not loaded");
        }
        state.loaded = false;
        Ok(())
    }

    fn mount(&self, _backing: &Path, _mount_point: &Path) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.ops.push(GadgetOp::Mount);
        if state.fail_mount {
            bail!("simulated mount failure");
        }
        if state.loaded {
            state.violations += 1;
        }
        state.mounted = true;
        Ok(())
    }

    fn sync(&self) {
        lock(&self.state).ops.push(GadgetOp::Sync);
    }

    fn unmount(&self, _mount_point: &Path) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.ops.push(GadgetOp::Unmount);
        if state.fail_unmount {
            bail!("simulated unmount failure");
        }
        if !state.mounted {
            bail!("not mounted");
        }
        state.mounted = false;
        Ok(())
    }
}

impl ActivitySource for SimulatedActivity {
    fn controller_state(&self) -> ControllerState {
        let state = lock(&self.state);
        match (state.loaded, state.host_connected) {
            (true, true) => ControllerState::Configured,
            (true, false) => ControllerState::Other("not attached".to_string()),
            (false, _) => ControllerState::Unavailable,
        }
    }

    fn write_sectors(&self) -> Option<u64> {
        Some(lock(&self.state).write_sectors)
    }
}

impl SimulatedHost {
    pub fn configure(&self, f: impl FnOnce(&mut GadgetState)) {
        f(&mut lock(&self.state));
    }

    /// Plug the host in. It only sees the device while the gadget is loaded.
    pub fn connect(&self) {
        lock(&self.state).host_connected = true;
    }

    pub fn disconnect(&self) {
        lock(&self.state).host_connected = false;
    }

    /// Write a file the way the host would, through the exposed gadget.
    pub fn write_file(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        if !(state.loaded && state.host_connected) {
            return Err(io::Error::other("volume is not exposed to the host"));
        }

        let path = self.volume.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        state.write_sectors += (contents.len() as u64).div_ceil(SECTOR_SIZE).max(1);
        Ok(())
    }

    pub fn ops(&self) -> Vec<GadgetOp> {
        lock(&self.state).ops.clone()
    }

    pub fn exclusivity_violations(&self) -> u32 {
        lock(&self.state).violations
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.state).loaded
    }

    pub fn is_mounted(&self) -> bool {
        lock(&self.state).mounted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_host_writes_only_while_exposed() {
        let temp = tempdir().unwrap();
        let (gadget, activity, host) = SimulatedGadget::new(temp.path().to_path_buf());
        host.connect();

        assert!(host.write_file("a.txt", b"x").is_err());
        assert_eq!(activity.controller_state(), ControllerState::Unavailable);

        gadget.load_gadget(Path::new("/dev/sim0")).unwrap();
        assert_eq!(activity.controller_state(), ControllerState::Configured);

        host.write_file("dir/a.txt", &[0u8; 1025]).unwrap();
        assert_eq!(activity.write_sectors(), Some(3));
        assert_eq!(fs::read(temp.path().join("dir/a.txt")).unwrap().len(), 1025);
    }

    #[test]
    fn test_overlap_is_recorded() {
        let temp = tempdir().unwrap();
        let (gadget, _activity, host) = SimulatedGadget::new(temp.path().to_path_buf());
        gadget.load_gadget(Path::new("/dev/sim0")).unwrap();
        gadget.mount(Path::new("/dev/sim0"), temp.path()).unwrap();
        assert_eq!(host.exclusivity_violations(), 1);
    }
}
