use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use nix::mount::umount;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::core::activity::{ActivitySource, ControllerState, block_stat_path, parse_write_sectors};
use crate::core::gadget::GadgetBackend;

/// `g_mass_storage`-style legacy gadget driven through `modprobe` and
/// `mount(8)`.
pub struct LinuxGadget {
    module: String,
}

impl LinuxGadget {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
        }
    }
}

fn run(command: &mut Command, what: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("Failed to run {what}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} failed ({}): {}", output.status, stderr.trim());
    }
    Ok(())
}

impl GadgetBackend for LinuxGadget {
    fn load_gadget(&self, backing: &Path) -> Result<()> {
        debug!(module = %self.module, backing = %backing.display(), "Loading gadget module");
        run(
            Command::new("modprobe")
                .arg(&self.module)
                .arg(format!("file={}", backing.display()))
                .args(["stall=0", "removable=1"]),
            "modprobe",
        )
    }

    fn unload_gadget(&self) -> Result<()> {
        debug!(module = %self.module, "Unloading gadget module");
        run(Command::new("modprobe").args(["-r", &self.module]), "modprobe -r")
    }

    fn mount(&self, backing: &Path, mount_point: &Path) -> Result<()> {
        fs::create_dir_all(mount_point)
            .with_context(|| format!("Failed to create {}", mount_point.display()))?;

        if umount(mount_point).is_ok() {
            warn!(mount_point = %mount_point.display(), "Cleared stale mount");
        }

        let mut command = Command::new("mount");
        // Image files need a loop device
        if !backing.starts_with("/dev") {
            command.args(["-o", "loop"]);
        }
        run(command.arg(backing).arg(mount_point), "mount")
    }

    fn sync(&self) {
        nix::unistd::sync();
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        umount(mount_point).with_context(|| format!("umount {}", mount_point.display()))
    }
}

/// UDC state and block counters from sysfs.
pub struct SysfsActivitySource {
    udc_class_dir: PathBuf,
    stat_path: Option<PathBuf>,
}

impl SysfsActivitySource {
    pub fn new(udc_class_dir: impl Into<PathBuf>, stat_path: Option<PathBuf>) -> Self {
        Self {
            udc_class_dir: udc_class_dir.into(),
            stat_path,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let stat_path = config
            .write_stat_path
            .clone()
            .or_else(|| block_stat_path(&config.virtual_disk_path, &config.sys_block_dir));
        if stat_path.is_none() {
            warn!(
                backing = %config.virtual_disk_path.display(),
                "Cannot derive block stat path, write activity will not be tracked"
            );
        }
        Self::new(&config.udc_class_dir, stat_path)
    }

    pub fn stat_path(&self) -> Option<&Path> {
        self.stat_path.as_deref()
    }

    /// State file of the first UDC, by name.
    fn udc_state_path(&self) -> Option<PathBuf> {
        let mut names: Vec<_> = fs::read_dir(&self.udc_class_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        names.sort();
        let first = names.into_iter().next()?;
        Some(self.udc_class_dir.join(first).join("state"))
    }
}

impl ActivitySource for SysfsActivitySource {
    fn controller_state(&self) -> ControllerState {
        let Some(path) = self.udc_state_path() else {
            return ControllerState::Unavailable;
        };
        match fs::read_to_string(&path) {
            Ok(raw) => ControllerState::parse(&raw),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "UDC state unreadable");
                ControllerState::Unavailable
            }
        }
    }

    fn write_sectors(&self) -> Option<u64> {
        let path = self.stat_path.as_ref()?;
        match fs::read_to_string(path) {
            Ok(raw) => parse_write_sectors(&raw),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Block stat unreadable");
                None
            }
        }
    }
}
