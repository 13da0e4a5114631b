//! Host-activity detection from the gadget controller state and the backing
//! device's cumulative write counter.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

pub const SECTOR_SIZE: u64 = 512;

/// Zero-based index of "sectors written" in a block-device `stat` file.
const WRITE_SECTORS_FIELD: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    /// A host has enumerated the gadget.
    Configured,
    /// No controller present (gadget not loaded, no UDC).
    Unavailable,
    /// Any other controller state; treated as "not connected".
    Other(String),
}

impl ControllerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "configured" => Self::Configured,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configured => f.write_str("configured"),
            Self::Unavailable => f.write_str("unavailable"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskActivitySample {
    /// `None` when the counter could not be read.
    pub cumulative_write_sectors: Option<u64>,
    pub sampled_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Connected,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestTrigger {
    QuietWindow { bytes_written: u64 },
    Disconnected { bytes_written: u64 },
}

impl HarvestTrigger {
    pub fn bytes_written(&self) -> u64 {
        match *self {
            Self::QuietWindow { bytes_written } | Self::Disconnected { bytes_written } => {
                bytes_written
            }
        }
    }
}

/// OS view of the exposed device.
pub trait ActivitySource: Send + Sync {
    fn controller_state(&self) -> ControllerState;

    /// Cumulative sectors written to the backing device.
    fn write_sectors(&self) -> Option<u64>;
}

/// Per-session state machine: `Idle -> Connected -> Active -> trigger`.
pub struct ActivityMonitor {
    quiet_window: Duration,
    state: HostState,
    last_sectors: Option<u64>,
    last_write: Option<Instant>,
    session_sectors: u64,
}

impl ActivityMonitor {
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            quiet_window,
            state: HostState::Idle,
            last_sectors: None,
            last_write: None,
            session_sectors: 0,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn bytes_this_session(&self) -> u64 {
        self.session_sectors * SECTOR_SIZE
    }

    pub fn reset(&mut self) {
        self.state = HostState::Idle;
        self.last_sectors = None;
        self.last_write = None;
        self.session_sectors = 0;
    }

    /// Sample `source` now and advance the state machine.
    pub fn poll(&mut self, source: &dyn ActivitySource) -> Option<HarvestTrigger> {
        let controller = source.controller_state();
        let sample = DiskActivitySample {
            cumulative_write_sectors: source.write_sectors(),
            sampled_at: Instant::now(),
        };
        self.observe(&controller, sample)
    }

    pub fn observe(
        &mut self,
        controller: &ControllerState,
        sample: DiskActivitySample,
    ) -> Option<HarvestTrigger> {
        if !controller.is_configured() {
            let previous = self.state;
            let bytes_written = self.bytes_this_session();
            self.reset();

            return match previous {
                HostState::Active => {
                    info!(bytes_written, "Host disconnected with pending writes");
                    Some(HarvestTrigger::Disconnected { bytes_written })
                }
                HostState::Connected => {
                    info!(state = %controller, "Host disconnected without writing");
                    None
                }
                HostState::Idle => None,
            };
        }

        if self.state == HostState::Idle {
            self.state = HostState::Connected;
            self.last_sectors = sample.cumulative_write_sectors;
            info!(baseline = ?self.last_sectors, "Host connected");
            return None;
        }

        if let Some(current) = sample.cumulative_write_sectors {
            match self.last_sectors {
                Some(previous) if current > previous => {
                    self.session_sectors += current - previous;
                    self.last_write = Some(sample.sampled_at);
                    if self.state == HostState::Connected {
                        info!("Host started writing");
                    }
                    self.state = HostState::Active;
                    debug!(
                        sectors = current - previous,
                        session_bytes = self.bytes_this_session(),
                        "Write activity"
                    );
                }
                Some(previous) if current < previous => {
                    debug!(previous, current, "Write counter went backwards, rebaselining");
                }
                _ => {}
            }
            self.last_sectors = Some(current);
        }

        if self.state == HostState::Active
            && let Some(last_write) = self.last_write
            && sample.sampled_at.duration_since(last_write) >= self.quiet_window
        {
            let bytes_written = self.bytes_this_session();
            info!(
                bytes_written,
                quiet_secs = self.quiet_window.as_secs(),
                "Quiet window elapsed"
            );
            self.reset();
            return Some(HarvestTrigger::QuietWindow { bytes_written });
        }

        None
    }
}

/// Sectors-written field of a block `stat` file.
pub fn parse_write_sectors(stat: &str) -> Option<u64> {
    stat.split_whitespace()
        .nth(WRITE_SECTORS_FIELD)?
        .parse()
        .ok()
}

/// Locate the sysfs `stat` file for a block device node.
///
/// `/dev/mmcblk0p3` -> `<sys_block>/mmcblk0/mmcblk0p3/stat`,
/// `/dev/sda1` -> `<sys_block>/sda/sda1/stat`, `/dev/sda` ->
/// `<sys_block>/sda/stat`.
pub fn block_stat_path(device: &Path, sys_block: &Path) -> Option<PathBuf> {
    let name = device.file_name()?.to_str()?;
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());

    if trimmed.len() == name.len() {
        return Some(sys_block.join(name).join("stat"));
    }

    let numbered_disk = ["mmcblk", "nvme", "loop"]
        .iter()
        .any(|prefix| name.starts_with(prefix));

    let disk = if numbered_disk {
        match trimmed.strip_suffix('p') {
            Some(disk) if !disk.is_empty() => disk,
            _ => return Some(sys_block.join(name).join("stat")),
        }
    } else {
        trimmed
    };

    Some(sys_block.join(disk).join(name).join("stat"))
}
