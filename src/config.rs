//! Layered daemon configuration.
//!
//! Values are resolved in order: built-in defaults, the TOML file, `AIRBRIDGE_`
//! environment variables (`__` separates nested keys, e.g.
//! `AIRBRIDGE_FTP__SERVER`), then command-line overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/airbridge/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
    /// Idle read timeout of the serial link.
    pub timeout_secs: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA0".to_string(),
            baudrate: 115_200,
            timeout_secs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub remote_path: String,
    /// Delivery attempts per chunk before the upload is abandoned.
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 21,
            username: String::new(),
            password: String::new(),
            remote_path: "/".to_string(),
            max_retries: 3,
            retry_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub json: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    /// Upper bound for one FTP data chunk; the modem may lower it further.
    pub chunk_size: usize,
    pub apn: String,
    pub ftp: FtpConfig,
    /// Backing store exposed to the host (block device or image file).
    pub virtual_disk_path: PathBuf,
    pub mount_point: PathBuf,
    pub quiet_window_seconds: u64,
    pub poll_interval_secs: u64,
    pub boot_upload_timeout_secs: u64,
    pub boot_retry_interval_secs: u64,
    /// Directory, relative to the mount point, drained at boot. The whole
    /// volume is drained when unset.
    pub queue_dir: Option<PathBuf>,
    pub progress_file: PathBuf,
    pub gadget_module: String,
    pub udc_class_dir: PathBuf,
    pub sys_block_dir: PathBuf,
    /// Explicit block `stat` file, for backing stores not under `/dev/`.
    pub write_stat_path: Option<PathBuf>,
    pub error_backoff_secs: u64,
    pub simulation: bool,
    pub log: LogSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            chunk_size: 512_000,
            apn: "hologram".to_string(),
            ftp: FtpConfig::default(),
            virtual_disk_path: PathBuf::from("/dev/mmcblk0p3"),
            mount_point: PathBuf::from("/mnt/usb_share"),
            quiet_window_seconds: 30,
            poll_interval_secs: 2,
            boot_upload_timeout_secs: 180,
            boot_retry_interval_secs: 10,
            queue_dir: None,
            progress_file: PathBuf::from("/var/lib/airbridge/upload_progress.json"),
            gadget_module: "g_mass_storage".to_string(),
            udc_class_dir: PathBuf::from("/sys/class/udc"),
            sys_block_dir: PathBuf::from("/sys/block"),
            write_stat_path: None,
            error_backoff_secs: 10,
            simulation: false,
            log: LogSettings::default(),
        }
    }
}

impl AppConfig {
    /// Resolve the configuration. `path` is the TOML file; an explicitly
    /// given path must exist, the default one may be absent.
    pub fn new<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                if !p.exists() {
                    bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => PathBuf::from(DEFAULT_CONFIG_PATH),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed("AIRBRIDGE_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::globals(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", file.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.ftp.max_retries == 0 {
            bail!("ftp.max_retries must be at least 1");
        }
        if self.quiet_window_seconds == 0 {
            bail!("quiet_window_seconds must be greater than zero");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if !self.simulation && self.ftp.server.trim().is_empty() {
            bail!("ftp.server must be set");
        }
        Ok(())
    }

    /// Root scanned by the boot-time drain.
    pub fn queue_root(&self) -> PathBuf {
        match &self.queue_dir {
            Some(dir) => self.mount_point.join(dir),
            None => self.mount_point.clone(),
        }
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_secs(self.quiet_window_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn boot_upload_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_upload_timeout_secs)
    }

    pub fn boot_retry_interval(&self) -> Duration {
        Duration::from_secs(self.boot_retry_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    /// Render the effective configuration as TOML, password masked.
    pub fn to_toml_redacted(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.ftp.password.is_empty() {
            shown.ftp.password = "********".to_string();
        }
        toml::to_string_pretty(&shown).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Overrides {
        quiet_window_seconds: u64,
    }

    #[test]
    fn test_defaults_reject_missing_server() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_and_overrides_are_layered() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
chunk_size = 4096
apn = "iot.example"
quiet_window_seconds = 45

[ftp]
server = "ftp.example.com"
username = "drop"
"#,
        )
        .unwrap();

        let overrides = Overrides {
            quiet_window_seconds: 12,
        };
        let config = AppConfig::new(Some(&path), Some(&overrides)).unwrap();

        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.apn, "iot.example");
        assert_eq!(config.ftp.server, "ftp.example.com");
        assert_eq!(config.ftp.port, 21);
        assert_eq!(config.ftp.max_retries, 3);
        assert_eq!(config.quiet_window_seconds, 12);
        assert_eq!(config.serial.baudrate, 115_200);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("nope.toml");
        let result = AppConfig::new::<Overrides>(Some(&missing), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = AppConfig {
            chunk_size: 0,
            simulation: true,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_root_is_under_mount_point() {
        let config = AppConfig {
            mount_point: PathBuf::from("/mnt/share"),
            queue_dir: Some(PathBuf::from("outbox")),
            ..AppConfig::default()
        };
        assert_eq!(config.queue_root(), PathBuf::from("/mnt/share/outbox"));
    }

    #[test]
    fn test_redacted_toml_hides_password() {
        let mut config = AppConfig::default();
        config.ftp.password = "hunter2".to_string();
        let rendered = config.to_toml_redacted().unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("********"));
    }
}
