//! Resumable FTP upload over the modem's `AT+FTP*` command set.
//!
//! One file per session. The file is streamed in chunks no larger than the
//! modem allows; each chunk is retried on its own, and progress is persisted
//! so an interrupted upload continues with `APPE` on the next attempt.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path};
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::bearer::check_signal;
use super::command::CommandEngine;
use super::response::{FtpPutIndication, SignalLevel, find_ftpput};
use crate::config::{AppConfig, FtpConfig};
use crate::core::progress::{ProgressStore, percentage};
use crate::error::{Error, Result};
use crate::logging::LogThrottle;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// Chunk size used when the modem's ready indication can't be parsed.
pub const FALLBACK_CHUNK_SIZE: usize = 1000;
/// Pause before the end-of-data announcement.
const CLOSE_SETTLE: Duration = Duration::from_millis(500);
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Timing and sizing knobs for one upload.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub session_open_timeout: Duration,
    pub prompt_timeout: Duration,
    pub ack_timeout: Duration,
    pub close_timeout: Duration,
    pub signal_check_interval: Duration,
    /// Persist progress whenever this many bytes were acknowledged since the
    /// last write. Bounds re-upload after a crash to this plus one chunk.
    pub progress_interval: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 512_000,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            session_open_timeout: Duration::from_secs(60),
            prompt_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(15),
            close_timeout: Duration::from_secs(30),
            signal_check_interval: Duration::from_secs(30),
            progress_interval: 500 * 1024,
        }
    }
}

impl UploadPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_retries: config.ftp.max_retries,
            retry_delay: Duration::from_secs(config.ftp.retry_delay_secs),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub file_size: u64,
    pub resumed_from: u64,
    /// Bytes delivered in this session (excludes the resumed prefix).
    pub bytes_uploaded: u64,
    pub chunk_size: usize,
    pub duration: Duration,
}

pub struct FtpUploader<'a> {
    ftp: &'a FtpConfig,
    policy: UploadPolicy,
    progress: &'a ProgressStore,
    shutdown: CancellationToken,
    throttle: LogThrottle,
}

impl<'a> FtpUploader<'a> {
    pub fn new(
        ftp: &'a FtpConfig,
        policy: UploadPolicy,
        progress: &'a ProgressStore,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ftp,
            policy,
            progress,
            shutdown,
            throttle: LogThrottle::new(PROGRESS_LOG_INTERVAL),
        }
    }

    /// Upload `file` into the configured remote directory. Success means the
    /// modem confirmed the session closed; only then may the caller delete it.
    pub async fn upload(&self, modem: &mut CommandEngine, file: &Path) -> Result<UploadReport> {
        self.upload_into(modem, file, Path::new("")).await
    }

    /// Like [`upload`](Self::upload), placing the file under `subdir` of the
    /// configured remote directory.
    pub async fn upload_into(
        &self,
        modem: &mut CommandEngine,
        file: &Path,
        subdir: &Path,
    ) -> Result<UploadReport> {
        let remote_dir = remote_dir(&self.ftp.remote_path, subdir);
        let span = info_span!("upload", file = %file.display(), %remote_dir);
        self.upload_inner(modem, file, &remote_dir).instrument(span).await
    }

    async fn upload_inner(
        &self,
        modem: &mut CommandEngine,
        file: &Path,
        remote_dir: &str,
    ) -> Result<UploadReport> {
        let started = Instant::now();
        self.throttle.reset();

        let file_size = match fs::metadata(file) {
            Ok(m) if m.is_file() => m.len(),
            Ok(_) => return Err(Error::FileMissing(file.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::FileMissing(file.to_path_buf()));
            }
            Err(e) => return Err(Error::io(file, e)),
        };
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::FileMissing(file.to_path_buf()))?;

        if file_size == 0 {
            info!("Empty file, nothing to send");
            return Ok(UploadReport {
                file_size,
                resumed_from: 0,
                bytes_uploaded: 0,
                chunk_size: 0,
                duration: started.elapsed(),
            });
        }

        let resume_from = match self.progress.resume_offset(file, Utc::now()) {
            Some(offset) if offset > 0 && offset < file_size => offset,
            _ => 0,
        };
        let append = resume_from > 0;

        if append {
            info!(
                resume_from,
                file_size,
                server = %self.ftp.server,
                "Resuming upload"
            );
        } else {
            info!(file_size, server = %self.ftp.server, "Starting upload");
        }

        self.configure_session(modem, remote_dir, &filename, append).await?;

        let open = modem
            .send("AT+FTPPUT=1", "+FTPPUT: 1,1", self.policy.session_open_timeout)
            .await?;
        if !open.matched {
            return Err(Error::SessionOpenFailed(open.raw_text.trim().to_string()));
        }

        let chunk_size = working_chunk_size(&open.raw_text, self.policy.chunk_size);
        debug!(chunk_size, "FTP session ready");

        let mut reader = File::open(file).map_err(|e| Error::io(file, e))?;
        reader
            .seek(SeekFrom::Start(resume_from))
            .map_err(|e| Error::io(file, e))?;

        let mut buf = vec![0u8; chunk_size];
        let mut bytes_sent = resume_from;
        let mut last_persisted = resume_from;
        let mut last_signal_check = Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                info!(offset = bytes_sent, "Shutdown requested, stopping at chunk boundary");
                self.persist(file, bytes_sent);
                if let Err(e) = self.close_session(modem).await {
                    warn!(error = %e, "Failed to close FTP session on shutdown");
                }
                return Err(Error::Cancelled { offset: bytes_sent });
            }

            if last_signal_check.elapsed() >= self.policy.signal_check_interval {
                self.check_signal(modem).await;
                last_signal_check = Instant::now();
            }

            let n = read_chunk(&mut reader, &mut buf).map_err(|e| Error::io(file, e))?;
            if n == 0 {
                break;
            }

            if let Err(e) = self.deliver_chunk(modem, &buf[..n], bytes_sent).await {
                self.persist(file, bytes_sent);
                return Err(e);
            }

            bytes_sent += n as u64;

            if bytes_sent - last_persisted >= self.policy.progress_interval {
                self.persist(file, bytes_sent);
                last_persisted = bytes_sent;
            }

            if self.throttle.should_log() {
                info!(
                    bytes_sent,
                    file_size,
                    percent = percentage(bytes_sent, file_size),
                    "Upload progress"
                );
            }
        }

        if self.close_session(modem).await? {
            if let Err(e) = self.progress.clear() {
                warn!(error = %e, "Failed to clear progress record");
            }
            let report = UploadReport {
                file_size,
                resumed_from: resume_from,
                bytes_uploaded: bytes_sent - resume_from,
                chunk_size,
                duration: started.elapsed(),
            };
            info!(
                bytes_uploaded = report.bytes_uploaded,
                duration_secs = report.duration.as_secs(),
                "Upload complete"
            );
            Ok(report)
        } else {
            self.persist(file, bytes_sent);
            Err(Error::CloseUnconfirmed { bytes_sent })
        }
    }

    /// Session parameters, each fire-and-forget. A bad value surfaces when
    /// the PUT session refuses to open.
    async fn configure_session(
        &self,
        modem: &mut CommandEngine,
        remote_dir: &str,
        filename: &str,
        append: bool,
    ) -> Result<()> {
        let ftp = self.ftp;
        let commands = [
            "AT+FTPCID=1".to_string(),
            format!("AT+FTPSERV=\"{}\"", ftp.server),
            format!("AT+FTPPORT={}", ftp.port),
            "AT+FTPMODE=1".to_string(),
            format!("AT+FTPUN=\"{}\"", ftp.username),
            format!("AT+FTPPW=\"{}\"", ftp.password),
            format!("AT+FTPPUTNAME=\"{filename}\""),
            format!("AT+FTPPUTPATH=\"{remote_dir}\""),
            "AT+FTPTYPE=\"I\"".to_string(),
            format!(
                "AT+FTPPUTOPT=\"{}\"",
                if append { "APPE" } else { "STOR" }
            ),
        ];

        for command in &commands {
            modem.fire(command, COMMAND_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Deliver one chunk, retrying the same bytes up to `max_retries` times.
    async fn deliver_chunk(&self, modem: &mut CommandEngine, data: &[u8], offset: u64) -> Result<()> {
        debug_assert!(!data.is_empty(), "zero length is reserved for end-of-data");
        let attempts = self.policy.max_retries.max(1);

        for attempt in 1..=attempts {
            match self.attempt_chunk(modem, data).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        attempt,
                        max = attempts,
                        offset,
                        error = %e,
                        "Chunk delivery failed"
                    );
                    if attempt < attempts {
                        sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        Err(Error::ChunkFailed { offset, attempts })
    }

    async fn attempt_chunk(&self, modem: &mut CommandEngine, data: &[u8]) -> Result<()> {
        let command = format!("AT+FTPPUT=2,{}", data.len());
        let prompt = modem
            .send(&command, "+FTPPUT: 2,", self.policy.prompt_timeout)
            .await?;
        if !prompt.matched {
            return Err(Error::TransportTimeout {
                command,
                expected: "+FTPPUT: 2,".to_string(),
            });
        }

        modem.write_data(data)?;

        let ack = modem.wait_for("OK", self.policy.ack_timeout).await?;
        if !ack.matched {
            return Err(Error::TransportTimeout {
                command: format!("<{} data bytes>", data.len()),
                expected: "OK".to_string(),
            });
        }
        Ok(())
    }

    /// Announce end-of-data; true when the modem confirms the session closed.
    async fn close_session(&self, modem: &mut CommandEngine) -> Result<bool> {
        sleep(CLOSE_SETTLE).await;
        let closed = modem
            .send("AT+FTPPUT=2,0", "+FTPPUT: 1,0", self.policy.close_timeout)
            .await?;
        if !closed.matched {
            warn!(response = %closed.raw_text.trim(), "FTP session close not confirmed");
        }
        Ok(closed.matched)
    }

    async fn check_signal(&self, modem: &mut CommandEngine) {
        match check_signal(modem).await {
            Ok(Some(signal)) if signal.level() == SignalLevel::VeryWeak => {
                warn!(rssi = signal.rssi, "Low signal during upload");
            }
            Ok(Some(signal)) => debug!(rssi = signal.rssi, "Signal check"),
            Ok(None) => debug!("Signal check gave no reading"),
            Err(e) => debug!(error = %e, "Signal check failed"),
        }
    }

    /// Best-effort: a failed write never blocks the upload.
    fn persist(&self, file: &Path, bytes_sent: u64) {
        match self.progress.save(file, bytes_sent) {
            Ok(()) => debug!(bytes_sent, "Progress saved"),
            Err(e) => warn!(
                path = %self.progress.path().display(),
                error = %e,
                "Failed to save upload progress"
            ),
        }
    }
}

/// `min(modem maximum, configured)`, or the conservative fallback when the
/// ready indication carries no usable length.
pub fn working_chunk_size(ready_response: &str, configured: usize) -> usize {
    let reported = find_ftpput(ready_response).into_iter().find_map(|i| match i {
        FtpPutIndication::Ready { max_len: Some(n) } if n > 0 => Some(n),
        _ => None,
    });

    match reported {
        Some(max) => max.min(configured),
        None => {
            warn!(
                fallback = FALLBACK_CHUNK_SIZE,
                "Could not parse modem chunk size, using fallback"
            );
            FALLBACK_CHUNK_SIZE.min(configured)
        }
    }
}

/// `base` extended by the normal components of `subdir`, with a trailing
/// slash as the modem expects.
pub fn remote_dir(base: &str, subdir: &Path) -> String {
    let mut dir = base.trim_end_matches('/').to_string();
    for component in subdir.components() {
        if let Component::Normal(part) = component {
            dir.push('/');
            dir.push_str(&part.to_string_lossy());
        }
    }
    dir.push('/');
    dir
}

/// Fill `buf` as far as the file allows.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
