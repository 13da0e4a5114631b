use std::fs;
use std::path::PathBuf;

use tokio::time::{Instant, sleep};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::core::activity::{ActivityMonitor, ActivitySource, HarvestTrigger};
use crate::core::gadget::{GadgetController, GadgetMode};
use crate::core::harvest::enumerate_candidates;
use crate::core::models::{HarvestCandidate, HarvestReport};
use crate::error::{Error, Result};
use crate::modem::{BearerController, CommandEngine, FtpUploader, UploadPolicy};

/// Ties host-activity detection to the gadget duty cycle and the uploader.
pub struct Orchestrator {
    ctx: AppContext,
    gadget: GadgetController,
    activity: Box<dyn ActivitySource>,
    modem: CommandEngine,
    bearer: BearerController,
    monitor: ActivityMonitor,
}

impl Orchestrator {
    pub fn new(
        ctx: AppContext,
        gadget: GadgetController,
        activity: Box<dyn ActivitySource>,
        modem: CommandEngine,
    ) -> Self {
        let monitor = ActivityMonitor::new(ctx.config.quiet_window());
        Self {
            ctx,
            gadget,
            activity,
            modem,
            bearer: BearerController::new(),
            monitor,
        }
    }

    pub fn gadget_mode(&self) -> GadgetMode {
        self.gadget.mode()
    }

    /// Run until the shutdown token is cancelled.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        info!(
            backing = %self.ctx.config.virtual_disk_path.display(),
            mount_point = %self.ctx.config.mount_point.display(),
            quiet_window_secs = self.ctx.config.quiet_window_seconds,
            "Airbridge daemon starting"
        );

        self.gadget.reset_to_neither();
        self.boot_drain().await;
        self.run_monitor().await;

        info!(mode = %self.gadget.mode(), "Airbridge daemon stopped");
        Ok(())
    }

    /// Upload whatever a previous run left queued, then expose the device.
    ///
    /// Network setup is retried until the boot window closes; host exposure
    /// is restored whatever the outcome.
    pub async fn boot_drain(&mut self) -> HarvestReport {
        let deadline = Instant::now() + self.ctx.config.boot_upload_timeout();
        let root = self.ctx.config.queue_root();
        let span = info_span!("boot_drain", queue = %root.display());

        async {
            let result = self.collect_and_upload(root, Some(deadline)).await;
            self.restore_exposure().await;
            match result {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Boot upload abandoned, exposing device");
                    HarvestReport::default()
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Poll host activity and harvest on each trigger.
    pub async fn run_monitor(&mut self) {
        let poll_interval = self.ctx.config.poll_interval();
        let backoff = self.ctx.config.error_backoff();
        let shutdown = self.ctx.shutdown.clone();

        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Monitoring host activity"
        );

        while !shutdown.is_cancelled() {
            let delay = match self.tick().await {
                Ok(()) => poll_interval,
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Monitor loop error, backing off"
                    );
                    backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn tick(&mut self) -> Result<()> {
        if self.gadget.mode() != GadgetMode::Exposed {
            warn!(mode = %self.gadget.mode(), "Device not exposed, retrying");
            self.monitor.reset();
            return self.gadget.restore_exposure().await;
        }

        if let Some(trigger) = self.monitor.poll(self.activity.as_ref()) {
            self.harvest_cycle(trigger).await?;
        }
        Ok(())
    }

    /// One unexpose, scan, upload, re-expose sequence.
    pub async fn harvest_cycle(&mut self, trigger: HarvestTrigger) -> Result<HarvestReport> {
        let cycle_id = Uuid::now_v7();
        let span = info_span!("harvest_cycle", %cycle_id);

        async {
            info!(
                ?trigger,
                bytes_written = trigger.bytes_written(),
                "Harvest cycle starting"
            );
            let root = self.ctx.config.mount_point.clone();
            let result = self.collect_and_upload(root, None).await;
            self.restore_exposure().await;
            result
        }
        .instrument(span)
        .await
    }

    async fn collect_and_upload(
        &mut self,
        root: PathBuf,
        deadline: Option<Instant>,
    ) -> Result<HarvestReport> {
        self.gadget.unexpose().await?;
        self.gadget.mount_local().await?;

        let candidates = enumerate_candidates(&root).map_err(|e| Error::io(&root, e))?;
        if candidates.is_empty() {
            info!("No files to upload");
            return Ok(HarvestReport::default());
        }

        let total_bytes: u64 = candidates.iter().map(|c| c.size_bytes).sum();
        info!(count = candidates.len(), total_bytes, "Found files to upload");

        self.connect(deadline).await?;
        let report = self.upload_all(&candidates, deadline).await;
        self.bearer.close_bearer(&mut self.modem).await;

        log_summary(&report);
        Ok(report)
    }

    /// Bring the bearer up, retrying at a fixed interval until `deadline`.
    /// Without a deadline a single attempt is made.
    async fn connect(&mut self, deadline: Option<Instant>) -> Result<()> {
        let retry_interval = self.ctx.config.boot_retry_interval();
        let shutdown = self.ctx.shutdown.clone();

        loop {
            let err = match self
                .bearer
                .setup_network(&mut self.modem, &self.ctx.config.apn)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let Some(deadline) = deadline else {
                error!(error = %err, "Network setup failed, aborting cycle");
                return Err(err);
            };
            if Instant::now() + retry_interval >= deadline || shutdown.is_cancelled() {
                warn!(error = %err, "Network setup failed, giving up");
                return Err(err);
            }

            warn!(
                error = %err,
                retry_in_secs = retry_interval.as_secs(),
                "Network setup failed, retrying"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Err(err),
                _ = sleep(retry_interval) => {}
            }
        }
    }

    async fn upload_all(
        &mut self,
        candidates: &[HarvestCandidate],
        deadline: Option<Instant>,
    ) -> HarvestReport {
        let mut report = HarvestReport::default();
        let policy = UploadPolicy::from_config(&self.ctx.config);
        let uploader = FtpUploader::new(
            &self.ctx.config.ftp,
            policy,
            &self.ctx.progress,
            self.ctx.shutdown.clone(),
        );

        for (index, candidate) in candidates.iter().enumerate() {
            let path = &candidate.absolute_path;

            if self.ctx.shutdown.is_cancelled() {
                info!(remaining = candidates.len() - index, "Shutdown requested, stopping uploads");
                report.failed.extend(candidates[index..].iter().map(|c| c.absolute_path.clone()));
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(remaining = candidates.len() - index, "Upload window elapsed, leaving files queued");
                report.failed.extend(candidates[index..].iter().map(|c| c.absolute_path.clone()));
                break;
            }

            info!(
                file = %path.display(),
                index = index + 1,
                total = candidates.len(),
                size_bytes = candidate.size_bytes,
                "Uploading file"
            );

            match uploader
                .upload_into(&mut self.modem, path, &candidate.relative_dir)
                .await
            {
                Ok(upload) => {
                    report.bytes_uploaded += upload.bytes_uploaded;
                    match fs::remove_file(path) {
                        Ok(()) => {
                            self.gadget.sync();
                            info!(file = %path.display(), "Uploaded and removed");
                        }
                        Err(e) => {
                            warn!(file = %path.display(), error = %e, "Uploaded but could not remove");
                        }
                    }
                    report.uploaded.push(path.clone());
                }
                Err(Error::Cancelled { offset }) => {
                    info!(file = %path.display(), offset, "Upload interrupted by shutdown");
                    report.failed.extend(candidates[index..].iter().map(|c| c.absolute_path.clone()));
                    break;
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "Upload failed, file kept");
                    report.failed.push(path.clone());
                }
            }
        }

        report
    }

    async fn restore_exposure(&mut self) {
        if let Err(e) = self.gadget.restore_exposure().await {
            error!(error = %e, "Failed to re-expose device");
        }
        self.monitor.reset();
    }
}

fn log_summary(report: &HarvestReport) {
    info!(
        uploaded = report.uploaded.len(),
        failed = report.failed.len(),
        bytes_uploaded = report.bytes_uploaded,
        "Harvest complete"
    );
    for path in &report.failed {
        warn!(file = %path.display(), "Not uploaded, remains on USB drive");
    }
}
