use std::path::{Path, PathBuf};

use airbridge::adapters;
use airbridge::config::AppConfig;
use airbridge::context::AppContext;
use airbridge::core::{GadgetController, Orchestrator};
use airbridge::logging::{self, LogConfig};
use airbridge::modem::{BearerController, CommandEngine, FtpUploader, UploadPolicy};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "airbridge")]
#[command(about = "USB mass-storage to cellular FTP bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default /etc/airbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated gadget, host and modem
    #[arg(long, global = true)]
    simulation: bool,

    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose the device and harvest uploads until signalled
    Daemon(DaemonArgs),
    /// Upload a single file and exit (the file is kept)
    Upload { file: PathBuf },
    /// Show gadget, write-counter and transfer state
    Status,
}

#[derive(Args, Serialize, Default)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    quiet_window_seconds: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    poll_interval_secs: Option<u64>,
}

#[derive(Serialize)]
struct LogOverrides {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    verbose: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    json: bool,
}

/// Command-line values layered over file and environment config. Unset
/// flags are omitted so they don't mask lower layers.
#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    simulation: bool,
    log: LogOverrides,
    #[serde(flatten)]
    daemon: Option<&'a DaemonArgs>,
}

impl<'a> Overrides<'a> {
    fn from_cli(cli: &'a Cli) -> Self {
        Self {
            simulation: cli.simulation,
            log: LogOverrides {
                verbose: cli.verbose,
                json: cli.json,
            },
            daemon: match &cli.command {
                Commands::Daemon(args) => Some(args),
                _ => None,
            },
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&Overrides::from_cli(&cli)))?;
    logging::init(LogConfig::from(&config.log));

    match &cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed")?,
        Commands::Upload { file } => run_upload(config, file)
            .await
            .with_context(|| format!("Failed to upload {}", file.display()))?,
        Commands::Status => run_status(&config).context("Failed to read status")?,
    }

    Ok(())
}

fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            warn!(error = %e, "Signal handler failed");
            return;
        }
        info!("Shutdown signal received");
        token.cancel();
    });
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let adapters = adapters::get_adapters(&config)?;
    let ctx = AppContext::new(config);
    cancel_on_signal(ctx.shutdown.clone());

    let gadget = GadgetController::new(
        adapters.gadget,
        ctx.config.virtual_disk_path.clone(),
        ctx.config.mount_point.clone(),
    );
    let modem = CommandEngine::new(adapters.transport);

    Orchestrator::new(ctx, gadget, adapters.activity, modem)
        .start()
        .await
}

async fn run_upload(config: AppConfig, file: &Path) -> Result<()> {
    let file = file
        .canonicalize()
        .with_context(|| format!("Cannot resolve {}", file.display()))?;
    let transport = adapters::open_transport(&config)?;
    let ctx = AppContext::new(config);
    cancel_on_signal(ctx.shutdown.clone());

    let mut modem = CommandEngine::new(transport);
    let mut bearer = BearerController::new();
    bearer.setup_network(&mut modem, &ctx.config.apn).await?;

    let uploader = FtpUploader::new(
        &ctx.config.ftp,
        UploadPolicy::from_config(&ctx.config),
        &ctx.progress,
        ctx.shutdown.clone(),
    );
    let result = uploader.upload(&mut modem, &file).await;
    bearer.close_bearer(&mut modem).await;

    let report = result?;
    println!(
        "Uploaded {} ({} bytes, resumed from {}) in {:.1}s",
        file.display(),
        report.file_size,
        report.resumed_from,
        report.duration.as_secs_f64()
    );
    Ok(())
}

fn run_status(config: &AppConfig) -> Result<()> {
    println!("# Effective configuration");
    println!("{}", config.to_toml_redacted()?);

    println!("Backing store: {}", config.virtual_disk_path.display());
    println!("Mount point:   {}", config.mount_point.display());

    print_device_status(config);

    let store = airbridge::core::ProgressStore::new(config.progress_file.clone());
    match store.load() {
        None => println!("Transfer:      none pending"),
        Some(record) => {
            let path = Path::new(&record.file_identity);
            let resumable = record.is_valid_for(path, Utc::now());
            let progress = match std::fs::metadata(path) {
                Ok(m) => format!("{}%", record.percentage(m.len())),
                Err(_) => "source missing".to_string(),
            };
            println!(
                "Transfer:      {} at {} bytes ({progress}), recorded {}{}",
                record.file_identity,
                record.bytes_sent,
                record.recorded_at.to_rfc3339(),
                if resumable { "" } else { " [expired]" }
            );
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn print_device_status(config: &AppConfig) {
    use airbridge::core::ActivitySource;

    if config.simulation {
        println!("Controller:    simulated");
        return;
    }

    let source = adapters::linux::SysfsActivitySource::from_config(config);
    println!("Controller:    {}", source.controller_state());
    match (source.stat_path(), source.write_sectors()) {
        (Some(path), Some(sectors)) => {
            println!("Writes:        {sectors} sectors ({})", path.display())
        }
        (Some(path), None) => println!("Writes:        unreadable ({})", path.display()),
        (None, _) => println!("Writes:        no stat path"),
    }
}

#[cfg(not(target_os = "linux"))]
fn print_device_status(_config: &AppConfig) {
    println!("Controller:    unavailable on this platform");
}
