use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use usbwarden::adapters::{self, UdisksMounter};
use usbwarden::config::AppConfig;
use usbwarden::console::{self, Console};
use usbwarden::context::AppContext;
use usbwarden::core::notifications::create_notifier;
use usbwarden::core::{
    AlwaysDeny, AutoApprove, ConfirmationPolicy, DeviceIdentity, DeviceSnapshot, HashEvent,
    HashJob, IntegrityHasher, OrchestratorCommand, OrchestratorInputs, TerminalPrompt, TrustLevel,
    VerificationEvent, VerificationOrchestrator,
};
use usbwarden::logging::{self, LogConfig, LogThrottle};
use usbwarden::store::{ImportMode, WhitelistStore, short_hash};

#[derive(Parser)]
#[command(name = "usbwarden")]
#[command(about = "USB storage integrity verifier", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for USB devices and verify them as they connect
    Daemon(DaemonArgs),
    /// Compute the integrity hash of a device or image
    Hash(HashArgs),
    /// List connected USB partitions
    Devices,
    /// Inspect and manage the whitelist
    #[command(subcommand)]
    Whitelist(WhitelistCommand),
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum PolicyKind {
    #[default]
    Prompt,
    Approve,
    Deny,
}

impl PolicyKind {
    fn build(self, console: &Console) -> Arc<dyn ConfirmationPolicy> {
        match self {
            Self::Prompt => Arc::new(TerminalPrompt::new(console.clone())),
            Self::Approve => Arc::new(AutoApprove),
            Self::Deny => Arc::new(AlwaysDeny),
        }
    }
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    /// How new and modified devices are confirmed
    #[serde(skip)]
    #[arg(long, value_enum, default_value_t)]
    policy: PolicyKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    block_modified_devices: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_hashes: Option<usize>,
}

#[derive(Args)]
struct HashArgs {
    device: PathBuf,

    #[arg(long)]
    algorithm: Option<String>,

    #[arg(long)]
    no_mmap: bool,
}

#[derive(Subcommand)]
enum WhitelistCommand {
    List,
    Remove { id: String },
    /// Set trust level: 0 = new, 1 = trusted, 2 = always allow
    Trust { id: String, level: u8 },
    Export { file: PathBuf },
    Import {
        file: PathBuf,
        #[arg(long)]
        replace: bool,
    },
    Backup { file: Option<PathBuf> },
    Restore { file: PathBuf },
    Validate,
    Stats,
}

#[derive(Serialize)]
struct CliOverrides<'a> {
    #[serde(flatten)]
    global: &'a GlobalArgs,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    daemon: Option<&'a DaemonArgs>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        global: &cli.global,
        daemon: match &cli.command {
            Commands::Daemon(args) => Some(args),
            _ => None,
        },
    };
    let config = AppConfig::new(Some(&overrides)).context("Failed to load configuration")?;

    logging::init(LogConfig::from(&config));

    match cli.command {
        Commands::Daemon(args) => run_daemon(config, args.policy)
            .await
            .context("Daemon failed")?,
        Commands::Hash(args) => run_hash(&config, args).await.context("Hashing failed")?,
        Commands::Devices => run_devices(&config).context("Failed to list devices")?,
        Commands::Whitelist(cmd) => {
            run_whitelist(&config, cmd).context("Whitelist command failed")?
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, policy: PolicyKind) -> Result<()> {
    let simulation = config.simulation;
    let notifier = create_notifier(&config.notifications);
    let (ctx, events) = AppContext::new(config);
    info!(
        path = %ctx.store.path().display(),
        devices = ctx.store.device_count(),
        simulation,
        "Starting usbwarden daemon"
    );

    let shutdown = CancellationToken::new();
    let autosave = ctx.store.spawn_autosave(shutdown.clone());

    let (adapter, simulator) = adapters::get_adapter(simulation);
    let (hw_tx, hw_rx) = mpsc::channel(32);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);

    let (console, console_rx) = Console::stdin();
    println!("{}", console::USAGE);
    let forwarder = tokio::spawn(console::forward(console_rx, cmd_tx.clone(), simulator));

    let (orchestrator, mut verification) = VerificationOrchestrator::new(
        &ctx,
        Arc::new(UdisksMounter::new()),
        policy.build(&console),
    );
    let orchestrator = orchestrator
        .with_notifier(notifier)
        .with_watcher(adapter.clone());

    let reporter = tokio::spawn(async move {
        while let Some(event) = verification.recv().await {
            report(&event);
        }
    });

    adapter.start(hw_tx);
    let mut run = tokio::spawn(orchestrator.run(OrchestratorInputs {
        hardware: hw_rx,
        hashes: events.hashes,
        commands: cmd_rx,
        store_events: events.store,
    }));

    let result = tokio::select! {
        joined = &mut run => joined.context("Orchestrator task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            let _ = cmd_tx.send(OrchestratorCommand::Shutdown).await;
            run.await.context("Orchestrator task panicked")?
        }
    };

    let watcher = adapter.clone();
    tokio::task::spawn_blocking(move || watcher.stop())
        .await
        .context("Failed to stop device watcher")?;
    ctx.hasher.cancel_all().await;

    shutdown.cancel();
    let _ = autosave.await;
    if ctx.store.is_dirty() {
        ctx.store.save().context("Failed to save whitelist")?;
    }
    reporter.abort();
    forwarder.abort();

    result
}

fn report(event: &VerificationEvent) {
    match event {
        VerificationEvent::StatusChanged {
            device,
            identity,
            status,
        } => info!(device = %device.display(), identity = %identity, status = %status, "Status"),
        VerificationEvent::Modified { device, identity, .. } => {
            warn!(device = %device.display(), identity = %identity, "Device MODIFIED")
        }
        VerificationEvent::Rejected { device, identity } => {
            info!(device = %device.display(), identity = %identity, "Device rejected")
        }
        VerificationEvent::Unverifiable {
            device,
            identity,
            stored_algorithm,
            used_algorithm,
        } => warn!(
            device = %device.display(),
            identity = %identity,
            stored = %stored_algorithm,
            used = %used_algorithm,
            "Device could not be verified against its baseline"
        ),
        VerificationEvent::HashCancelled { device } => {
            info!(device = %device.display(), "Verification cancelled")
        }
        VerificationEvent::Mount(_) => {}
    }
}

async fn run_hash(config: &AppConfig, args: HashArgs) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let hasher = IntegrityHasher::new(1, tx);
    let job = HashJob::new(&args.device)
        .with_algorithm(
            args.algorithm
                .unwrap_or_else(|| config.hash_algorithm.clone()),
        )
        .with_buffer_size(config.hash_buffer_size())
        .with_mmap(config.use_memory_mapping && !args.no_mmap);
    hasher.start_hash(job).await;

    let throttle = LogThrottle::new(Duration::from_secs(1));
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(HashEvent::Progress { fraction, bytes_per_sec, .. }) => {
                    if throttle.should_log() {
                        info!(
                            percent = format!("{:.1}", fraction * 100.0),
                            mb_per_sec = format!("{:.1}", bytes_per_sec / (1024.0 * 1024.0)),
                            "Hashing"
                        );
                    }
                }
                Some(HashEvent::Completed(result)) => {
                    if result.algorithm_substituted() {
                        warn!(
                            requested = %result.requested_algorithm,
                            used = %result.algorithm,
                            "Requested algorithm unavailable"
                        );
                    }
                    println!(
                        "{}  {}  ({}, {} bytes, {} ms)",
                        result.hash,
                        result.device_path.display(),
                        result.algorithm,
                        result.bytes_processed,
                        result.duration_ms
                    );
                    return Ok(());
                }
                Some(HashEvent::Failed(result)) => {
                    bail!(result.error.unwrap_or_else(|| "unknown error".to_string()))
                }
                Some(HashEvent::Cancelled { .. }) => bail!("hash cancelled"),
                Some(HashEvent::Started { .. }) => {}
                None => bail!("hasher stopped unexpectedly"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Cancelling");
                hasher.cancel_all().await;
            }
        }
    }
}

fn run_devices(config: &AppConfig) -> Result<()> {
    let devices = connected_devices()?;
    if devices.is_empty() {
        println!("No USB storage partitions connected.");
        return Ok(());
    }

    let store = WhitelistStore::open(&config.database_path);
    for device in devices {
        let identity = device.identity();
        let state = match store.get_device(&identity) {
            Some(record) if record.has_hash() => "whitelisted",
            Some(_) => "whitelisted (no baseline)",
            None => "unknown",
        };
        println!(
            "{:<12} {:<40} {:>14} {:<10} {}",
            device.device_node.display(),
            identity,
            device.size_bytes,
            device
                .mount_point
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".into()),
            state
        );
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn connected_devices() -> Result<Vec<DeviceSnapshot>> {
    Ok(adapters::LinuxAdapter::enumerate()?)
}

#[cfg(not(target_os = "linux"))]
fn connected_devices() -> Result<Vec<DeviceSnapshot>> {
    bail!("device enumeration is only supported on Linux")
}

fn run_whitelist(config: &AppConfig, cmd: WhitelistCommand) -> Result<()> {
    let store = WhitelistStore::open(&config.database_path);

    match cmd {
        WhitelistCommand::List => {
            let mut devices = store.all_devices();
            devices.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
            for record in devices {
                println!(
                    "{:<40} trust={:<1} {:<8} {}",
                    record.unique_id,
                    u8::from(record.trust_level),
                    record.hash_algorithm,
                    if record.has_hash() {
                        short_hash(&record.hash)
                    } else {
                        "(no baseline)"
                    }
                );
            }
            return Ok(());
        }
        WhitelistCommand::Remove { id } => {
            store.remove_device(&DeviceIdentity::from(id))?;
        }
        WhitelistCommand::Trust { id, level } => {
            store.set_trust_level(&DeviceIdentity::from(id), TrustLevel::from(level))?;
        }
        WhitelistCommand::Export { file } => {
            let count = store.export_to_file(&file, true)?;
            println!("Exported {count} devices to {}", file.display());
            return Ok(());
        }
        WhitelistCommand::Import { file, replace } => {
            let mode = if replace {
                ImportMode::Replace
            } else {
                ImportMode::Merge
            };
            let count = store.import_from_file(&file, mode)?;
            println!("Imported {count} devices");
        }
        WhitelistCommand::Backup { file } => {
            let path = store.create_backup(file.as_deref())?;
            println!("Backup written to {}", path.display());
            return Ok(());
        }
        WhitelistCommand::Restore { file } => {
            let count = store.restore_from_backup(&file)?;
            println!("Restored {count} devices");
            return Ok(());
        }
        WhitelistCommand::Validate => {
            let issues = store.validate_integrity();
            if issues.is_empty() {
                println!("Whitelist OK");
                return Ok(());
            }
            for issue in &issues {
                error!(%issue, "Integrity issue");
            }
            bail!("{} integrity issue(s) found", issues.len());
        }
        WhitelistCommand::Stats => {
            println!("{}", serde_json::to_string_pretty(&store.stats())?);
            return Ok(());
        }
    }

    store.save()?;
    Ok(())
}
