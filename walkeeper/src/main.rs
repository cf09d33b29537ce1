//! walkeeper - WAL and base backup archiver
//!
//! Every command exits 0 on success, 1 on an operational failure (missing
//! segment, storage error, verification failure) and 2 on a usage error.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkeeper::backup::manifest::BackupManifest;
use walkeeper::backup::{verify_restored, BaseBackups};
use walkeeper::config::Config;
use walkeeper::fs::FsyncEnforcer;
use walkeeper::retention::{DeleteTarget, RetentionManager};
use walkeeper::transfer::progress::format_bytes;
use walkeeper::transfer::TransferEngine;
use walkeeper::utils::shutdown::ShutdownCoordinator;
use walkeeper::wal::WalArchiver;
use walkeeper::{utils, ArchiveError, Result};

#[derive(Parser, Debug)]
#[command(name = "walkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(global = true, short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Object store URL (overrides config)
    #[arg(global = true, long, value_name = "URL")]
    store: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(global = true, short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive a WAL segment that the database marked ready
    WalPush {
        segment_path: PathBuf,
    },

    /// Restore a WAL segment to a path
    WalFetch {
        segment_name: String,
        dest_path: PathBuf,
    },

    /// Download upcoming WAL segments into the local cache
    WalPrefetch {
        base_dir: PathBuf,
        segment_name: String,
    },

    /// Take a base backup of a directory
    BackupPush {
        source_dir: PathBuf,
    },

    /// Restore a base backup (or LATEST) into a directory
    BackupFetch {
        dest_dir: PathBuf,
        backup: String,
    },

    /// Check a restored directory against its backup manifest
    BackupVerify {
        /// Also compare SHA-256 digests of file contents
        #[arg(long)]
        verify_checksums: bool,

        dir: PathBuf,
    },

    /// List completed backups, oldest first
    BackupList {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete backups and WAL segments
    Delete {
        /// Required for every delete
        #[arg(long, global = true)]
        confirm: bool,

        #[command(subcommand)]
        target: DeleteCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DeleteCommand {
    /// All backups and all WAL segments
    Everything,
    /// Keep only the newest COUNT completed backups
    Retain { count: usize },
    /// Completed backups older than BACKUP_ID
    Before { backup_id: String },
}

#[derive(Serialize)]
struct BackupSummary<'a> {
    backup_id: &'a str,
    created_at: String,
    completed_at: Option<String>,
    partitions: usize,
    files: usize,
    bytes: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("walkeeper: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };
    if let Some(url) = &cli.store {
        config.store.url = Some(url.clone());
    }

    // Initialize logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("walkeeper: failed to initialise logging: {}", e);
    }

    let shutdown = ShutdownCoordinator::new(CancellationToken::new());
    let listener = shutdown.listen();

    let result = run(&cli, &config, shutdown.token()).await;
    listener.abort();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match (&cli.command, &e) {
                (Command::WalFetch { .. }, ArchiveError::ObjectNotFound(_)) => {
                    info!("{}", e)
                }
                _ => error!("{}", e),
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: &Cli, config: &Config, cancel: CancellationToken) -> Result<()> {
    // Verification is purely local
    if let Command::BackupVerify {
        verify_checksums,
        dir,
    } = &cli.command
    {
        return backup_verify(dir, *verify_checksums);
    }

    let engine = TransferEngine::from_config(config, cancel)?;

    match &cli.command {
        Command::WalPush { segment_path } => {
            let archiver = WalArchiver::new(engine.clone(), config.wal.clone());
            archiver.push(segment_path).await?;
        }
        Command::WalFetch {
            segment_name,
            dest_path,
        } => {
            let archiver = WalArchiver::new(engine.clone(), config.wal.clone());
            archiver.fetch(segment_name, dest_path).await?;
            if config.wal.prefetch_window > 0 {
                if let Some(next) = archiver.next_segment(segment_name) {
                    spawn_prefetch(cli, config, dest_path, &next);
                }
            }
        }
        Command::WalPrefetch {
            base_dir,
            segment_name,
        } => {
            let archiver = WalArchiver::new(engine.clone(), config.wal.clone());
            // Cache warming never fails the caller
            if let Err(e) = archiver.prefetch(base_dir, segment_name).await {
                warn!("Prefetch from {} failed: {}", segment_name, e);
            }
        }
        Command::BackupPush { source_dir } => {
            let backups = BaseBackups::new(engine.clone(), config.backup.clone(), &config.wal.state_dir);
            let manifest = backups.push(source_dir).await?;
            println!("{}", manifest.backup_id);
        }
        Command::BackupFetch { dest_dir, backup } => {
            let backups = BaseBackups::new(engine.clone(), config.backup.clone(), &config.wal.state_dir);
            backups
                .fetch(dest_dir, backup, Arc::new(FsyncEnforcer))
                .await?;
        }
        Command::BackupList { json } => {
            let backups = BaseBackups::new(engine.clone(), config.backup.clone(), &config.wal.state_dir);
            print_backups(&backups.list().await?, *json)?;
        }
        Command::Delete { confirm, target } => {
            let target = match target {
                DeleteCommand::Everything => DeleteTarget::Everything,
                DeleteCommand::Retain { count } => DeleteTarget::Retain(*count),
                DeleteCommand::Before { backup_id } => DeleteTarget::Before(backup_id.clone()),
            };
            RetentionManager::new(engine.clone())
                .delete(&target, *confirm)
                .await?;
        }
        Command::BackupVerify { .. } => {}
    }

    info!("{}", engine.stats().summary());
    Ok(())
}

fn backup_verify(dir: &Path, verify_checksums: bool) -> Result<()> {
    let report = verify_restored(dir, verify_checksums)?;
    for discrepancy in &report.discrepancies {
        eprintln!("{}", discrepancy);
    }
    let report = report.into_result()?;
    info!(
        "Verified {} entries in {}{}",
        report.checked,
        dir.display(),
        if verify_checksums { " with checksums" } else { "" }
    );
    Ok(())
}

fn print_backups(manifests: &[BackupManifest], json: bool) -> Result<()> {
    let summaries: Vec<BackupSummary> = manifests
        .iter()
        .map(|m| BackupSummary {
            backup_id: &m.backup_id,
            created_at: m.created_at.to_rfc3339(),
            completed_at: m.completed_at.map(|t| t.to_rfc3339()),
            partitions: m.partitions.len(),
            files: m.file_count(),
            bytes: m.total_bytes(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!(
        "{:<40} {:<26} {:>10} {:>8} {:>12}",
        "backup_id", "completed_at", "partitions", "files", "size"
    );
    for s in &summaries {
        println!(
            "{:<40} {:<26} {:>10} {:>8} {:>12}",
            s.backup_id,
            s.completed_at.as_deref().unwrap_or("-"),
            s.partitions,
            s.files,
            format_bytes(s.bytes)
        );
    }
    Ok(())
}

/// Start a detached `wal-prefetch` for the segments after the one just
/// fetched. Failure to start it only costs speed.
fn spawn_prefetch(cli: &Cli, config: &Config, dest_path: &Path, next: &str) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            warn!("Cannot locate own executable for prefetch: {}", e);
            return;
        }
    };
    let base_dir = match dest_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut command = std::process::Command::new(exe);
    if let Some(path) = &cli.config {
        command.arg("--config").arg(path);
    }
    if let Some(url) = &config.store.url {
        command.arg("--store").arg(url);
    }
    if let Some(level) = &cli.log_level {
        command.arg("--log-level").arg(level);
    }
    command
        .arg("wal-prefetch")
        .arg(&base_dir)
        .arg(next)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    match command.spawn() {
        Ok(child) => debug!("Started prefetch from {} (pid {})", next, child.id()),
        Err(e) => warn!("Failed to start prefetch from {}: {}", next, e),
    }
}
