use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use enhance_jobs::{
    EncodeOptions, EnhanceConfig, JobManager, JobState, JobStatusView, QualityTier, ResolutionMode,
    RetentionSweeper, SessionRegistry, VideoCodec,
};
use humansize::{format_size, DECIMAL};
use log::{error, info, warn, LevelFilter};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Video enhancement job runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enhance one or more videos and follow them until they finish
    Run {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// auto, 720p or 1080p
        #[arg(long, default_value_t = ResolutionMode::Auto)]
        resolution: ResolutionMode,

        /// low, medium or high
        #[arg(long, default_value_t = QualityTier::Medium)]
        quality: QualityTier,

        /// h264 or h265
        #[arg(long, default_value_t = VideoCodec::H264)]
        codec: VideoCodec,

        /// Session to register inputs and outputs under
        #[arg(long)]
        session: Option<String>,

        /// Delete the session's files once every job has finished
        #[arg(long, requires = "session")]
        cleanup_session: bool,

        /// Status poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },
    /// Print the status of a job
    Status { job_id: String },
    /// Stop a job and remove its output
    Cancel { job_id: String },
    /// List enhanced videos in the processed directory
    List,
    /// Report disk usage of the working directories
    Usage,
    /// Delete expired working files once
    Sweep,
    /// Run the retention sweeper until interrupted
    Serve,
}

#[derive(Serialize)]
struct SubmitFailure<'a> {
    input: &'a std::path::Path,
    kind: &'static str,
    error: String,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value).context("Failed to serialize output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - use RUST_LOG env var, --verbose raises this crate family to debug
    let mut logger = env_logger::Builder::from_default_env();
    logger.format_timestamp_secs();
    if args.verbose {
        logger.filter_module("enhance_jobs", LevelFilter::Debug);
        logger.filter_module("enhanced", LevelFilter::Debug);
    }
    logger.init();

    let cfg = EnhanceConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::Run { inputs, resolution, quality, codec, session, cleanup_session, poll_ms } => {
            let options = EncodeOptions { resolution, quality, codec };
            run(&cfg, inputs, options, session, cleanup_session, Duration::from_millis(poll_ms.max(50))).await
        }
        Command::Status { job_id } => {
            let manager = JobManager::from_config(&cfg, Arc::new(SessionRegistry::new()));
            let view = manager.status(&job_id).await
                .with_context(|| format!("Failed to resolve status of {}", job_id))?;
            print_json(&view)
        }
        Command::Cancel { job_id } => {
            let manager = JobManager::from_config(&cfg, Arc::new(SessionRegistry::new()));
            let outcome = manager.cancel(&job_id).await
                .with_context(|| format!("Failed to cancel {}", job_id))?;
            print_json(&serde_json::json!({ "job_id": job_id, "outcome": outcome }))
        }
        Command::List => {
            let manager = JobManager::from_config(&cfg, Arc::new(SessionRegistry::new()));
            for entry in manager.list_outputs().await.context("Failed to list outputs")? {
                print_json(&entry)?;
            }
            Ok(())
        }
        Command::Usage => {
            for usage in RetentionSweeper::from_config(&cfg).usage() {
                print_json(&usage)?;
            }
            Ok(())
        }
        Command::Sweep => {
            let report = RetentionSweeper::from_config(&cfg).sweep_once();
            print_json(&report)
        }
        Command::Serve => serve(&cfg).await,
    }
}

async fn run(
    cfg: &EnhanceConfig,
    inputs: Vec<PathBuf>,
    options: EncodeOptions,
    session: Option<String>,
    cleanup_session: bool,
    poll: Duration,
) -> Result<()> {
    cfg.ensure_dirs().context("Failed to prepare working directories")?;

    let sessions = Arc::new(SessionRegistry::new());
    let manager = JobManager::from_config(cfg, sessions.clone());

    // submission returns immediately, so every encode runs concurrently
    let mut pending: HashMap<String, Option<JobStatusView>> = HashMap::new();
    let mut failed = 0usize;
    for input in &inputs {
        match manager.submit(input, options, session.as_deref()).await {
            Ok(receipt) => {
                print_json(&receipt)?;
                pending.insert(receipt.job_id, None);
            }
            Err(e) => {
                error!("Failed to submit {}: {}", input.display(), e);
                print_json(&SubmitFailure { input, kind: e.kind(), error: e.to_string() })?;
                failed += 1;
            }
        }
    }

    let mut interrupted = false;
    let mut ticker = tokio::time::interval(poll);
    while !pending.is_empty() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling {} job(s)", pending.len());
                manager.shutdown().await;
                let report = sessions.cleanup_all().await;
                info!("Removed {} session file(s)", report.deleted.len());
                failed += pending.len();
                pending.clear();
                interrupted = true;
                break;
            }
            _ = ticker.tick() => {}
        }

        let ids: Vec<String> = pending.keys().cloned().collect();
        for job_id in ids {
            let view = manager.status(&job_id).await
                .with_context(|| format!("Failed to resolve status of {}", job_id))?;

            let changed = pending.get(&job_id).map_or(true, |last| {
                last.as_ref().map(|l| (l.status, l.percent)) != Some((view.status, view.percent))
            });
            if changed {
                print_json(&view)?;
            }

            if view.status.is_terminal() {
                if view.status != JobState::Completed {
                    failed += 1;
                } else if let Some(output) = &view.output {
                    let size = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
                    info!("Job {}: {} ready", job_id, format_size(size, DECIMAL));
                }
                pending.remove(&job_id);
            } else {
                pending.insert(job_id, Some(view));
            }
        }
    }

    if cleanup_session && !interrupted {
        if let Some(session) = &session {
            sessions.cleanup_session(session).await;
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} job(s) did not complete", failed, inputs.len()));
    }
    Ok(())
}

async fn serve(cfg: &EnhanceConfig) -> Result<()> {
    cfg.ensure_dirs().context("Failed to prepare working directories")?;

    info!("Retention service starting");
    info!("Configuration loaded:");
    info!("  Uploads dir: {}", cfg.uploads_dir.display());
    info!("  Processed dir: {}", cfg.processed_dir.display());
    info!("  Temp dir: {}", cfg.temp_dir.display());
    info!("  Retention: max age {}s, every {}s", cfg.retention_max_age_secs, cfg.retention_interval_secs);

    let shutdown = CancellationToken::new();
    let sweeper = RetentionSweeper::from_config(cfg).spawn(shutdown.clone());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("🛑 Shutting down");

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Retention sweeper ended abnormally: {}", e);
    }

    info!("✅ Retention sweeper stopped");
    Ok(())
}
