//! cadence: transcode worker and operator commands.
//!
//! Configuration comes from the environment (see `.env.example`). With no
//! `REDIS_URL` the queue runs in degraded in-process mode, so `submit` waits
//! for its own job to finish.

use anyhow::Context;
use cadence_cli::{guess_mime, stage_input, Runtime};
use cadence_core::models::{JobStatus, NewUpload, QueueMode};
use cadence_core::Config;
use cadence_infra::{init_telemetry, shutdown_telemetry};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

const SHUTDOWN_GRACE_SECS: u64 = 30;
const STATUS_POLL_MS: u64 = 250;

#[derive(Parser)]
#[command(name = "cadence", about = "Asynchronous audio transcoding pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume transcode jobs until interrupted
    Worker,
    /// Accept a local audio file and queue it for transcoding
    Submit {
        /// Path to the raw audio file
        file: PathBuf,
        /// Owning user UUID
        #[arg(long, env = "CADENCE_USER_ID")]
        user: Uuid,
        /// Declared MIME type (guessed from the extension when omitted)
        #[arg(long)]
        mime: Option<String>,
        /// Return right after enqueueing, even in degraded mode
        #[arg(long)]
        no_wait: bool,
    },
    /// Show the queue status and upload record of a job
    Status {
        /// Upload / job UUID
        id: Uuid,
    },
    /// Print whether the queue runs durable or degraded
    Mode,
    /// Re-queue every failed job (durable mode only)
    RetryFailed,
    /// Drop every failed job record (durable mode only)
    ClearFailed,
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.validate().context("Invalid configuration")?;
    if let Err(e) = init_telemetry(&config.telemetry) {
        eprintln!("Failed to initialize telemetry: {}", e);
    }

    let consume = matches!(cli.command, Commands::Worker);
    let runtime = Runtime::build(config, consume).await?;

    let result = match cli.command {
        Commands::Worker => run_worker(&runtime).await,
        Commands::Submit {
            file,
            user,
            mime,
            no_wait,
        } => submit(&runtime, file, user, mime, no_wait).await,
        Commands::Status { id } => status(&runtime, id).await,
        Commands::Mode => print_json(&serde_json::json!({ "mode": runtime.queue.mode() })),
        Commands::RetryFailed => {
            let retried = runtime.queue.retry_failed().await?;
            print_json(&serde_json::json!({ "retried": retried }))
        }
        Commands::ClearFailed => {
            let cleared = runtime.queue.clear_failed().await?;
            print_json(&serde_json::json!({ "cleared": cleared }))
        }
    };

    runtime.queue.shutdown().await;
    shutdown_telemetry().await;
    result
}

async fn run_worker(runtime: &Runtime) -> anyhow::Result<()> {
    tracing::info!(
        mode = %runtime.queue.mode(),
        concurrency = runtime.pool.concurrency(),
        "Worker started"
    );

    shutdown_signal().await;

    runtime.queue.shutdown().await;
    if !runtime
        .pool
        .drain(Duration::from_secs(SHUTDOWN_GRACE_SECS))
        .await
    {
        tracing::warn!(
            grace_secs = SHUTDOWN_GRACE_SECS,
            "Jobs still running at shutdown; they will be retried by the broker"
        );
    }
    tracing::info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal");
        },
    }
}

async fn submit(
    runtime: &Runtime,
    file: PathBuf,
    user: Uuid,
    mime: Option<String>,
    no_wait: bool,
) -> anyhow::Result<()> {
    let metadata = tokio::fs::metadata(&file)
        .await
        .with_context(|| format!("Cannot read {}", file.display()))?;
    let original_filename = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", file.display()))?;
    let mime = mime.unwrap_or_else(|| guess_mime(&file).to_string());

    let mut new_upload = NewUpload::new(
        user,
        original_filename,
        mime,
        metadata.len() as i64,
        String::new(),
    );
    let staged = stage_input(&file, &runtime.incoming_dir(), new_upload.id).await?;
    new_upload.temp_path = staged.to_string_lossy().to_string();

    let submission = match runtime.intake.submit(new_upload, None).await {
        Ok(submission) => submission,
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(&staged).await {
                tracing::warn!(path = %staged.display(), error = %remove_err, "Failed to remove staged input");
            }
            return Err(e).context("Submit failed");
        }
    };

    if no_wait || runtime.queue.mode() == QueueMode::Durable {
        return print_json(&submission);
    }

    let status = wait_for(runtime, submission.job.id).await?;
    let upload = runtime.uploads.get(submission.upload.id).await?;
    let track = runtime.tracks.get(submission.upload.id).await?;
    print_json(&serde_json::json!({
        "job": status,
        "upload": upload,
        "track": track,
    }))
}

/// Poll the degraded queue until the job leaves the pending states.
async fn wait_for(runtime: &Runtime, id: Uuid) -> anyhow::Result<Option<JobStatus>> {
    let mut last_progress = None;
    loop {
        let status = runtime.queue.status(id).await?;
        match &status {
            Some(current) if current.state.is_finished() => return Ok(status),
            Some(current) => {
                if last_progress != Some(current.progress) {
                    tracing::info!(job_id = %id, state = %current.state, progress = current.progress, "Waiting for job");
                    last_progress = Some(current.progress);
                }
            }
            None => return Ok(None),
        }
        tokio::time::sleep(Duration::from_millis(STATUS_POLL_MS)).await;
    }
}

async fn status(runtime: &Runtime, id: Uuid) -> anyhow::Result<()> {
    let job = runtime.queue.status(id).await?;
    let upload = runtime.uploads.get(id).await?;
    let track = runtime.tracks.get(id).await?;
    print_json(&serde_json::json!({
        "mode": runtime.queue.mode(),
        "job": job,
        "upload": upload,
        "track": track,
    }))
}
