//! CLI entry point for the day merger
//!
//! Parses command line arguments, loads the configuration, and runs either
//! the scan loop or one of the maintenance modes.
//!
//! Ctrl-C and SIGTERM stop the loop after the current step. A stall monitor
//! watches the daemon's heartbeat and exits non-zero when no progress is made
//! within `--watchdog-timeout`.

use chrono::Utc;
use clap::Parser;
use daymerge::{watch_heartbeat, Config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Merges hourly camera recordings into one file per camera and day
#[derive(Parser, Debug)]
#[command(name = "daymerge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Run one cycle and exit
    #[arg(long)]
    single_run: bool,

    /// Merge dates even if already processed; include today's finished hours
    #[arg(long)]
    ignore_processed: bool,

    /// Probe every source file with ffprobe
    #[arg(long)]
    deep_check: bool,

    /// Verify process records, list merged dates, and exit
    #[arg(long)]
    verify_only: bool,

    /// With --verify-only: also drop stale failed records
    #[arg(long)]
    clean_records: bool,

    /// Delete original recordings past retention and exit
    #[arg(long)]
    cleanup_original: bool,

    /// Delete merged files past retention and exit
    #[arg(long)]
    cleanup_merged: bool,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long)]
    skip_checks: bool,

    /// Seconds without progress before the process exits with an error (0 disables)
    #[arg(long, default_value_t = 3600)]
    watchdog_timeout: u64,
}

/// Time a stalled daemon gets to wind down before the process exits.
const STALL_GRACE: Duration = Duration::from_secs(30);

/// Stall limit for the run, never shorter than one supervised slice.
fn watchdog_limit(args: &Args, config: &Config) -> Option<Duration> {
    if args.watchdog_timeout == 0 {
        return None;
    }
    let floor = config.merge.sub_timeout_secs + STALL_GRACE.as_secs();
    if args.watchdog_timeout < floor {
        warn!(
            requested_secs = args.watchdog_timeout,
            limit_secs = floor,
            "watchdog timeout shorter than one ffmpeg slice; raising it"
        );
        return Some(Duration::from_secs(floor));
    }
    Some(Duration::from_secs(args.watchdog_timeout))
}

/// Cancels `cancel` on Ctrl-C or SIGTERM.
fn spawn_shutdown_listener(cancel: CancellationToken) {
    #[cfg(unix)]
    let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            None
        }
    };

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match terminate.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => info!("received Ctrl-C; finishing the current step"),
            _ = terminate => info!("received SIGTERM; finishing the current step"),
        }
        cancel.cancel();
    });
}

/// Watches the daemon's heartbeat until `stop` fires.
///
/// On a stall the daemon is cancelled and, if it has not returned within
/// [`STALL_GRACE`], the process exits with status 1.
fn spawn_stall_monitor(
    daemon: &Daemon,
    limit: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
) -> Arc<AtomicBool> {
    let stalled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stalled);
    let beats = daemon.heartbeat().subscribe();

    tokio::spawn(async move {
        if !watch_heartbeat(beats, limit, &stop).await {
            return;
        }
        error!(limit_secs = limit.as_secs(), "no progress within the watchdog limit; shutting down");
        flag.store(true, Ordering::SeqCst);
        cancel.cancel();

        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(STALL_GRACE) => {
                error!("daemon did not stop after a stall; exiting");
                std::process::exit(1);
            }
        }
    });
    stalled
}

fn load_config(args: &Args) -> Result<Config, DaemonError> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        warn!(path = %args.config.display(), "config file not found; using defaults");
        Config::from_env()?
    };
    if args.deep_check {
        config.scan.deep_check = true;
    }
    Ok(config)
}

fn build_daemon(skip_checks: bool, config: Config, cancel: CancellationToken) -> Result<Daemon, DaemonError> {
    if skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        let transcoder = daymerge::FfmpegTranscoder::new(
            config.merge.ffmpeg_path.clone(),
            config.merge.ffprobe_path.clone(),
        );
        let hw_accel = config.merge.use_hw_accel;
        Daemon::with_transcoder(config, std::sync::Arc::new(transcoder), hw_accel, cancel)
    } else {
        Daemon::new(config, cancel)
    }
}

/// Runs startup checks and loads records on the blocking pool, bounded by `limit`.
async fn start_daemon(
    args: &Args,
    config: Config,
    cancel: CancellationToken,
    limit: Option<Duration>,
) -> Result<Daemon, DaemonError> {
    let skip_checks = args.skip_checks;
    let startup = tokio::task::spawn_blocking(move || build_daemon(skip_checks, config, cancel));
    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, startup).await {
            Ok(joined) => joined,
            Err(_) => {
                error!(limit_secs = limit.as_secs(), "startup checks did not finish within the watchdog limit");
                std::process::exit(1);
            }
        },
        None => startup.await,
    };
    joined.map_err(|e| DaemonError::Task(e.to_string()))?
}

/// Returns `Ok(true)` when the stall monitor stopped the daemon.
async fn run(args: Args) -> Result<bool, DaemonError> {
    let config = load_config(&args)?;
    info!(
        config = %args.config.display(),
        video_root = %config.paths.video_root.display(),
        merged_root = %config.merged_root().display(),
        "configuration loaded"
    );

    let limit = watchdog_limit(&args, &config);
    let cancel = CancellationToken::new();
    let mut daemon = start_daemon(&args, config, cancel.clone(), limit).await?;
    daemon.set_force(args.ignore_processed);

    if args.verify_only {
        daemon.verify_records(Utc::now()).await?;
        if args.clean_records {
            daemon.clean_records()?;
        }
        let records = daemon.successful_records();
        println!("{} merged camera-days:", records.len());
        for record in records {
            println!("  {} {} -> {}", record.date, record.camera, record.output_path.display());
        }
        return Ok(false);
    }

    if args.cleanup_original || args.cleanup_merged {
        if args.cleanup_original {
            let report = daemon.cleanup_originals(Utc::now()).await?;
            info!(deleted = report.files_deleted, failures = report.failures, "original cleanup finished");
        }
        if args.cleanup_merged {
            let report = daemon.cleanup_merged(Utc::now())?;
            info!(deleted = report.files_deleted, failures = report.failures, "merged cleanup finished");
        }
        return Ok(false);
    }

    if args.clean_records {
        daemon.clean_records()?;
    }

    spawn_shutdown_listener(cancel.clone());
    let stop = CancellationToken::new();
    let stalled = match limit {
        Some(limit) => spawn_stall_monitor(&daemon, limit, cancel, stop.clone()),
        None => {
            info!("watchdog disabled");
            Arc::new(AtomicBool::new(false))
        }
    };

    let result = daemon.run(args.single_run).await;
    stop.cancel();
    result?;
    Ok(stalled.load(Ordering::SeqCst))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("daymerge=info")),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => {
            error!("daymerge stopped by the watchdog");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "daymerge failed");
            ExitCode::FAILURE
        }
    }
}
