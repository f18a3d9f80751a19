//! Timegate Daemon - per-domain browsing time tracking and enforcement
//!
//! This binary runs as a background daemon, accepting browser events
//! from integrations and enforcing per-domain time limits.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! timegated start
//!
//! # Start the daemon (background/daemonized)
//! timegated start -d
//!
//! # Stop the daemon
//! timegated stop
//!
//! # Check daemon status
//! timegated status
//!
//! # Start with custom socket path
//! TIMEGATE_SOCKET=/run/timegate.sock timegated start
//!
//! # Enable debug logging
//! RUST_LOG=timegated=debug timegated start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown (flushes the running session)

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use timegated::engine::spawn_engine;
use timegated::server::{DaemonServer, DEFAULT_SOCKET_PATH};
use timegated::storage::Storage;
use timegated::store::JsonFileStore;
use timegated::tasks::spawn_sweep_task;

/// Timegate daemon - per-domain browsing time limits
#[derive(Parser, Debug)]
#[command(name = "timegated", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Unix socket path (overrides TIMEGATE_SOCKET)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// State file path (overrides TIMEGATE_STATE)
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

/// Runtime files (PID, log, default state) live under the XDG state dir.
fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("timegate")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("timegated.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("timegated.log")
}

fn default_state_file_path() -> PathBuf {
    state_dir().join("state.json")
}

/// PID of a live daemon, if one is running. A PID file pointing at a
/// dead process is treated as stale and removed.
fn running_pid() -> Option<u32> {
    let pid: u32 = fs::read_to_string(pid_file_path())
        .ok()?
        .trim()
        .parse()
        .ok()?;

    if process_alive(pid) {
        Some(pid)
    } else {
        let _ = fs::remove_file(pid_file_path());
        None
    }
}

fn process_alive(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn write_pid_file() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    fs::write(&path, process::id().to_string()).context("Failed to write PID file")
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Bare `timegated` behaves like `timegated start`
    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        socket: None,
        state_file: None,
    });

    match command {
        Command::Start {
            daemon,
            socket,
            state_file,
        } => start(daemon, socket, state_file),
        Command::Stop => stop(),
        Command::Status => status(),
    }
}

fn start(daemon: bool, socket: Option<PathBuf>, state_file: Option<PathBuf>) -> Result<()> {
    if let Some(pid) = running_pid() {
        eprintln!("Daemon is already running (PID {pid})");
        eprintln!("Use 'timegated stop' to stop it first.");
        process::exit(1);
    }

    if daemon {
        // Fork before the tokio runtime exists
        daemonize()?;
    }

    write_pid_file()?;
    let result = run_daemon(socket, state_file);
    let _ = fs::remove_file(pid_file_path());
    result
}

fn stop() -> Result<()> {
    let Some(pid) = running_pid() else {
        println!("Daemon is not running.");
        return Ok(());
    };

    println!("Stopping daemon (PID {pid})...");
    send_sigterm(pid)?;

    // Give it five seconds to flush and exit
    for _ in 0..50 {
        if !process_alive(pid) {
            println!("Daemon stopped.");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    eprintln!("Daemon did not stop within 5 seconds.");
    process::exit(1);
}

fn status() -> Result<()> {
    let Some(pid) = running_pid() else {
        println!("Daemon is not running.");
        process::exit(1);
    };

    println!("Daemon is running (PID {pid})");
    let socket_path =
        env::var("TIMEGATE_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string());
    if PathBuf::from(&socket_path).exists() {
        println!("Socket: {socket_path}");
    }
    Ok(())
}

fn send_sigterm(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid as i32, libc::SIGTERM) } != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
}

/// Forks to the background, redirecting stdout/stderr to the log file.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }
    let stdout = fs::File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = fs::File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// The async daemon proper: storage, engine, sweep task, server.
#[tokio::main]
async fn run_daemon(socket: Option<PathBuf>, state_file: Option<PathBuf>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("timegated=info".parse()?)
                .add_directive("timegate_core=info".parse()?)
                .add_directive("timegate_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Timegate daemon starting"
    );

    // Path resolution: CLI flag, then environment, then default
    let socket_path = socket.unwrap_or_else(|| {
        env::var("TIMEGATE_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH))
    });
    let state_path = state_file.unwrap_or_else(|| {
        env::var("TIMEGATE_STATE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_state_file_path())
    });

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let store = JsonFileStore::open(&state_path)
        .await
        .context("Failed to open state file")?;
    let storage = Storage::new(Arc::new(store));

    let (engine, engine_task) = spawn_engine(storage)
        .await
        .context("Failed to start engine")?;
    info!(state_file = %state_path.display(), "Engine started");

    let _sweep_handle = spawn_sweep_task(engine.clone(), cancel_token.clone());
    info!("Sweep task started");

    let server = DaemonServer::new(&socket_path, engine.clone(), cancel_token);
    info!(socket = %socket_path.display(), "Starting server");
    let server_result = server.run().await;

    // Land the running session's time before the process goes away
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Engine shutdown failed");
    }
    let _ = engine_task.await;

    if let Err(e) = server_result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Timegate daemon stopped");
    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
