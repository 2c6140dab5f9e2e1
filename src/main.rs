//! depth-recorder CLI
//!
//! Usage:
//!   # Record with the config in DEPTH_RECORDER_CONFIG (or depth_recorder.toml)
//!   cargo run --release -- run
//!
//!   # Override the feed URL and expose Prometheus metrics on :9000
//!   cargo run --release -- run --url wss://feed/ws --metrics-port 9000
//!
//!   # List recorded files with row counts
//!   cargo run --release -- check --json

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use tracing::{info, warn};

use depth_recorder::feed::WebSocketFeed;
use depth_recorder::recorder::sink::{self, PARQUET_EXT};
use depth_recorder::shutdown;
use depth_recorder::{Recorder, RecorderConfig};

#[derive(Parser, Debug)]
#[command(name = "depth-recorder")]
#[command(about = "Record market depth updates to time-bucketed Parquet files")]
struct Args {
    /// TOML config file (default: $DEPTH_RECORDER_CONFIG, then built-in defaults)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Output root directory
    #[arg(long, env = "DEPTH_RECORDER_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Instrument directory name
    #[arg(long)]
    instrument: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the feed and record until Ctrl+C
    Run {
        /// WebSocket URL of the depth feed
        #[arg(long, env = "DEPTH_FEED_URL")]
        url: Option<String>,

        #[arg(long)]
        flush_interval_ms: Option<u64>,

        #[arg(long)]
        buffer_capacity: Option<usize>,

        /// Serve Prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// List recorded Parquet files and their row counts
    Check {
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depth_recorder=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RecorderConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => RecorderConfig::from_env(),
    };
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }
    if let Some(instrument) = args.instrument {
        config.instrument = instrument;
    }

    match args.command {
        Commands::Run {
            url,
            flush_interval_ms,
            buffer_capacity,
            metrics_port,
        } => {
            if let Some(url) = url {
                config.feed.url = url;
            }
            if let Some(ms) = flush_interval_ms {
                config.flush_interval_ms = ms;
            }
            if let Some(capacity) = buffer_capacity {
                config.buffer_capacity = capacity;
            }
            run(config, metrics_port).await
        }
        Commands::Check { json } => check(&config, json),
        Commands::Config => {
            config.validate().context("Invalid configuration")?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(config: RecorderConfig, metrics_port: Option<u16>) -> Result<()> {
    if let Some(port) = metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!(%addr, "metrics_exporter_listening");
    }

    let feed = WebSocketFeed::new(config.feed.clone());
    let mut recorder = Recorder::new(config, feed).context("Failed to build recorder")?;
    let stats = recorder.stats();

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl_c_received"),
            Err(e) => warn!(error = %e, "ctrl_c_handler_failed"),
        }
        trigger.trigger();
    });

    let result = recorder.run(shutdown).await;
    let snapshot = stats.snapshot();
    info!(
        levels = snapshot.levels_recorded,
        flushed = snapshot.records_flushed,
        final_records = snapshot.final_records,
        lost = snapshot.records_lost,
        "recording_finished"
    );

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(e).context("Recorder stopped with an error"),
    }
}

#[derive(Debug, Serialize)]
struct FileReport {
    path: PathBuf,
    rows: i64,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    root: PathBuf,
    files: Vec<FileReport>,
    total_rows: i64,
    unreadable: Vec<PathBuf>,
}

fn check(config: &RecorderConfig, json: bool) -> Result<()> {
    let root = config.base_dir.join(&config.instrument);
    let mut paths = Vec::new();
    collect_parquet(&root, &mut paths)
        .with_context(|| format!("Failed to scan {}", root.display()))?;
    paths.sort();

    let mut report = CheckReport {
        root,
        files: Vec::new(),
        total_rows: 0,
        unreadable: Vec::new(),
    };
    for path in paths {
        match sink::count_rows(&path) {
            Ok(rows) => {
                report.total_rows += rows;
                report.files.push(FileReport { path, rows });
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable_parquet_file");
                report.unreadable.push(path);
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Recording root: {}", report.root.display());
    println!();
    if report.files.is_empty() && report.unreadable.is_empty() {
        println!("  No Parquet files found.");
        return Ok(());
    }
    for file in &report.files {
        let shown = file.path.strip_prefix(&report.root).unwrap_or(&file.path);
        println!("  {:<48} {:>12} rows", shown.display(), file.rows);
    }
    for path in &report.unreadable {
        println!("  {:<48} {:>17}", path.display(), "UNREADABLE");
    }
    println!();
    println!("Files:      {}", report.files.len());
    println!("Total rows: {}", report.total_rows);
    Ok(())
}

fn collect_parquet(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_parquet(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == PARQUET_EXT) {
            out.push(path);
        }
    }
    Ok(())
}
