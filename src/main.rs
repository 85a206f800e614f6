//! CLI Entry Point for edt-pdv
//!
//! Drives cameras on the simulated frame grabber:
//! - `run`: acquire a number of frames from every configured camera
//! - `report`: connect and print camera reports
//! - `check-config`: validate a configuration file
//!
//! # Usage
//!
//! ```bash
//! edt-pdv run --config config/edt_pdv.toml --frames 100
//! edt-pdv report --config config/edt_pdv.toml --verbosity 2
//! edt-pdv check-config config/edt_pdv.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edt_pdv::config::AppConfig;
use edt_pdv::sim::{SimDriver, SimSensor};
use edt_pdv::{
    tracing_setup, BufferPool, CameraConfig, CameraRegistry, ChannelSink, FrameSink, ImageMode,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "edt-pdv")]
#[command(about = "EDT PDV camera acquisition on a simulated frame grabber", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire frames from every configured camera
    Run {
        /// Configuration file
        #[arg(long, default_value = "config/edt_pdv.toml")]
        config: PathBuf,

        /// Frames per camera
        #[arg(long, default_value = "10")]
        frames: u32,

        /// Give up after this many seconds
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Print per-camera counters and timers as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect every configured camera and print its report
    Report {
        /// Configuration file
        #[arg(long, default_value = "config/edt_pdv.toml")]
        config: PathBuf,

        /// Report detail (0-3)
        #[arg(long, default_value = "1")]
        verbosity: u32,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            frames,
            timeout,
            json,
        } => run(&config, frames, Duration::from_secs(timeout), json).await,
        Commands::Report { config, verbosity } => report(&config, verbosity).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load(path: &Path) -> Result<AppConfig> {
    let mut config = AppConfig::load_validated(path)
        .with_context(|| format!("loading {}", path.display()))?;
    tracing_setup::init_from_config(&config).map_err(anyhow::Error::msg)?;

    if config.cameras.is_empty() {
        warn!(path = %path.display(), "No cameras configured, using one simulated camera");
        config.cameras.push(CameraConfig::new("SIM1", "sim"));
    }
    Ok(config)
}

fn create_all(
    config: &AppConfig,
    sink: Arc<dyn FrameSink>,
) -> Result<(CameraRegistry, BufferPool)> {
    let pool = BufferPool::new(config.pool.max_buffers, config.pool.max_memory);
    let driver = Arc::new(SimDriver::new(SimSensor::default()));
    let registry = CameraRegistry::new();
    for camera in &config.cameras {
        registry.create(camera.clone(), driver.clone(), pool.clone(), Arc::clone(&sink))?;
    }
    Ok((registry, pool))
}

async fn shutdown(registry: CameraRegistry) -> Result<()> {
    tokio::task::spawn_blocking(move || registry.shutdown_all())
        .await
        .context("shutting down cameras")
}

async fn run(path: &Path, frames: u32, timeout: Duration, json: bool) -> Result<()> {
    let config = load(path)?;
    let sink = Arc::new(ChannelSink::new(256));
    let mut rx = sink.subscribe();
    let (registry, pool) = create_all(&config, sink)?;

    for name in registry.names() {
        if let Some(camera) = registry.get(&name) {
            camera.set_image_mode(ImageMode::Multiple);
            camera.set_num_images(frames)?;
            camera.set_acquiring(true);
        }
    }

    let expected = u64::from(frames) * registry.len() as u64;
    let mut per_size: BTreeMap<(u32, u32), u64> = BTreeMap::new();
    let mut received = 0_u64;
    let mut lagged = 0_u64;
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + timeout;

    while received + lagged < expected {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(frame)) => {
                received += 1;
                *per_size
                    .entry((frame.width, frame.height))
                    .or_default() += 1;
            }
            Ok(Err(RecvError::Lagged(n))) => lagged += n,
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {
                warn!(received, expected, "Timed out waiting for frames");
                break;
            }
        }
    }

    let elapsed = started.elapsed();
    info!(received, lagged, ?elapsed, "Acquisition finished");
    println!("Received {received} frames ({lagged} lagged) in {elapsed:?}");
    for ((width, height), count) in &per_size {
        println!("  {width} x {height}: {count} frames");
    }
    let mut summary = serde_json::Map::new();
    for name in registry.names() {
        if let Some(camera) = registry.get(&name) {
            let stats = camera.stats();
            if json {
                summary.insert(
                    name.clone(),
                    serde_json::json!({ "stats": stats, "timing": camera.timing() }),
                );
                continue;
            }
            println!(
                "  {name}: {} delivered, {} timeouts, {} dropped",
                stats.frames_delivered, stats.timeouts, stats.dropped
            );
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    let pool_stats = pool.stats();
    println!(
        "Pool: {} buffers, {} bytes allocated",
        pool_stats.allocated_buffers, pool_stats.memory_bytes
    );

    shutdown(registry).await
}

async fn report(path: &Path, verbosity: u32) -> Result<()> {
    let config = load(path)?;
    let sink: Arc<dyn FrameSink> = Arc::new(edt_pdv::DiscardSink);
    let (registry, _pool) = create_all(&config, sink)?;
    print!("{}", registry.show_all(verbosity.saturating_add(1)));
    shutdown(registry).await
}

fn check_config(path: &Path) -> Result<()> {
    let config = AppConfig::load_validated(path)
        .with_context(|| format!("loading {}", path.display()))?;
    println!("{}: OK", path.display());
    println!(
        "  logging: {} ({})",
        config.logging.level, config.logging.format
    );
    for camera in &config.cameras {
        println!(
            "  {}: unit {} channel {}, {} -> {}",
            camera.name,
            camera.unit,
            camera.channel,
            camera.model,
            camera.config_file(camera.trigger_mode).display()
        );
    }
    Ok(())
}
