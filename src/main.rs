//! `warden` - runs the resource governor around the current process.
//!
//! Wires a [`Runtime`] with `sysinfo` metrics and a transport that only
//! logs, waits for Ctrl-C, then runs the shutdown sequence and prints the
//! per-task outcomes as JSON.

use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use warden_core::backpressure::Transport;
use warden_core::governor::SysinfoMetrics;
use warden_core::runtime::Runtime;
use warden_core::Config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
    /// Override the memory ceiling in MB
    #[arg(long)]
    max_memory_mb: Option<f64>,
}

/// Transport that records deliveries in the log instead of sending them.
#[derive(Debug)]
struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, channel: &str, data: Value) -> warden_core::Result<()> {
        tracing::info!("message_delivered: channel={}, data={}", channel, data);
        Ok(())
    }

    async fn send_batch(&self, channel: &str, batch: Vec<Value>) -> warden_core::Result<()> {
        tracing::info!("batch_delivered: channel={}, size={}", channel, batch.len());
        Ok(())
    }

    async fn invoke(&self, channel: &str, data: &Value) -> warden_core::Result<Value> {
        tracing::info!("invoke: channel={}", channel);
        Ok(data.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;
    if cli.json_logs {
        config.observability.json_logs = true;
    }
    if let Some(mb) = cli.max_memory_mb {
        config.governor.limits.max_memory_mb = mb;
    }

    warden_core::observability::init_tracing(&config.observability);

    let runtime = Runtime::new(config, Arc::new(SysinfoMetrics::new()?));
    runtime.throttle().set_transport(Arc::new(LogTransport)).await;
    runtime.init().await?;

    runtime
        .governor()
        .on_memory_warning(Arc::new(|mb: f64| {
            tracing::warn!("memory_warning: measured_mb={:.0}", mb);
        }))
        .await;

    tracing::info!("warden_running: press Ctrl-C to shut down");
    tokio::signal::ctrl_c().await?;

    if let Some(outcomes) = runtime.shutdown().await {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    }
    Ok(())
}
