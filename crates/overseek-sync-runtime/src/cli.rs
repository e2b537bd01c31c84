//! CLI definition using clap derive.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use overseek_sync_core::SyncConfig;

#[derive(Parser)]
#[command(name = "overseek-sync", about = "Cross-tab coordination simulator")]
pub struct Cli {
    /// JSON config file (missing fields use defaults)
    #[arg(long, short = 'c', global = true, env = "OVERSEEK_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override leader.announce_interval_ms
    #[arg(long, global = true, env = "OVERSEEK_ANNOUNCE_MS")]
    pub announce_ms: Option<u64>,

    /// Override leader.settle_ms
    #[arg(long, global = true, env = "OVERSEEK_SETTLE_MS")]
    pub settle_ms: Option<u64>,

    /// Override presence.heartbeat_interval_ms
    #[arg(long, global = true, env = "OVERSEEK_HEARTBEAT_MS")]
    pub heartbeat_ms: Option<u64>,

    /// Override presence.ttl_ms
    #[arg(long, global = true, env = "OVERSEEK_PRESENCE_TTL_MS")]
    pub presence_ttl_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run several tabs polling one channel and print a JSON summary
    SimulatePolling(PollingOpts),
    /// Join several users to one document and print the roster views
    SimulatePresence(PresenceOpts),
    /// Print the effective config as JSON
    Config,
}

#[derive(clap::Args)]
pub struct PollingOpts {
    /// Number of tabs
    #[arg(long, default_value = "3")]
    pub tabs: usize,

    /// Poll intervals to run for
    #[arg(long, default_value = "5")]
    pub ticks: u32,

    /// Poll interval in milliseconds
    #[arg(long, default_value = "500")]
    pub interval_ms: u64,

    /// Polling channel name
    #[arg(long, default_value = "live-analytics")]
    pub channel: String,
}

#[derive(clap::Args)]
pub struct PresenceOpts {
    /// Comma-separated user ids, one tab each
    #[arg(long, value_delimiter = ',', default_value = "ada,bob")]
    pub users: Vec<String>,

    /// Document id to join
    #[arg(long, default_value = "doc-1")]
    pub document: String,
}

impl Cli {
    /// File config (or defaults) with CLI/env overrides applied, validated.
    pub fn load_config(&self) -> anyhow::Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                SyncConfig::from_json(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => SyncConfig::default(),
        };
        if let Some(ms) = self.announce_ms {
            config.leader.announce_interval_ms = ms;
        }
        if let Some(ms) = self.settle_ms {
            config.leader.settle_ms = ms;
        }
        if let Some(ms) = self.heartbeat_ms {
            config.presence.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = self.presence_ttl_ms {
            config.presence.ttl_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}
