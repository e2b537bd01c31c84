//! overseek-sync: runs in-process tab simulations on top of the runtime
//! drivers and prints the outcome as JSON.

use std::time::Duration;

use clap::Parser;

use overseek_sync_runtime::simulate::{self, PollingScenario};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("OVERSEEK_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config()?;

    match args.command {
        cli::Command::SimulatePolling(opts) => {
            anyhow::ensure!(opts.tabs > 0, "--tabs must be at least 1");
            let scenario = PollingScenario {
                tabs: opts.tabs,
                ticks: opts.ticks,
                interval: Duration::from_millis(opts.interval_ms.max(1)),
                channel: opts.channel,
            };
            let report = tokio::select! {
                report = simulate::simulate_polling(&scenario, &config) => report?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted");
                    return Ok(());
                }
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        cli::Command::SimulatePresence(opts) => {
            anyhow::ensure!(!opts.users.is_empty(), "--users must name at least one user");
            let report = simulate::simulate_presence(&opts.users, &opts.document, &config).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        cli::Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
