use std::time::Duration;

use clap::Parser;

use aethersense_bridge_lib::{config::BridgeConfig, LaunchOptions};

/// Run an AetherSense engine and follow its telemetry from the terminal.
#[derive(Debug, Parser)]
#[command(name = "aethersense-bridge", version)]
struct Cli {
    /// Records kept in the sliding window
    #[arg(long)]
    history: Option<usize>,

    /// Maximum retained engine log lines
    #[arg(long)]
    log_capacity: Option<usize>,

    /// Grace period between the stop signal and a forced kill
    #[arg(long)]
    stop_grace_ms: Option<u64>,

    /// Seconds between status lines
    #[arg(long, default_value_t = 1)]
    status_every_secs: u64,

    /// Stop the engine after this many seconds
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Verbose bridge logging
    #[arg(long)]
    debug: bool,

    /// Engine command followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    engine: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = BridgeConfig::from_env();
    if let Some(history) = cli.history {
        config.history_capacity = history;
    }
    if let Some(log_capacity) = cli.log_capacity {
        config.log_capacity = log_capacity;
    }
    if let Some(ms) = cli.stop_grace_ms {
        config.stop_grace = Duration::from_millis(ms);
    }
    config.debug |= cli.debug;

    let mut engine = cli.engine.into_iter();
    let command = engine
        .next()
        .ok_or_else(|| anyhow::anyhow!("engine command is required"))?;

    aethersense_bridge_lib::run(
        config.normalized(),
        LaunchOptions {
            command,
            args: engine.collect(),
            status_every: Duration::from_secs(cli.status_every_secs.max(1)),
            run_for: cli.run_for_secs.map(Duration::from_secs),
        },
    )
}
