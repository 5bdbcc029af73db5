pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod telemetry;
mod utils;

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use bridge::{commands, ProcessController};
use client::ClientStore;
use config::BridgeConfig;
use telemetry::{LogLine, LogSource};

pub use error::{BridgeError, DecodeError};

/// Everything the presentation side holds on to.
#[derive(Clone)]
pub struct AppState {
    pub bridge: ProcessController,
    pub client: ClientStore,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> Self {
        let config = config.normalized();
        Self {
            client: ClientStore::new(config.history_capacity, config.log_capacity),
            bridge: ProcessController::new(config),
        }
    }
}

/// What the headless host should launch and for how long.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub command: String,
    pub args: Vec<String>,
    pub status_every: Duration,
    pub run_for: Option<Duration>,
}

pub fn run(config: BridgeConfig, launch: LaunchOptions) -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(if config.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    info!("AetherSense bridge starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(serve(AppState::new(config), launch))
}

async fn serve(state: AppState, launch: LaunchOptions) -> Result<()> {
    let cancel = CancellationToken::new();
    let follower = state.client.follow(state.bridge.subscribe(), cancel.clone());
    let mirror = spawn_log_mirror(state.bridge.events().subscribe_logs(), cancel.clone());
    let mut lifecycle = state.bridge.subscribe_state();

    let session = commands::start_engine(&state, launch.command.clone(), launch.args.clone())
        .await
        .map_err(|err| anyhow!(err))?;
    info!(
        "engine session {} running (pid {:?})",
        session.id, session.pid
    );

    let mut ticker = time::interval(launch.status_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = launch.run_for.map(|limit| Instant::now() + limit);

    loop {
        tokio::select! {
            _ = ticker.tick() => log_status(&state).await,
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!("failed to listen for interrupt: {err}");
                }
                info!("interrupt received, stopping engine");
                break;
            }
            _ = wait_until(deadline) => {
                info!("run time elapsed, stopping engine");
                break;
            }
            changed = lifecycle.changed() => {
                if changed.is_err() || lifecycle.borrow_and_update().is_idle() {
                    info!("engine is no longer running");
                    break;
                }
            }
        }
    }

    state.bridge.shutdown().await;
    cancel.cancel();
    for task in [follower, mirror] {
        if let Err(err) = task.await {
            warn!("consumer task failed: {err}");
        }
    }

    log_status(&state).await;
    let status = commands::get_bridge_status(&state)
        .await
        .map_err(|err| anyhow!(err))?;
    info!("bridge {} on exit", status.state);
    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Mirror engine diagnostics into the host log.
fn spawn_log_mirror(
    mut logs: broadcast::Receiver<LogLine>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                line = logs.recv() => match line {
                    Ok(line) => match line.source {
                        LogSource::Stderr => warn!("[engine] {line}"),
                        LogSource::Stdout => info!("[engine] {line}"),
                        LogSource::Bridge => info!("[bridge] {line}"),
                    },
                    Err(RecvError::Lagged(missed)) => warn!("log mirror skipped {missed} lines"),
                    Err(RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    })
}

async fn log_status(state: &AppState) {
    let view = match commands::get_dashboard(state).await {
        Ok(view) => view,
        Err(err) => {
            warn!("dashboard unavailable: {err}");
            return;
        }
    };
    let status = view.status;
    let window = view.window;
    info!(
        "{} | fps {:.1} p95 {:.1}us | energy {:.3} drops {} corrupt {} | window {} samples, present {:.0}%, mean fps {:.1} | records {} logs {} missed {}",
        if status.present { "Present" } else { "Absent" },
        status.fps,
        status.p95_us,
        status.energy_motion,
        status.drops,
        status.corrupt,
        window.samples,
        window.present_ratio * 100.0,
        window.mean_fps,
        view.snapshot.records_received,
        view.snapshot.logs_received,
        view.snapshot.events_missed,
    );
}
