use std::{process::Stdio, sync::Arc, time::Duration};

use chrono::Utc;
use log::{info, warn};
use tokio::{
    process::Command,
    sync::{watch, Mutex},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::BridgeConfig,
    error::BridgeError,
    telemetry::{LogLine, LogSource},
};

use super::{
    events::{BridgeSubscription, EventBus},
    state::{LifecycleState, SessionEnd, SessionInfo, StopOutcome},
    stream_worker::{pump_stderr, pump_stdout, supervise, SupervisedChild},
};

/// Slack on top of the grace and drain budgets before `stop` gives up on
/// the supervisor task.
const STOP_SLACK: Duration = Duration::from_millis(500);

struct ActiveSession {
    info: SessionInfo,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<SessionEnd>>,
}

struct Shared {
    session: Mutex<Option<ActiveSession>>,
    state_tx: watch::Sender<LifecycleState>,
    bus: EventBus,
    config: BridgeConfig,
}

impl Shared {
    /// Callers must hold the `session` lock.
    fn set_state(&self, next: LifecycleState) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!("unexpected lifecycle transition {current} -> {next}");
        }
        info!("engine bridge {current} -> {next}");
        self.state_tx.send_replace(next);
    }

    fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }
}

/// Owns the engine subprocess and its output streams.
///
/// At most one session runs at a time. Every decoded record and log line is
/// published on the controller's [`EventBus`]; consumers never touch the
/// process directly.
#[derive(Clone)]
pub struct ProcessController {
    shared: Arc<Shared>,
}

impl ProcessController {
    pub fn new(config: BridgeConfig) -> Self {
        let config = config.normalized();
        let (state_tx, _) = watch::channel(LifecycleState::Idle);
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(None),
                state_tx,
                bus: EventBus::new(config.event_capacity),
                config,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn subscribe(&self) -> BridgeSubscription {
        self.shared.bus.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub async fn session(&self) -> Option<SessionInfo> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map(|active| active.info.clone())
    }

    /// Launch the engine. Returns as soon as the process is running; output
    /// is processed on background tasks.
    pub async fn start(&self, command: &str, args: &[String]) -> Result<SessionInfo, BridgeError> {
        let mut guard = self.shared.session.lock().await;

        if !self.shared.state().is_idle() {
            let session_id = guard
                .as_ref()
                .map(|active| active.info.id.clone())
                .unwrap_or_default();
            return Err(BridgeError::AlreadyRunning { session_id });
        }

        self.shared.set_state(LifecycleState::Starting);

        match self.launch(command, args) {
            Ok(active) => {
                let info = active.info.clone();
                *guard = Some(active);
                self.shared.set_state(LifecycleState::Running);
                info!(
                    "engine session {} started: pid={:?} command={}",
                    info.id, info.pid, info.command
                );
                Ok(info)
            }
            Err(err) => {
                warn!("engine launch failed: {err}");
                self.shared.set_state(LifecycleState::Idle);
                Err(err)
            }
        }
    }

    fn launch(&self, command: &str, args: &[String]) -> Result<ActiveSession, BridgeError> {
        let config = &self.shared.config;

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(BridgeError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(BridgeError::MissingPipe("stderr"))?;

        let session_id = Uuid::new_v4().to_string();
        let info = SessionInfo {
            id: session_id.clone(),
            pid: child.id(),
            command: command.to_string(),
            args: args.to_vec(),
            started_at: Utc::now(),
        };

        let readers = vec![
            tokio::spawn(pump_stdout(
                stdout,
                self.shared.bus.clone(),
                config.max_line_bytes,
                session_id.clone(),
            )),
            tokio::spawn(pump_stderr(
                stderr,
                self.shared.bus.clone(),
                config.max_line_bytes,
                session_id.clone(),
            )),
        ];

        let cancel = CancellationToken::new();
        let supervised = SupervisedChild {
            session_id: session_id.clone(),
            child,
            readers,
            cancel: cancel.clone(),
            stop_grace: config.stop_grace,
            drain_timeout: config.drain_timeout,
        };

        let shared = Arc::clone(&self.shared);
        let supervisor = tokio::spawn(async move {
            let end = supervise(supervised).await;
            release_after_exit(&shared, &session_id, end).await;
            end
        });

        Ok(ActiveSession {
            info,
            cancel,
            supervisor: Some(supervisor),
        })
    }

    /// Terminate the running engine. Idempotent: when nothing is running this
    /// returns [`StopOutcome::NotRunning`]. A call that overlaps a stop already
    /// in progress waits for that one to release the engine.
    pub async fn stop(&self) -> StopOutcome {
        let (session_id, supervisor) = {
            let mut guard = self.shared.session.lock().await;
            match self.shared.state() {
                LifecycleState::Running => {}
                LifecycleState::Stopping => {
                    drop(guard);
                    return self.join_pending_stop().await;
                }
                _ => return StopOutcome::NotRunning,
            }
            let Some(active) = guard.as_mut() else {
                self.shared.set_state(LifecycleState::Idle);
                return StopOutcome::NotRunning;
            };
            self.shared.set_state(LifecycleState::Stopping);
            active.cancel.cancel();
            (active.info.id.clone(), active.supervisor.take())
        };

        let outcome = match supervisor {
            Some(mut handle) => match time::timeout(self.stop_budget(), &mut handle).await {
                Ok(Ok(SessionEnd::Terminated { exit, forced })) => {
                    StopOutcome::Stopped { exit, forced }
                }
                Ok(Ok(SessionEnd::Exited(status))) => StopOutcome::Stopped {
                    exit: Some(status),
                    forced: false,
                },
                Ok(Ok(SessionEnd::WaitFailed)) => StopOutcome::Stopped {
                    exit: None,
                    forced: false,
                },
                Ok(Err(err)) => {
                    warn!("supervisor for session {session_id} failed: {err}");
                    StopOutcome::Stopped {
                        exit: None,
                        forced: true,
                    }
                }
                Err(_) => {
                    warn!("supervisor for session {session_id} overran stop budget; aborting");
                    handle.abort();
                    StopOutcome::Stopped {
                        exit: None,
                        forced: true,
                    }
                }
            },
            None => StopOutcome::Stopped {
                exit: None,
                forced: false,
            },
        };

        let mut guard = self.shared.session.lock().await;
        if guard
            .as_ref()
            .is_some_and(|active| active.info.id == session_id)
        {
            *guard = None;
        }
        self.shared.set_state(LifecycleState::Idle);
        info!("engine session {session_id} stopped");

        outcome
    }

    fn stop_budget(&self) -> Duration {
        let config = &self.shared.config;
        config.stop_grace * 2 + config.drain_timeout + STOP_SLACK
    }

    async fn join_pending_stop(&self) -> StopOutcome {
        let mut state = self.subscribe_state();
        // The first stop gives up on the supervisor after its own budget, so
        // allow a little longer here.
        let budget = self.stop_budget() + STOP_SLACK;
        match time::timeout(budget, state.wait_for(|current| current.is_idle())).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => warn!("lifecycle channel closed while waiting for stop"),
            Err(_) => warn!("pending stop did not finish within {}ms", budget.as_millis()),
        }
        StopOutcome::Joined
    }

    /// Stop any running engine before the host exits.
    pub async fn shutdown(&self) {
        if let StopOutcome::Stopped { forced: true, .. } = self.stop().await {
            warn!("engine had to be killed during shutdown");
        }
    }
}

/// Runs on the supervisor task once the engine is gone. A `stop` in progress
/// owns the cleanup; otherwise the exit was unexpected and is reported.
async fn release_after_exit(shared: &Shared, session_id: &str, end: SessionEnd) {
    let mut guard = shared.session.lock().await;

    let is_current = guard
        .as_ref()
        .is_some_and(|active| active.info.id == session_id);
    if !is_current || shared.state() != LifecycleState::Running {
        return;
    }

    *guard = None;
    shared
        .bus
        .publish_log(LogLine::new(LogSource::Bridge, end.describe()));
    shared.set_state(LifecycleState::Idle);
}
