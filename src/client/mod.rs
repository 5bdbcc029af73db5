mod state;
mod types;

pub use state::ClientState;
pub use types::{ClientSnapshot, StatusSummary, WindowSummary};

use std::sync::Arc;

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeEvent, BridgeSubscription};

/// Shared handle to a [`ClientState`] fed from a bridge subscription.
pub struct ClientStore {
    inner: Arc<Mutex<ClientState>>,
}

impl ClientStore {
    pub fn new(history_capacity: usize, log_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClientState::new(history_capacity, log_capacity))),
        }
    }

    /// Consume `subscription` on its own task until the bus closes or
    /// `cancel` fires. Anything already queued is applied before exiting.
    pub fn follow(
        &self,
        mut subscription: BridgeSubscription,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = subscription.recv() => match event {
                        Some(event) => {
                            if let BridgeEvent::Lagged(missed) = event {
                                log::warn!("client store fell behind; {missed} events dropped");
                            }
                            inner.lock().await.apply(event);
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        let mut state = inner.lock().await;
                        while let Some(event) = subscription.try_recv() {
                            state.apply(event);
                        }
                        break;
                    }
                }
            }
        })
    }

    pub async fn snapshot(&self) -> ClientSnapshot {
        self.inner.lock().await.snapshot()
    }

    pub async fn status(&self) -> StatusSummary {
        self.inner.lock().await.status()
    }

    pub async fn window_summary(&self) -> WindowSummary {
        self.inner.lock().await.window_summary()
    }
}

impl Clone for ClientStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
