pub mod commands;
pub mod controller;
pub mod events;
pub mod state;
mod stream_worker;

pub use controller::ProcessController;
pub use events::{BridgeEvent, BridgeSubscription, EventBus};
pub use state::{LifecycleState, SessionInfo, StopOutcome};
