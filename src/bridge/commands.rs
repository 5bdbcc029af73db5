//! Command surface for the presentation layer. Errors cross this boundary as
//! display strings.

use serde::Serialize;

use crate::{
    bridge::{LifecycleState, ProcessController, SessionInfo, StopOutcome},
    client::{ClientSnapshot, StatusSummary, WindowSummary},
    AppState,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub state: LifecycleState,
    pub session: Option<SessionInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub status: StatusSummary,
    pub window: WindowSummary,
    pub snapshot: ClientSnapshot,
}

fn controller_from_state(state: &AppState) -> ProcessController {
    state.bridge.clone()
}

pub async fn start_engine(
    state: &AppState,
    command: String,
    args: Vec<String>,
) -> Result<SessionInfo, String> {
    let controller = controller_from_state(state);
    controller
        .start(&command, &args)
        .await
        .map_err(|e| e.to_string())
}

pub async fn stop_engine(state: &AppState) -> Result<bool, String> {
    let controller = controller_from_state(state);
    match controller.stop().await {
        StopOutcome::NotRunning => Ok(false),
        StopOutcome::Stopped { .. } | StopOutcome::Joined => Ok(true),
    }
}

pub async fn get_bridge_status(state: &AppState) -> Result<BridgeStatus, String> {
    let controller = controller_from_state(state);
    Ok(BridgeStatus {
        state: controller.state(),
        session: controller.session().await,
    })
}

pub async fn get_dashboard(state: &AppState) -> Result<DashboardView, String> {
    let client = &state.client;
    Ok(DashboardView {
        status: client.status().await,
        window: client.window_summary().await,
        snapshot: client.snapshot().await,
    })
}
