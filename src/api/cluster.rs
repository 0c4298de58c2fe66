use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;
use tracing::instrument;

use crate::cluster::{ClusterCoordinator, CoordinatorState, EventCounts};
use crate::provider::Member;
use crate::settings::NodeId;

/// Snapshot of this node's view of the cluster
#[derive(Debug, Serialize)]
pub struct ClusterStatusResponse {
    pub node_id: NodeId,
    pub name: String,
    pub state: CoordinatorState,
    pub local_address: SocketAddr,
    pub health_score: u32,
    pub health_score_threshold: u32,
    pub members: Vec<Member>,
    pub events: EventCounts,
}

#[instrument(skip(coordinator))]
pub async fn status(
    State(coordinator): State<Arc<ClusterCoordinator>>,
) -> Json<ClusterStatusResponse> {
    Json(ClusterStatusResponse {
        node_id: coordinator.node_id(),
        name: coordinator.name().to_string(),
        state: coordinator.state(),
        local_address: coordinator.local_address(),
        health_score: coordinator.health_score(),
        health_score_threshold: coordinator.config().health_score_threshold,
        members: coordinator.members(),
        events: coordinator.event_counts(),
    })
}
