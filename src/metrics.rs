//! Health and metrics surface (`/health`, `/health/{ready,live,metrics}`,
//! `/metrics`, `/health/debug/instances`): a small sampler reading `/proc`
//! plus a handful of `Serialize` snapshot types, sourced from the Instance
//! Supervisor's in-memory state.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::supervisor::{InstanceInfo, InstanceState};
use crate::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct ViteCounts {
    pub running: usize,
    pub starting: usize,
    pub error: usize,
    pub total: usize,
}

impl ViteCounts {
    fn from_instances(instances: &[InstanceInfo]) -> Self {
        let running = instances.iter().filter(|i| i.state == InstanceState::Running).count();
        let starting = instances
            .iter()
            .filter(|i| i.state == InstanceState::Starting)
            .count();
        // Crashed/failed instances are removed from the map on the spot, so
        // there is never an observable "error" state to count here — the
        // field is kept for parity with the rest of the counts shape.
        Self {
            running,
            starting,
            error: 0,
            total: instances.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    pub rss_bytes: u64,
}

/// Reads this process's resident set size from `/proc/self/status`. Returns
/// `None` off Linux or if the file is unreadable.
fn sample_memory() -> Option<MemoryInfo> {
    let contents = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(MemoryInfo { rss_bytes: kb * 1024 });
        }
    }
    None
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub vite: ViteCounts,
    pub instances: Vec<InstanceInfo>,
    pub uptime_secs: u64,
    pub memory: Option<MemoryInfo>,
    pub timestamp: String,
}

/// Process start time, stashed in `AppState` and read here to compute uptime.
#[derive(Debug, Clone, Copy)]
pub struct StartedAt(pub Instant);

impl StartedAt {
    pub fn now() -> Self {
        Self(Instant::now())
    }
}

async fn collect_snapshot(state: &AppState) -> MetricsSnapshot {
    let instances = state.supervisor.get_all().await;
    let vite = ViteCounts::from_instances(&instances);
    MetricsSnapshot {
        vite,
        instances,
        uptime_secs: state.started_at.0.elapsed().as_secs(),
        memory: sample_memory(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthStatus {
    status: &'static str,
    timestamp: String,
}

fn health_ok() -> Response {
    Json(HealthStatus {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
    .into_response()
}

/// `GET /health`, `/health/live` — the process is up.
pub async fn health_handler() -> Response {
    health_ok()
}

pub async fn live_handler() -> Response {
    health_ok()
}

/// `GET /health/ready` — same liveness signal; this orchestrator has no
/// external dependency (database, queue) to probe before declaring ready.
pub async fn ready_handler() -> Response {
    health_ok()
}

/// `GET /health/metrics`, `/metrics`.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(collect_snapshot(&state).await).into_response()
}

/// `GET /health/debug/instances` — the raw instance list, for operators.
pub async fn debug_instances_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.supervisor.get_all().await).into_response()
}
