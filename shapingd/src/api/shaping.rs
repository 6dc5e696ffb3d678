use super::{ok, ApiError, ApiResult};
use crate::shaping::aggregator::{GcStats, WindowRate};
use crate::shaping::engine::{EngineStats, ShapingEngine};
use crate::shaping::nodes::{
    NodeDirectory, NodeEntry, StaticNodeDirectory, IO_LIMITS_CONFIG_KEY, STATUS_OFFLINE, STATUS_ONLINE,
};
use crate::shaping::policy::{PolicyTable, PolicyTarget};
use crate::shaping::queue::QueueStats;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use shapingd_common::{DelayConfig, TrafficShapingPolicy};
use std::sync::Arc;

/// Shared state of the shaping handlers.
#[derive(Clone)]
pub struct ShapingApiState {
    pub engine: Arc<ShapingEngine>,
    pub nodes: Arc<StaticNodeDirectory>,
}

/// 单个流的速率统计，用于 API 响应
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamStatsInfo {
    pub app: String,
    pub uid: u32,
    pub gid: u32,
    pub ema: Vec<WindowRate>,
    pub sma: Vec<WindowRate>,
    pub active_stream_count: u64,
    pub last_activity_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamStatsResponse {
    pub streams: Vec<StreamStatsInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub target: String,
    pub policy: TrafficShapingPolicy,
}

#[derive(Debug, Deserialize)]
pub struct GcQuery {
    pub max_idle_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SetNodeStatusRequest {
    pub name: String,
    pub status: String,
}

pub fn router(state: ShapingApiState) -> Router {
    Router::new()
        .route("/api/shaping/report", post(submit_report))
        .route("/api/shaping/stats", get(get_stats))
        .route("/api/shaping/policies", get(get_policies))
        .route(
            "/api/shaping/policy/:kind/:key",
            get(get_policy).post(set_policy).delete(remove_policy),
        )
        .route("/api/shaping/gc", post(garbage_collect))
        .route("/api/shaping/delays", get(get_delays))
        .route("/api/shaping/engine", get(get_engine))
        .route("/api/shaping/nodes", get(get_nodes).post(set_node_status))
        .route("/api/shaping/nodes/:name", delete(remove_node))
        .route("/api/shaping/nodes/:name/config", get(get_node_config))
        .with_state(state)
}

pub async fn submit_report(State(state): State<ShapingApiState>, body: Bytes) -> ApiResult<QueueStats> {
    state
        .engine
        .process_serialized_report(&body)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    ok(state.engine.stats().queue)
}

pub async fn get_stats(State(state): State<ShapingApiState>) -> ApiResult<StreamStatsResponse> {
    let mut streams: Vec<StreamStatsInfo> = state
        .engine
        .global_stats()
        .into_iter()
        .map(|(key, snap)| StreamStatsInfo {
            app: key.app,
            uid: key.uid,
            gid: key.gid,
            ema: snap.ema,
            sma: snap.sma,
            active_stream_count: snap.active_stream_count,
            last_activity_ms: snap.last_activity_ms,
        })
        .collect();
    streams.sort_by(|a, b| (&a.app, a.uid, a.gid).cmp(&(&b.app, b.uid, b.gid)));

    ok(StreamStatsResponse { streams })
}

pub async fn get_policies(State(state): State<ShapingApiState>) -> ApiResult<PolicyTable> {
    let engine = &state.engine;
    ok(PolicyTable {
        uid: engine.uid_policies().into_iter().collect(),
        gid: engine.gid_policies().into_iter().collect(),
        app: engine.app_policies().into_iter().collect(),
    })
}

fn lookup_policy(engine: &ShapingEngine, target: &PolicyTarget) -> Option<TrafficShapingPolicy> {
    match target {
        PolicyTarget::Uid(uid) => engine.uid_policy(*uid),
        PolicyTarget::Gid(gid) => engine.gid_policy(*gid),
        PolicyTarget::App(app) => engine.app_policy(app),
    }
}

pub async fn get_policy(
    State(state): State<ShapingApiState>,
    Path((kind, key)): Path<(String, String)>,
) -> ApiResult<PolicyInfo> {
    let target = PolicyTarget::parse(&kind, &key)?;
    let policy = lookup_policy(&state.engine, &target)
        .ok_or_else(|| ApiError::not_found(format!("No policy for {}", target)))?;

    ok(PolicyInfo {
        target: target.to_string(),
        policy,
    })
}

pub async fn set_policy(
    State(state): State<ShapingApiState>,
    Path((kind, key)): Path<(String, String)>,
    Json(policy): Json<TrafficShapingPolicy>,
) -> ApiResult<PolicyInfo> {
    let target = PolicyTarget::parse(&kind, &key)?;
    match &target {
        PolicyTarget::Uid(uid) => state.engine.set_uid_policy(*uid, policy),
        PolicyTarget::Gid(gid) => state.engine.set_gid_policy(*gid, policy),
        PolicyTarget::App(app) => state.engine.set_app_policy(app, policy),
    }

    ok(PolicyInfo {
        target: target.to_string(),
        policy,
    })
}

pub async fn remove_policy(
    State(state): State<ShapingApiState>,
    Path((kind, key)): Path<(String, String)>,
) -> ApiResult<PolicyInfo> {
    let target = PolicyTarget::parse(&kind, &key)?;
    let removed = match &target {
        PolicyTarget::Uid(uid) => state.engine.remove_uid_policy(*uid),
        PolicyTarget::Gid(gid) => state.engine.remove_gid_policy(*gid),
        PolicyTarget::App(app) => state.engine.remove_app_policy(app),
    };
    let policy = removed.ok_or_else(|| ApiError::not_found(format!("No policy for {}", target)))?;

    ok(PolicyInfo {
        target: target.to_string(),
        policy,
    })
}

pub async fn garbage_collect(
    State(state): State<ShapingApiState>,
    Query(query): Query<GcQuery>,
) -> ApiResult<GcStats> {
    let max_idle = query
        .max_idle_seconds
        .unwrap_or(state.engine.config().max_idle_secs);
    ok(state.engine.garbage_collect(max_idle))
}

pub async fn get_delays(State(state): State<ShapingApiState>) -> ApiResult<DelayConfig> {
    ok(state.engine.last_delays())
}

pub async fn get_engine(State(state): State<ShapingApiState>) -> ApiResult<EngineStats> {
    ok(state.engine.stats())
}

pub async fn get_nodes(State(state): State<ShapingApiState>) -> ApiResult<Vec<NodeEntry>> {
    ok(state.nodes.nodes())
}

pub async fn set_node_status(
    State(state): State<ShapingApiState>,
    Json(request): Json<SetNodeStatusRequest>,
) -> ApiResult<Vec<NodeEntry>> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("Node name cannot be empty"));
    }
    let status = request.status.trim();
    if status != STATUS_ONLINE && status != STATUS_OFFLINE {
        return Err(ApiError::bad_request(format!(
            "Node status must be '{}' or '{}', got '{}'",
            STATUS_ONLINE, STATUS_OFFLINE, status
        )));
    }

    state.nodes.set_status(request.name.trim(), status);
    ok(state.nodes.nodes())
}

pub async fn remove_node(
    State(state): State<ShapingApiState>,
    Path(name): Path<String>,
) -> ApiResult<Vec<NodeEntry>> {
    if !state.nodes.remove(&name) {
        return Err(ApiError::not_found(format!("Unknown node '{}'", name)));
    }
    log::info!("Node {} removed", name);
    ok(state.nodes.nodes())
}

pub async fn get_node_config(
    State(state): State<ShapingApiState>,
    Path(name): Path<String>,
) -> ApiResult<DelayConfig> {
    let blob = state
        .nodes
        .config(&name, IO_LIMITS_CONFIG_KEY)
        .ok_or_else(|| ApiError::not_found(format!("No delay configuration pushed to {}", name)))?;
    let config = serde_json::from_slice::<DelayConfig>(&blob)
        .map_err(|e| anyhow::anyhow!("Stored configuration for {} is invalid: {}", name, e))?;
    ok(config)
}
