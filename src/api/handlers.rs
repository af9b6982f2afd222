use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::convert::Conversion;
use crate::error::Error;
use crate::forwarding::{RuleMutation, RuleSet, RuleSync};
use crate::orchestrator::{CreateInstanceRequest, SwitchOutcome, SwitchRequest, TemplateDraft};
use crate::registry::{CreatedHost, HostDraft, HostUpdate};
use crate::storage::{Page, RuleLogQuery, SwitchLogQuery};
use crate::types::{
    AgentHost, ConfigTemplate, CoreInstance, ForwardingRule, HostId, HostMetrics, RuleDraft,
    RuleId, RuleLog, SwitchLog, SwitchStatus,
};

type ApiResult<T> = Result<Json<T>, ApiError>;

/// One page of a log listing plus the unpaginated count.
#[derive(Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub version: u64,
}

#[derive(Deserialize)]
pub struct RuleLogParams {
    pub rule_id: Option<RuleId>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Deserialize)]
pub struct SwitchLogParams {
    pub status: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Deserialize)]
pub struct ConvertRequest {
    pub source_core: String,
    pub target_core: String,
    pub config: Value,
}

#[derive(Deserialize)]
pub struct AgentParams {
    #[serde(default)]
    pub token: String,
    pub version: Option<u64>,
}

#[derive(Serialize)]
pub struct AgentAck {
    pub host_id: HostId,
    pub status: &'static str,
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// Hosts

pub async fn create_host(
    State(state): State<AppState>,
    Json(draft): Json<HostDraft>,
) -> Result<(StatusCode, Json<CreatedHost>), ApiError> {
    let created = state.registry.create(draft).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_hosts(State(state): State<AppState>) -> ApiResult<Vec<AgentHost>> {
    Ok(Json(state.registry.list().await?))
}

pub async fn get_host(State(state): State<AppState>, Path(id): Path<HostId>) -> ApiResult<AgentHost> {
    Ok(Json(state.registry.get(id).await?))
}

pub async fn update_host(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
    Json(update): Json<HostUpdate>,
) -> ApiResult<AgentHost> {
    Ok(Json(state.registry.update(id, update).await?))
}

pub async fn delete_host(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
) -> Result<StatusCode, ApiError> {
    state.registry.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Forwarding rules

pub async fn list_rules(State(state): State<AppState>, Path(id): Path<HostId>) -> ApiResult<RuleSet> {
    Ok(Json(state.rules.list_by_agent(id).await?))
}

pub async fn rule_version(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
) -> ApiResult<VersionResponse> {
    let version = state.rules.version_for_agent(id).await?;
    Ok(Json(VersionResponse { version }))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
    Json(draft): Json<RuleDraft>,
) -> Result<(StatusCode, Json<RuleMutation>), ApiError> {
    let mutation = state.rules.create(id, draft).await?;
    Ok((StatusCode::CREATED, Json(mutation)))
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(HostId, RuleId)>,
) -> ApiResult<ForwardingRule> {
    Ok(Json(state.rules.get(id, rule_id).await?))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(HostId, RuleId)>,
    Json(draft): Json<RuleDraft>,
) -> ApiResult<RuleMutation> {
    Ok(Json(state.rules.update(id, rule_id, draft).await?))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(HostId, RuleId)>,
) -> ApiResult<VersionResponse> {
    let version = state.rules.delete(id, rule_id).await?;
    Ok(Json(VersionResponse { version }))
}

pub async fn rule_logs(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
    Query(params): Query<RuleLogParams>,
) -> ApiResult<Paged<RuleLog>> {
    let query = RuleLogQuery {
        rule_id: params.rule_id,
        start_at: params.start_at,
        end_at: params.end_at,
        page: Page::new(params.limit, params.offset),
    };
    let (items, total) = state.rules.logs(id, &query).await?;
    Ok(Json(Paged { items, total }))
}

// Core instances and switching

pub async fn list_instances(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
) -> ApiResult<Vec<CoreInstance>> {
    Ok(Json(state.orchestrator.list_instances(id).await?))
}

pub async fn create_instance(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<CoreInstance>), ApiError> {
    let instance = state.orchestrator.create_instance(id, request).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path((id, instance_id)): Path<(HostId, String)>,
) -> ApiResult<CoreInstance> {
    Ok(Json(state.orchestrator.get_instance(id, &instance_id).await?))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path((id, instance_id)): Path<(HostId, String)>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete_instance(id, &instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The switch runs on its own task. If the client goes away this handler is
/// dropped, which cancels the token and sends the switch down its rollback path.
pub async fn switch_core(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
    Json(request): Json<SwitchRequest>,
) -> ApiResult<SwitchOutcome> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let orchestrator = state.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.switch_core(id, request, cancel).await });

    match task.await {
        Ok(outcome) => Ok(Json(outcome?)),
        Err(e) => Err(Error::Internal(format!("switch task aborted: {}", e)).into()),
    }
}

pub async fn convert_config(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
    Json(request): Json<ConvertRequest>,
) -> ApiResult<Conversion> {
    state.registry.get(id).await?;
    let conversion =
        state
            .orchestrator
            .convert(&request.source_core, &request.target_core, &request.config)?;
    Ok(Json(conversion))
}

/// The in-progress switch, or `null` when the host is idle.
pub async fn active_switch(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
) -> ApiResult<Option<SwitchLog>> {
    Ok(Json(state.audit.active(id).await?))
}

pub async fn switch_logs(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
    Query(params): Query<SwitchLogParams>,
) -> ApiResult<Paged<SwitchLog>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<SwitchStatus>)
        .transpose()?;
    let query = SwitchLogQuery {
        status,
        start_at: params.start_at,
        end_at: params.end_at,
        page: Page::new(params.limit, params.offset),
    };
    let (items, total) = state.audit.list(id, &query).await?;
    Ok(Json(Paged { items, total }))
}

// Templates

pub async fn create_template(
    State(state): State<AppState>,
    Json(draft): Json<TemplateDraft>,
) -> Result<(StatusCode, Json<ConfigTemplate>), ApiError> {
    let template = state.orchestrator.create_template(draft).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn list_templates(State(state): State<AppState>) -> ApiResult<Vec<ConfigTemplate>> {
    Ok(Json(state.orchestrator.list_templates().await?))
}

// Agent-facing

pub async fn agent_heartbeat(
    State(state): State<AppState>,
    Query(params): Query<AgentParams>,
) -> ApiResult<AgentAck> {
    let host_id = state.registry.heartbeat(&params.token).await?;
    Ok(Json(AgentAck {
        host_id,
        status: "ok",
    }))
}

pub async fn agent_metrics(
    State(state): State<AppState>,
    Query(params): Query<AgentParams>,
    Json(metrics): Json<HostMetrics>,
) -> ApiResult<AgentAck> {
    let host_id = state.registry.report_metrics(&params.token, metrics).await?;
    Ok(Json(AgentAck {
        host_id,
        status: "ok",
    }))
}

pub async fn agent_forwarding(
    State(state): State<AppState>,
    Query(params): Query<AgentParams>,
) -> ApiResult<RuleSync> {
    let host = state.registry.authenticate(&params.token).await?;
    Ok(Json(state.rules.sync(host.id, params.version).await?))
}
