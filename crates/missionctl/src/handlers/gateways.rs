use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::app::AppState;
use crate::error::bad_gateway;
use crate::gateway::compat::{check_gateway_version, MINIMUM_GATEWAY_VERSION};
use crate::handlers::{require_authenticated, require_user, ApiResult};
use crate::services::{admin, session, template_sync};
use missionctl_models::*;

pub async fn status(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<GatewayResolveQuery>,
) -> ApiResult<GatewayStatusResponse> {
    require_authenticated(&identity)?;
    let target = session::resolve_target(&state, &query)?;
    Ok(Json(session::get_status(&state, &target).await))
}

pub async fn version(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<GatewayResolveQuery>,
) -> ApiResult<GatewayVersionCheck> {
    require_authenticated(&identity)?;
    let target = session::resolve_target(&state, &query)?;
    let check = check_gateway_version(state.gateway.as_ref(), &target, MINIMUM_GATEWAY_VERSION)
        .await
        .map_err(|err| bad_gateway("version check", &err))?;
    Ok(Json(check))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<GatewayResolveQuery>,
) -> ApiResult<GatewaySessionsResponse> {
    require_authenticated(&identity)?;
    let target = session::resolve_target(&state, &query)?;
    let response = session::list_sessions(&state, &target).await?;
    Ok(Json(response))
}

pub async fn get_session(
    State(state): State<AppState>,
    identity: Identity,
    Path(key): Path<String>,
    Query(query): Query<GatewayResolveQuery>,
) -> ApiResult<GatewaySessionResponse> {
    require_authenticated(&identity)?;
    let target = session::resolve_target(&state, &query)?;
    let response = session::get_session(&state, &target, &key).await?;
    Ok(Json(response))
}

pub async fn session_history(
    State(state): State<AppState>,
    identity: Identity,
    Path(key): Path<String>,
    Query(query): Query<GatewayResolveQuery>,
) -> ApiResult<GatewaySessionHistoryResponse> {
    require_authenticated(&identity)?;
    let target = session::resolve_target(&state, &query)?;
    let response = session::session_history(&state, &target, &key).await?;
    Ok(Json(response))
}

pub async fn send_session_message(
    State(state): State<AppState>,
    identity: Identity,
    Path(key): Path<String>,
    Query(query): Query<GatewayResolveQuery>,
    Json(payload): Json<GatewaySessionMessageRequest>,
) -> ApiResult<OkResponse> {
    require_user(&identity)?;
    let target = session::resolve_target(&state, &query)?;
    let response = session::send_session_message(&state, &target, &key, &payload.content).await?;
    Ok(Json(response))
}

pub async fn ensure_main_agent(
    State(state): State<AppState>,
    identity: Identity,
    Path(gateway_id): Path<String>,
) -> ApiResult<Agent> {
    require_user(&identity)?;
    let agent = admin::ensure_main_agent(&state, &gateway_id).await?;
    Ok(Json(agent))
}

pub async fn sync_templates(
    State(state): State<AppState>,
    identity: Identity,
    Path(gateway_id): Path<String>,
    Query(options): Query<TemplateSyncQuery>,
) -> ApiResult<TemplatesSyncResult> {
    require_user(&identity)?;
    let result = template_sync::sync_templates(&state, Some(&gateway_id), &options).await?;
    Ok(Json(result))
}
