use axum::{
    extract::{Path, State},
    Json,
};

use crate::app::AppState;
use crate::handlers::ApiResult;
use crate::services::coordination;
use missionctl_models::*;

pub async fn nudge_agent(
    State(state): State<AppState>,
    identity: Identity,
    Path((board_id, agent_id)): Path<(String, String)>,
    Json(payload): Json<NudgeAgentRequest>,
) -> ApiResult<OkResponse> {
    let response =
        coordination::nudge_board_agent(&state, &identity, &board_id, &agent_id, &payload).await?;
    Ok(Json(response))
}

pub async fn get_soul(
    State(state): State<AppState>,
    identity: Identity,
    Path((board_id, agent_id)): Path<(String, String)>,
) -> ApiResult<AgentSoulResponse> {
    let response = coordination::get_agent_soul(&state, &identity, &board_id, &agent_id).await?;
    Ok(Json(response))
}

pub async fn put_soul(
    State(state): State<AppState>,
    identity: Identity,
    Path((board_id, agent_id)): Path<(String, String)>,
    Json(payload): Json<UpdateAgentSoulRequest>,
) -> ApiResult<OkResponse> {
    let response =
        coordination::update_agent_soul(&state, &identity, &board_id, &agent_id, &payload).await?;
    Ok(Json(response))
}

pub async fn ask_user(
    State(state): State<AppState>,
    identity: Identity,
    Path(board_id): Path<String>,
    Json(payload): Json<AskUserRequest>,
) -> ApiResult<AskUserResponse> {
    let response =
        coordination::ask_user_via_gateway_main(&state, &identity, &board_id, &payload).await?;
    Ok(Json(response))
}

pub async fn lead_message(
    State(state): State<AppState>,
    identity: Identity,
    Path(board_id): Path<String>,
    Json(payload): Json<LeadMessageRequest>,
) -> ApiResult<LeadMessageResponse> {
    let response =
        coordination::message_gateway_board_lead(&state, &identity, &board_id, &payload).await?;
    Ok(Json(response))
}

pub async fn lead_broadcast(
    State(state): State<AppState>,
    identity: Identity,
    Json(payload): Json<LeadBroadcastRequest>,
) -> ApiResult<LeadBroadcastResponse> {
    let response =
        coordination::broadcast_gateway_lead_message(&state, &identity, &payload).await?;
    Ok(Json(response))
}
