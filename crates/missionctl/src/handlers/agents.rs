use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::app::AppState;
use crate::db_ops;
use crate::error::{api_error, ApiError};
use crate::handlers::{require_authenticated, require_user, ApiResult};
use crate::services::{admin, lifecycle};
use missionctl_models::*;

pub async fn list_agents(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<AgentQuery>,
) -> ApiResult<Vec<Agent>> {
    require_authenticated(&identity)?;
    // Agents only see their own board.
    let query = match identity.agent() {
        Some(agent) if agent.board_id.is_some() => AgentQuery {
            board_id: agent.board_id.clone(),
            gateway_id: None,
        },
        _ => query,
    };
    let conn = state.db.lock().unwrap();
    let agents = db_ops::list_agents(&conn, &query)
        .into_iter()
        .map(lifecycle::with_computed_status)
        .collect();
    Ok(Json(agents))
}

pub async fn get_agent(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ApiResult<Agent> {
    require_authenticated(&identity)?;
    let conn = state.db.lock().unwrap();
    db_ops::get_agent(&conn, &id)
        .map(lifecycle::with_computed_status)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Agent not found"))
}

pub async fn create_agent(
    State(state): State<AppState>,
    identity: Identity,
    Json(mut input): Json<CreateAgent>,
) -> Result<(StatusCode, Json<AgentCreated>), ApiError> {
    // Board leads may create teammates, but only on their own board; an
    // omitted board_id defaults to the lead's own.
    match &identity {
        Identity::User { .. } => {}
        Identity::AgentIdentity { agent } if agent.is_board_lead => match &input.board_id {
            None => input.board_id = agent.board_id.clone(),
            Some(board_id) if agent.board_id.as_deref() == Some(board_id.as_str()) => {}
            Some(_) => {
                return Err(api_error(
                    StatusCode::FORBIDDEN,
                    "Leads may only create agents on their own board",
                ));
            }
        },
        _ => {
            require_user(&identity)?;
        }
    }
    let (agent, token) = admin::create_agent(&state, &input).await?;
    Ok((StatusCode::CREATED, Json(AgentCreated { agent, token })))
}

pub async fn update_agent(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    Query(query): Query<UpdateAgentQuery>,
    Json(input): Json<UpdateAgent>,
) -> ApiResult<Agent> {
    require_user(&identity)?;
    let agent = admin::update_agent(&state, &id, &input, query.force).await?;
    Ok(Json(lifecycle::with_computed_status(agent)))
}

pub async fn delete_agent(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ApiResult<OkResponse> {
    require_user(&identity)?;
    let response = admin::delete_agent(&state, &id).await?;
    Ok(Json(response))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    payload: Option<Json<HeartbeatRequest>>,
) -> ApiResult<Agent> {
    require_authenticated(&identity)?;
    // Agents beat for themselves; the operator may beat for anyone.
    if let Some(actor) = identity.agent() {
        if actor.id != id {
            return Err(api_error(
                StatusCode::FORBIDDEN,
                "Agents may only report their own heartbeat",
            ));
        }
    }
    let status = payload.as_ref().and_then(|p| p.status.clone());
    let conn = state.db.lock().unwrap();
    lifecycle::commit_heartbeat(&conn, &id, status.as_deref())
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Agent not found"))
}

pub async fn heartbeat_or_create(
    State(state): State<AppState>,
    identity: Identity,
    Json(payload): Json<HeartbeatOrCreate>,
) -> ApiResult<Agent> {
    require_authenticated(&identity)?;
    let agent = admin::heartbeat_or_create(&state, &identity, &payload).await?;
    Ok(Json(agent))
}
