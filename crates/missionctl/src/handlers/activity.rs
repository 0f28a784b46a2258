use axum::{
    extract::{Query, State},
    Json,
};

use crate::app::AppState;
use crate::db_ops;
use crate::handlers::{require_authenticated, ApiResult};
use missionctl_models::*;

const DEFAULT_LIMIT: usize = 200;

pub async fn list_activity(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<AgentEventsQuery>,
) -> ApiResult<Vec<ActivityEvent>> {
    require_authenticated(&identity)?;
    let conn = state.db.lock().unwrap();
    Ok(Json(db_ops::list_activity(
        &conn,
        query.since.as_deref(),
        query.board_id.as_deref(),
        DEFAULT_LIMIT,
    )))
}
