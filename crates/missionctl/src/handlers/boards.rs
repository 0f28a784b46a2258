use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::app::AppState;
use crate::db_ops;
use crate::error::{api_error, ApiError};
use crate::handlers::{require_authenticated, require_user, ApiResult};
use missionctl_models::*;

pub async fn list_boards(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Vec<Board>> {
    require_authenticated(&identity)?;
    let conn = state.db.lock().unwrap();
    Ok(Json(db_ops::list_boards(&conn)))
}

pub async fn get_board(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ApiResult<Board> {
    require_authenticated(&identity)?;
    let conn = state.db.lock().unwrap();
    db_ops::get_board(&conn, &id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Board not found"))
}

pub async fn create_board(
    State(state): State<AppState>,
    identity: Identity,
    Json(input): Json<CreateBoard>,
) -> Result<(StatusCode, Json<Board>), ApiError> {
    require_user(&identity)?;
    if input.name.trim().is_empty() {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "name is required"));
    }
    let conn = state.db.lock().unwrap();
    let gateway_id = match input.gateway_id.clone() {
        Some(id) => {
            db_ops::get_gateway(&conn, &id)
                .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Gateway not found"))?;
            Some(id)
        }
        None => db_ops::default_gateway(&conn).map(|g| g.id),
    };
    let board = db_ops::create_board(
        &conn,
        &state.organization_id,
        gateway_id.as_deref(),
        input.name.trim(),
    );
    Ok((StatusCode::CREATED, Json(board)))
}
