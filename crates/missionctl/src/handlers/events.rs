//! WebSocket stream of agent record changes: polls the store on a fixed
//! interval and pushes every row whose update or heartbeat timestamp
//! passed the watermark.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};

use crate::app::AppState;
use crate::db_ops;
use crate::services::lifecycle;
use missionctl_models::AgentEventsQuery;

const POLL_INTERVAL_SECONDS: u64 = 2;

pub async fn agent_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<AgentEventsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_agent_events(socket, state, query))
}

async fn stream_agent_events(mut socket: WebSocket, state: AppState, query: AgentEventsQuery) {
    let mut watermark = query.since.unwrap_or_else(db_ops::now);
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(POLL_INTERVAL_SECONDS));

    loop {
        interval.tick().await;

        let next_watermark = db_ops::now();
        let changed = {
            let conn = state.db.lock().unwrap();
            db_ops::agents_updated_since(&conn, query.board_id.as_deref(), &watermark)
        };
        for agent in changed {
            let agent = lifecycle::with_computed_status(agent);
            let frame = serde_json::json!({"type": "agent", "agent": agent});
            if socket
                .send(Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
        watermark = next_watermark;

        // Drain client frames so pings and closes are honored.
        while let Ok(result) =
            tokio::time::timeout(tokio::time::Duration::from_millis(1), socket.recv()).await
        {
            match result {
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            }
        }
    }
}
