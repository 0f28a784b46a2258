use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tower_http::cors::{Any, CorsLayer};

use crate::db;
use crate::db_ops;
use crate::gateway::{client::HttpGatewayClient, GatewayRpc};
use crate::handlers;
use crate::services::{admin, provisioning};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub admin_token: String,
    pub organization_id: String,
    /// Public base URL embedded in outbound coordination messages.
    pub base_url: String,
    pub gateway: Arc<dyn GatewayRpc>,
}

pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    pub admin_token: String,
    pub base_url: String,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub workspace_root: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        // Agents
        .route(
            "/api/agents",
            get(handlers::agents::list_agents).post(handlers::agents::create_agent),
        )
        .route(
            "/api/agents/heartbeat",
            post(handlers::agents::heartbeat_or_create),
        )
        .route("/api/agents/events", get(handlers::events::agent_events))
        .route(
            "/api/agents/:id",
            get(handlers::agents::get_agent)
                .patch(handlers::agents::update_agent)
                .delete(handlers::agents::delete_agent),
        )
        .route(
            "/api/agents/:id/heartbeat",
            post(handlers::agents::heartbeat),
        )
        // Boards
        .route(
            "/api/boards",
            get(handlers::boards::list_boards).post(handlers::boards::create_board),
        )
        .route("/api/boards/:id", get(handlers::boards::get_board))
        // Board-scoped coordination
        .route(
            "/api/boards/:id/agents/:agent_id/nudge",
            post(handlers::coordination::nudge_agent),
        )
        .route(
            "/api/boards/:id/agents/:agent_id/soul",
            get(handlers::coordination::get_soul).put(handlers::coordination::put_soul),
        )
        .route(
            "/api/boards/:id/ask-user",
            post(handlers::coordination::ask_user),
        )
        // Gateway-main coordination
        .route(
            "/api/coordination/boards/:id/lead-message",
            post(handlers::coordination::lead_message),
        )
        .route(
            "/api/coordination/lead-broadcast",
            post(handlers::coordination::lead_broadcast),
        )
        // Gateway sessions and maintenance
        .route("/api/gateways/status", get(handlers::gateways::status))
        .route("/api/gateways/version", get(handlers::gateways::version))
        .route(
            "/api/gateways/sessions",
            get(handlers::gateways::list_sessions),
        )
        .route(
            "/api/gateways/sessions/:key",
            get(handlers::gateways::get_session),
        )
        .route(
            "/api/gateways/sessions/:key/history",
            get(handlers::gateways::session_history),
        )
        .route(
            "/api/gateways/sessions/:key/message",
            post(handlers::gateways::send_session_message),
        )
        .route(
            "/api/gateways/:id/main-agent",
            post(handlers::gateways::ensure_main_agent),
        )
        .route(
            "/api/gateways/:id/templates/sync",
            post(handlers::gateways::sync_templates),
        )
        // Activity
        .route("/api/activity", get(handlers::activity::list_activity));

    api.fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
        .layer(cors)
        .with_state(state)
}

/// How many increasing-sleep attempts the startup gateway-main pass gets
/// before the server gives up.
const STARTUP_ENSURE_ATTEMPTS: u32 = 5;

pub async fn run_server(config: ServerConfig) {
    let conn = db::init_db(&config.db_path);
    let organization_id = db_ops::ensure_default_org(&conn, "default").id;
    db_ops::ensure_gateway(
        &conn,
        &organization_id,
        "default",
        config.gateway_url.as_deref(),
        config.gateway_token.as_deref(),
        config.workspace_root.as_deref(),
    );

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        admin_token: config.admin_token.clone(),
        organization_id,
        base_url: config.base_url.clone(),
        gateway: Arc::new(HttpGatewayClient::new()),
    };

    // Startup pass: make sure every gateway has a healthy main agent before
    // serving traffic-dependent reconciliation. Bounded increasing-sleep
    // retries; a gateway that never comes up is fatal.
    let startup_state = state.clone();
    tokio::spawn(async move {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let repaired = admin::ensure_gateway_agents_exist(&startup_state).await;
            let healthy = {
                let conn = startup_state.db.lock().unwrap();
                db_ops::list_gateways(&conn)
                    .iter()
                    .all(|gw| db_ops::gateway_main_agent(&conn, &gw.id).is_some())
            };
            if healthy {
                tracing::info!(repaired, "gateway main agents verified");
                break;
            }
            if attempt >= STARTUP_ENSURE_ATTEMPTS {
                tracing::error!("gateway main agents unavailable after startup retries");
                std::process::exit(1);
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(5 * u64::from(attempt))).await;
        }

        // Steady state: retry stuck provisions, drain parked messages, and
        // re-verify the main agents on a fixed interval.
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let retried = provisioning::reconcile_pending(&startup_state).await;
            if retried > 0 {
                tracing::info!(retried, "reconciled pending provisions");
            }
            let delivered = provisioning::drain_queued_messages(&startup_state).await;
            if delivered > 0 {
                tracing::info!(delivered, "drained queued gateway messages");
            }
            admin::ensure_gateway_agents_exist(&startup_state).await;
        }
    });

    // Graceful shutdown: checkpoint WAL on SIGTERM/SIGINT
    let shutdown_db = state.db.clone();
    let shutdown_signal = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
        let conn = shutdown_db.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .unwrap_or_else(|e| tracing::warn!(error = %e, "WAL checkpoint failed"));
        tracing::info!("WAL checkpointed, shutting down");
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("Failed to bind port");

    tracing::info!("Mission Control listening on http://0.0.0.0:{}", config.port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .expect("Server error");
}
