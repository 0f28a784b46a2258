use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

use missionctl::app::{build_router, AppState};
use missionctl::db;
use missionctl::db_ops;
use missionctl::gateway::{GatewayError, GatewayRpc, GatewayTarget};
use missionctl::tokens;

const ADMIN_TOKEN: &str = "test-admin-token";

/// Scriptable gateway double: records every RPC and answers from a small
/// canned playbook. Methods (optionally matched against their params) can
/// be told to fail with a transport error.
struct MockGateway {
    calls: Mutex<Vec<(String, Value)>>,
    version: Mutex<Option<String>>,
    fail_methods: Mutex<HashSet<String>>,
    fail_when_params_contain: Mutex<Vec<(String, String)>>,
}

impl MockGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            version: Mutex::new(Some("2026.2.1".to_string())),
            fail_methods: Mutex::new(HashSet::new()),
            fail_when_params_contain: Mutex::new(Vec::new()),
        })
    }

    fn set_version(&self, version: Option<&str>) {
        *self.version.lock().unwrap() = version.map(|s| s.to_string());
    }

    fn fail_method(&self, method: &str) {
        self.fail_methods.lock().unwrap().insert(method.to_string());
    }

    fn fail_when(&self, method: &str, params_needle: &str) {
        self.fail_when_params_contain
            .lock()
            .unwrap()
            .push((method.to_string(), params_needle.to_string()));
    }

    fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl GatewayRpc for MockGateway {
    async fn call(
        &self,
        _target: &GatewayTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, GatewayError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        if self.fail_methods.lock().unwrap().contains(method) {
            return Err(GatewayError::Transport("mock outage".to_string()));
        }
        let params_text = params.to_string();
        for (m, needle) in self.fail_when_params_contain.lock().unwrap().iter() {
            if m == method && params_text.contains(needle.as_str()) {
                return Err(GatewayError::Transport("mock outage".to_string()));
            }
        }

        Ok(match method {
            "config.schema" | "status" | "health" => match &*self.version.lock().unwrap() {
                Some(version) => json!({"gateway": {"version": version}}),
                None => json!({}),
            },
            "sessions.list" => json!({"sessions": []}),
            "agents.list" => json!({"agents": [{"id": "main", "sessionKey": "agent:main"}]}),
            _ => json!({"ok": true}),
        })
    }
}

/// A self-contained server: temp DB, seeded gateway + board, mock RPC,
/// random port.
struct TestServer {
    base_url: String,
    db: Arc<Mutex<rusqlite::Connection>>,
    gateway: Arc<MockGateway>,
    organization_id: String,
    gateway_id: String,
    board_id: String,
    _tmp: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(MockGateway::new()).await
    }

    async fn start_with(gateway: Arc<MockGateway>) -> Self {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let db_path = tmp.path().join("test.db");
        let conn = db::init_db(db_path.to_str().unwrap());

        let org = db_ops::ensure_default_org(&conn, "default");
        let gw = db_ops::ensure_gateway(
            &conn,
            &org.id,
            "default",
            Some("http://gateway.test"),
            Some("gw-secret"),
            Some("/srv/agents"),
        );
        let board = db_ops::create_board(&conn, &org.id, Some(&gw.id), "Alpha");

        let db = Arc::new(Mutex::new(conn));
        let state = AppState {
            db: db.clone(),
            admin_token: ADMIN_TOKEN.to_string(),
            organization_id: org.id.clone(),
            base_url: "http://localhost:8080".to_string(),
            gateway: gateway.clone(),
        };

        let router = build_router(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        TestServer {
            base_url: format!("http://{addr}"),
            db,
            gateway,
            organization_id: org.id,
            gateway_id: gw.id,
            board_id: board.id,
            _tmp: tmp,
        }
    }

    fn client(&self) -> Client {
        Client::new()
    }

    fn admin_auth(&self) -> String {
        format!("Bearer {ADMIN_TOKEN}")
    }

    async fn create_agent(&self, name: &str) -> Value {
        let resp = self
            .client()
            .post(format!("{}/api/agents", self.base_url))
            .header("Authorization", self.admin_auth())
            .json(&json!({"name": name, "board_id": self.board_id}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json::<Value>().await.unwrap()
    }

    /// Insert an agent row directly, bypassing the HTTP surface.
    fn seed_agent(
        &self,
        name: &str,
        board_id: Option<&str>,
        session_key: Option<&str>,
        is_board_lead: bool,
    ) -> (String, String) {
        let raw = tokens::generate_token();
        let conn = self.db.lock().unwrap();
        let ts = db_ops::now();
        let agent = missionctl::models::Agent {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: "online".to_string(),
            board_id: board_id.map(|s| s.to_string()),
            gateway_id: self.gateway_id.clone(),
            is_board_lead,
            session_key: session_key.map(|s| s.to_string()),
            token_hash: Some(tokens::hash_token(&raw)),
            heartbeat_config: None,
            identity_profile: None,
            soul_template: None,
            provision_requested_at: None,
            provision_action: None,
            last_seen_at: Some(ts.clone()),
            created_at: ts.clone(),
            updated_at: ts,
            is_gateway_main: board_id.is_none(),
        };
        db_ops::insert_agent(&conn, &agent);
        (agent.id, raw)
    }
}

#[tokio::test]
async fn create_agent_returns_token_once_and_provisions_remotely() {
    let server = TestServer::start().await;
    let created = server.create_agent("Scout").await;

    let token = created["token"].as_str().unwrap();
    assert!(token.starts_with("mct_"));
    let agent = &created["agent"];
    assert_eq!(agent["name"], "Scout");
    assert_eq!(agent["session_key"], "agent:scout:main");
    // The hash never leaves the server and the raw token is shown only once.
    assert!(agent.get("token_hash").is_none());

    let pushes = server.gateway.calls_to("agents.create");
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0]["authToken"].as_str().unwrap(), token);
    assert_eq!(pushes[0]["workspace"], "/srv/agents/workspace-scout");
    assert!(!server.gateway.calls_to("sessions.send").is_empty());

    // A fresh agent has never heartbeated, so it reads as provisioning
    // until the first beat.
    let fetched: Value = server
        .client()
        .get(format!(
            "{}/api/agents/{}",
            server.base_url,
            agent["id"].as_str().unwrap()
        ))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["status"], "provisioning");
}

#[tokio::test]
async fn duplicate_agent_names_conflict_case_insensitively() {
    let server = TestServer::start().await;
    server.create_agent("Scout").await;

    let resp = server
        .client()
        .post(format!("{}/api/agents", server.base_url))
        .header("Authorization", server.admin_auth())
        .json(&json!({"name": "scout", "board_id": server.board_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"],
        "An agent with this name already exists on this board."
    );
}

#[tokio::test]
async fn status_is_never_client_writable() {
    let server = TestServer::start().await;
    let created = server.create_agent("Scout").await;
    let id = created["agent"]["id"].as_str().unwrap();

    let resp = server
        .client()
        .patch(format!("{}/api/agents/{}", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .json(&json!({"status": "online"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "status is controlled by agent heartbeat");
}

#[tokio::test]
async fn heartbeat_or_create_upserts_idempotently() {
    let server = TestServer::start().await;

    let first: Value = server
        .client()
        .post(format!("{}/api/agents/heartbeat", server.base_url))
        .header("Authorization", server.admin_auth())
        .json(&json!({"name": "Scout", "board_id": server.board_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["status"], "online");

    let second: Value = server
        .client()
        .post(format!("{}/api/agents/heartbeat", server.base_url))
        .header("Authorization", server.admin_auth())
        .json(&json!({"name": "scout", "board_id": server.board_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["id"], second["id"]);

    // Only one row exists for the name.
    let agents: Vec<Value> = server
        .client()
        .get(format!(
            "{}/api/agents?board_id={}",
            server.base_url, server.board_id
        ))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agents.len(), 1);
}

#[tokio::test]
async fn agents_read_offline_after_stale_heartbeat() {
    let server = TestServer::start().await;
    let (id, _token) = server.seed_agent(
        "Stale",
        Some(server.board_id.as_str()),
        Some("agent:stale:main"),
        false,
    );
    {
        let conn = server.db.lock().unwrap();
        let stale = (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        conn.execute(
            "UPDATE agents SET last_seen_at = ?1 WHERE id = ?2",
            rusqlite::params![stale, id],
        )
        .unwrap();
    }

    let fetched: Value = server
        .client()
        .get(format!("{}/api/agents/{}", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["status"], "offline");
}

#[tokio::test]
async fn delete_removes_remote_workspace_and_is_idempotent() {
    let server = TestServer::start().await;
    let created = server.create_agent("Scout").await;
    let id = created["agent"]["id"].as_str().unwrap().to_string();

    let resp = server
        .client()
        .delete(format!("{}/api/agents/{}", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(server.gateway.calls_to("agents.delete").len(), 1);

    let resp = server
        .client()
        .get(format!("{}/api/agents/{}", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Deleting again is a quiet success.
    let resp = server
        .client()
        .delete(format!("{}/api/agents/{}", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn delete_proceeds_locally_when_gateway_teardown_fails() {
    let server = TestServer::start().await;
    let created = server.create_agent("Scout").await;
    let id = created["agent"]["id"].as_str().unwrap().to_string();
    server.gateway.fail_method("agents.delete");

    let resp = server
        .client()
        .delete(format!("{}/api/agents/{}", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // The row is gone even though the remote teardown failed.
    let resp = server
        .client()
        .get(format!("{}/api/agents/{}", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // The failure survives on the activity feed.
    let conn = server.db.lock().unwrap();
    let failures: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM activity_events WHERE event_type = 'agent.delete.failed'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn lead_create_without_board_defaults_to_own_board() {
    let server = TestServer::start().await;
    let (_lead_id, lead_token) = server.seed_agent(
        "Alpha Lead",
        Some(server.board_id.as_str()),
        Some("agent:alpha-lead:main"),
        true,
    );

    let resp = server
        .client()
        .post(format!("{}/api/agents", server.base_url))
        .header("Authorization", format!("Bearer {lead_token}"))
        .json(&json!({"name": "Scout"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["agent"]["board_id"], server.board_id.as_str());

    // A foreign board is still rejected.
    let beta = {
        let conn = server.db.lock().unwrap();
        db_ops::create_board(&conn, &server.organization_id, Some(&server.gateway_id), "Beta")
    };
    let resp = server
        .client()
        .post(format!("{}/api/agents", server.base_url))
        .header("Authorization", format!("Bearer {lead_token}"))
        .json(&json!({"name": "Ranger", "board_id": beta.id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn update_rotates_the_agent_token() {
    let server = TestServer::start().await;
    let created = server.create_agent("Scout").await;
    let id = created["agent"]["id"].as_str().unwrap().to_string();
    let original_token = created["token"].as_str().unwrap().to_string();

    let stored_hash = |server: &TestServer| -> String {
        let conn = server.db.lock().unwrap();
        conn.query_row(
            "SELECT token_hash FROM agents WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .unwrap()
    };
    let before = stored_hash(&server);

    let resp = server
        .client()
        .patch(format!("{}/api/agents/{}", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .json(&json!({"name": "Pathfinder"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let after = stored_hash(&server);
    assert_ne!(before, after);
    assert!(!tokens::token_matches(&original_token, &after));

    // The fresh credential rides out to the workspace on the update push.
    let pushes = server.gateway.calls_to("agents.create");
    let pushed = pushes.last().unwrap()["authToken"].as_str().unwrap();
    assert!(tokens::token_matches(pushed, &after));
}

#[tokio::test]
async fn a_gateway_keeps_a_single_main_agent() {
    let server = TestServer::start().await;
    server.seed_agent("Gateway Agent", None, Some("agent:main"), false);
    let created = server.create_agent("Scout").await;
    let id = created["agent"]["id"].as_str().unwrap();

    let resp = server
        .client()
        .patch(format!("{}/api/agents/{}", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .json(&json!({"is_gateway_main": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"],
        "This gateway already has a dedicated gateway agent."
    );

    let conn = server.db.lock().unwrap();
    let boardless: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM agents WHERE gateway_id = ?1 AND board_id IS NULL",
            rusqlite::params![server.gateway_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(boardless, 1);
}

#[tokio::test]
async fn gateway_main_endpoints_reject_ordinary_agents() {
    let server = TestServer::start().await;
    let (_id, token) = server.seed_agent(
        "Scout",
        Some(server.board_id.as_str()),
        Some("agent:scout:main"),
        false,
    );

    let resp = server
        .client()
        .post(format!("{}/api/coordination/lead-broadcast", server.base_url))
        .header("Authorization", format!("Bearer {token}"))
        .json(&json!({"kind": "question", "content": "hello leads"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"],
        "Only the dedicated gateway agent may call this endpoint."
    );
}

#[tokio::test]
async fn broadcast_isolates_per_board_failures() {
    let server = TestServer::start().await;
    let beta = {
        let conn = server.db.lock().unwrap();
        db_ops::create_board(&conn, &server.organization_id, Some(&server.gateway_id), "Beta")
    };

    let (_main_id, main_token) =
        server.seed_agent("Gateway Agent", None, Some("agent:main"), false);
    server.seed_agent(
        "Alpha Lead",
        Some(server.board_id.as_str()),
        Some("agent:alpha-lead:main"),
        true,
    );
    server.seed_agent(
        "Beta Lead",
        Some(beta.id.as_str()),
        Some("agent:beta-lead:main"),
        true,
    );

    // Beta's lead session is unreachable; Alpha's goes through.
    server
        .gateway
        .fail_when("sessions.ensure", "agent:beta-lead:main");

    let resp = server
        .client()
        .post(format!("{}/api/coordination/lead-broadcast", server.base_url))
        .header("Authorization", format!("Bearer {main_token}"))
        .json(&json!({"kind": "question", "content": "weekly check-in"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sent"], 1);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["ok"], false);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    let beta_result = results
        .iter()
        .find(|r| r["board_id"] == beta.id.as_str())
        .unwrap();
    assert_eq!(beta_result["ok"], false);
    assert!(!beta_result["error"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn unsupported_gateway_version_blocks_admin_mutations() {
    let server = TestServer::start().await;
    server.gateway.set_version(Some("2025.12.1"));

    let resp = server
        .client()
        .post(format!("{}/api/agents", server.base_url))
        .header("Authorization", server.admin_auth())
        .json(&json!({"name": "Scout", "board_id": server.board_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Gateway version 2025.12.1 is not supported."));
}

#[tokio::test]
async fn unreachable_gateway_fails_admin_mutations_as_bad_gateway() {
    let server = TestServer::start().await;
    server.gateway.fail_method("config.schema");
    server.gateway.fail_method("status");
    server.gateway.fail_method("health");

    let resp = server
        .client()
        .post(format!("{}/api/agents", server.base_url))
        .header("Authorization", server.admin_auth())
        .json(&json!({"name": "Scout", "board_id": server.board_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Gateway compatibility check failed:"));
}

#[tokio::test]
async fn gateway_status_reports_disconnected_on_incompatible_runtime() {
    let server = TestServer::start().await;
    server.gateway.set_version(Some("2025.1.1"));

    let body: Value = server
        .client()
        .get(format!("{}/api/gateways/status", server.base_url))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["connected"], false);
    assert!(body["error"].as_str().unwrap().contains("not supported"));
}

#[tokio::test]
async fn gateway_status_ensures_a_missing_main_session() {
    let server = TestServer::start().await;

    let body: Value = server
        .client()
        .get(format!("{}/api/gateways/status", server.base_url))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["connected"], true);

    // The mock never lists a main session, so the status path tries to
    // create it before reporting it missing.
    let ensures = server.gateway.calls_to("sessions.ensure");
    assert!(ensures.iter().any(|p| p["key"] == "agent:main"));
    assert_eq!(body["main_session_error"], "Main session not found");
}

#[tokio::test]
async fn soul_update_persists_locally_before_remote_push() {
    let server = TestServer::start().await;
    let (id, _token) = server.seed_agent(
        "Scout",
        Some(server.board_id.as_str()),
        Some("agent:scout:main"),
        false,
    );
    server.gateway.fail_method("agents.files.set");

    let resp = server
        .client()
        .put(format!(
            "{}/api/boards/{}/agents/{}/soul",
            server.base_url, server.board_id, id
        ))
        .header("Authorization", server.admin_auth())
        .json(&json!({"content": "You are Scout."}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    // The stored template is the source of truth even when the push fails.
    let conn = server.db.lock().unwrap();
    let stored: Option<String> = conn
        .query_row(
            "SELECT soul_template FROM agents WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stored.as_deref(), Some("You are Scout."));
}

#[tokio::test]
async fn agent_events_stream_delivers_heartbeat_updates() {
    let server = TestServer::start().await;
    let created = server.create_agent("Scout").await;
    let id = created["agent"]["id"].as_str().unwrap().to_string();

    let ws_url = server.base_url.replacen("http://", "ws://", 1) + "/api/agents/events";
    let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("WS connect failed");
    let (_sink, mut stream) = ws.split();

    // Heartbeat after the stream is up so the update passes the watermark.
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    let resp = server
        .client()
        .post(format!("{}/api/agents/{}/heartbeat", server.base_url, id))
        .header("Authorization", server.admin_auth())
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let frame = tokio::time::timeout(tokio::time::Duration::from_secs(10), async {
        loop {
            match stream.next().await {
                Some(Ok(msg)) if msg.is_text() => {
                    let value: Value = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
                    if value["type"] == "agent" && value["agent"]["id"] == id.as_str() {
                        return value;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("stream ended unexpectedly: {other:?}"),
            }
        }
    })
    .await
    .expect("no agent frame within timeout");
    assert_eq!(frame["agent"]["status"], "online");
}

#[tokio::test]
async fn templates_sync_reports_per_agent_outcomes() {
    let server = TestServer::start().await;
    server.create_agent("Scout").await;
    server.create_agent("Ranger").await;

    let body: Value = server
        .client()
        .post(format!(
            "{}/api/gateways/{}/templates/sync?include_main=false",
            server.base_url, server.gateway_id
        ))
        .header("Authorization", server.admin_auth())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["agents_updated"], 2);
    assert_eq!(body["agents_skipped"], 0);
    assert_eq!(body["main_updated"], false);
    assert!(body["errors"].as_array().unwrap().is_empty());
}
