//! Durable envelope for outbound gateway work that failed in-line.
//!
//! When a best-effort side-effect (wakeup, cleanup message) cannot reach
//! the gateway, it is parked here and drained by the background worker.

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: String,
    /// Operation discriminator, e.g. `session.message`.
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn from_row(row: &Row) -> rusqlite::Result<QueuedTask> {
    let payload: String = row.get("payload")?;
    Ok(QueuedTask {
        id: row.get("id")?,
        kind: row.get("kind")?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        status: row.get("status")?,
        attempts: row.get("attempts")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn enqueue(conn: &Connection, kind: &str, payload: &serde_json::Value) -> QueuedTask {
    let ts = now();
    let task = QueuedTask {
        id: Uuid::new_v4().to_string(),
        kind: kind.to_string(),
        payload: payload.clone(),
        status: "pending".to_string(),
        attempts: 0,
        last_error: None,
        created_at: ts.clone(),
        updated_at: ts,
    };
    conn.execute(
        "INSERT INTO queued_tasks (id, kind, payload, status, attempts, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', 0, NULL, ?4, ?5)",
        params![
            task.id,
            task.kind,
            task.payload.to_string(),
            task.created_at,
            task.updated_at
        ],
    )
    .unwrap();
    task
}

pub fn pending(conn: &Connection, limit: usize) -> Vec<QueuedTask> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT * FROM queued_tasks WHERE status = 'pending' ORDER BY created_at LIMIT {}",
            limit
        ))
        .unwrap();
    stmt.query_map([], from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect()
}

pub fn mark_done(conn: &Connection, id: &str) {
    conn.execute(
        "UPDATE queued_tasks SET status = 'done', last_error = NULL, updated_at = ?1 WHERE id = ?2",
        params![now(), id],
    )
    .unwrap();
}

/// Record a failed delivery attempt. The task stays pending until it runs
/// out of attempts, then it is parked as failed.
pub fn mark_attempt_failed(conn: &Connection, id: &str, error: &str) {
    conn.execute(
        "UPDATE queued_tasks
         SET attempts = attempts + 1,
             last_error = ?1,
             status = CASE WHEN attempts + 1 >= ?2 THEN 'failed' ELSE 'pending' END,
             updated_at = ?3
         WHERE id = ?4",
        params![error, MAX_ATTEMPTS, now(), id],
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    fn test_conn() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let conn = db::init_db(dir.path().join("test.db").to_str().unwrap());
        (dir, conn)
    }

    #[test]
    fn enqueue_and_drain() {
        let (_dir, conn) = test_conn();
        let task = enqueue(
            &conn,
            "session.message",
            &serde_json::json!({"session_key": "agent:main", "content": "hi"}),
        );
        assert_eq!(pending(&conn, 10).len(), 1);

        mark_done(&conn, &task.id);
        assert!(pending(&conn, 10).is_empty());
    }

    #[test]
    fn tasks_park_as_failed_after_max_attempts() {
        let (_dir, conn) = test_conn();
        let task = enqueue(&conn, "session.message", &serde_json::json!({}));
        for _ in 0..MAX_ATTEMPTS {
            mark_attempt_failed(&conn, &task.id, "gateway unreachable");
        }
        assert!(pending(&conn, 10).is_empty());
        let status: String = conn
            .query_row(
                "SELECT status FROM queued_tasks WHERE id = ?1",
                params![task.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "failed");
        let attempts: i64 = conn
            .query_row(
                "SELECT attempts FROM queued_tasks WHERE id = ?1",
                params![task.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(attempts, MAX_ATTEMPTS);
    }
}
