use rusqlite::Connection;

pub fn init_db(path: &str) -> Connection {
    let conn = Connection::open(path).expect("Failed to open database");

    // Enable WAL mode for concurrent reads
    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .expect("Failed to enable WAL mode");

    // Checkpoint any pending WAL data before running migrations.
    // This prevents data loss when upgrading the binary (old WAL + new schema = bad).
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .expect("Failed to checkpoint WAL");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS gateways (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            name TEXT NOT NULL,
            url TEXT,
            token TEXT,
            workspace_root TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS boards (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL REFERENCES organizations(id),
            gateway_id TEXT REFERENCES gateways(id),
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'provisioning',
            board_id TEXT REFERENCES boards(id),
            gateway_id TEXT NOT NULL REFERENCES gateways(id),
            is_board_lead INTEGER NOT NULL DEFAULT 0,
            session_key TEXT,
            token_hash TEXT,
            heartbeat_config TEXT,
            identity_profile TEXT,
            soul_template TEXT,
            provision_requested_at TEXT,
            provision_action TEXT,
            last_seen_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            board_id TEXT NOT NULL REFERENCES boards(id),
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'inbox',
            assigned_agent_id TEXT REFERENCES agents(id),
            in_progress_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS approvals (
            id TEXT PRIMARY KEY,
            agent_id TEXT REFERENCES agents(id),
            status TEXT NOT NULL DEFAULT 'pending',
            summary TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS activity_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            message TEXT NOT NULL,
            agent_id TEXT,
            board_id TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queued_tasks (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_agents_board_id ON agents(board_id);
        CREATE INDEX IF NOT EXISTS idx_agents_gateway_id ON agents(gateway_id);
        CREATE INDEX IF NOT EXISTS idx_agents_session_key ON agents(session_key);
        CREATE INDEX IF NOT EXISTS idx_boards_gateway_id ON boards(gateway_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_board_id ON tasks(board_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_assigned_agent ON tasks(assigned_agent_id);
        CREATE INDEX IF NOT EXISTS idx_activity_created ON activity_events(created_at);
        CREATE INDEX IF NOT EXISTS idx_activity_agent ON activity_events(agent_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_queued_status ON queued_tasks(status, created_at);
        ",
    )
    .expect("Failed to initialize database schema");

    // v2: per-gateway workspace root (was a process-wide setting)
    let _ = conn.execute("ALTER TABLE gateways ADD COLUMN workspace_root TEXT", []);

    // v2: soul templates stored locally as the write-through source of truth
    let _ = conn.execute("ALTER TABLE agents ADD COLUMN soul_template TEXT", []);

    // v3: provision markers for the reconcile loop
    let _ = conn.execute(
        "ALTER TABLE agents ADD COLUMN provision_requested_at TEXT",
        [],
    );
    let _ = conn.execute("ALTER TABLE agents ADD COLUMN provision_action TEXT", []);

    // v3: board scoping on the activity log
    let _ = conn.execute("ALTER TABLE activity_events ADD COLUMN board_id TEXT", []);

    conn
}
