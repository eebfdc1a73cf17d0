// src/db/schema.rs
// Relational schema and migrations

use anyhow::Result;
use rusqlite::Connection;

/// Base schema. Idempotent: every statement is IF NOT EXISTS.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    settings    TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS conversations (
    id            TEXT PRIMARY KEY,
    project_id    TEXT NOT NULL REFERENCES projects(id),
    session_id    TEXT,
    title         TEXT NOT NULL DEFAULT '',
    started_at    TEXT NOT NULL,
    ended_at      TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    token_count   INTEGER NOT NULL DEFAULT 0,
    metadata      TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_session_id ON conversations(session_id);
CREATE INDEX IF NOT EXISTS idx_conversations_started_at ON conversations(started_at);

CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    sequence_number INTEGER NOT NULL,
    message_type    TEXT NOT NULL,
    content         TEXT NOT NULL,
    token_count     INTEGER NOT NULL DEFAULT 0,
    timestamp       TEXT NOT NULL,
    metadata        TEXT,
    UNIQUE (conversation_id, sequence_number)
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_time ON messages(conversation_id, timestamp);

CREATE TABLE IF NOT EXISTS memory_units (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL REFERENCES projects(id),
    conversation_id TEXT REFERENCES conversations(id),
    unit_type       TEXT NOT NULL,
    title           TEXT NOT NULL,
    summary         TEXT NOT NULL,
    content         TEXT NOT NULL,
    keywords        TEXT NOT NULL DEFAULT '[]',
    token_count     INTEGER NOT NULL DEFAULT 0,
    relevance_score REAL NOT NULL DEFAULT 0.0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    expires_at      TEXT,
    is_active       INTEGER NOT NULL DEFAULT 1,
    metadata        TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_memory_units_type_created
    ON memory_units(unit_type, created_at, is_active);
CREATE INDEX IF NOT EXISTS idx_memory_units_project_type_created
    ON memory_units(project_id, unit_type, created_at);
CREATE INDEX IF NOT EXISTS idx_memory_units_expires ON memory_units(expires_at);

CREATE TABLE IF NOT EXISTS embeddings (
    id             TEXT PRIMARY KEY,
    memory_unit_id TEXT NOT NULL UNIQUE REFERENCES memory_units(id) ON DELETE CASCADE,
    model_name     TEXT NOT NULL,
    dimension      INTEGER NOT NULL,
    vector         TEXT NOT NULL,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_memory_unit_id ON embeddings(memory_unit_id);

CREATE TABLE IF NOT EXISTS cost_tracking (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    provider       TEXT NOT NULL,
    model_name     TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    input_tokens   INTEGER NOT NULL DEFAULT 0,
    output_tokens  INTEGER NOT NULL DEFAULT 0,
    cost_usd       REAL NOT NULL DEFAULT 0.0,
    timestamp      TEXT NOT NULL,
    metadata       TEXT
);
CREATE INDEX IF NOT EXISTS idx_cost_tracking_timestamp ON cost_tracking(timestamp);
"#;

/// Run all schema setup and migrations. Idempotent.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");
    }

    #[test]
    fn test_expected_tables_exist() {
        let conn = Connection::open_in_memory().expect("open");
        run_migrations(&conn).expect("migrate");
        for table in [
            "projects",
            "conversations",
            "messages",
            "memory_units",
            "embeddings",
            "cost_tracking",
        ] {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            assert!(exists, "table {table} missing");
        }
    }

    #[test]
    fn test_message_sequence_unique_per_conversation() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("PRAGMA foreign_keys=ON").unwrap();
        run_migrations(&conn).expect("migrate");
        conn.execute_batch(
            "INSERT INTO projects (id, name, created_at, updated_at)
             VALUES ('p', 'p', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
             INSERT INTO conversations (id, project_id, started_at, created_at, updated_at)
             VALUES ('c', 'p', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
             INSERT INTO messages (id, conversation_id, sequence_number, message_type, content, timestamp)
             VALUES ('m0', 'c', 0, 'human', 'hi', '2026-01-01T00:00:00Z');",
        )
        .unwrap();

        let dup = conn.execute(
            "INSERT INTO messages (id, conversation_id, sequence_number, message_type, content, timestamp)
             VALUES ('m1', 'c', 0, 'assistant', 'dup', '2026-01-01T00:00:01Z')",
            [],
        );
        assert!(dup.is_err(), "duplicate sequence_number must be rejected");
    }
}
