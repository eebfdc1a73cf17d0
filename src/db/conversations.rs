// src/db/conversations.rs
// Conversation and message persistence

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::memory::types::{Conversation, Message, MessageType};

/// Insert a conversation row (messages are appended separately).
pub fn insert_conversation_sync(conn: &Connection, conv: &Conversation) -> rusqlite::Result<()> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO conversations
             (id, project_id, session_id, title, started_at, ended_at,
              message_count, token_count, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            conv.id,
            conv.project_id,
            conv.session_id,
            conv.title,
            conv.started_at,
            conv.ended_at,
            conv.message_count,
            conv.token_count,
            conv.metadata.as_ref().map(|m| m.to_string()),
            now,
        ],
    )?;
    Ok(())
}

/// Append messages to a conversation and refresh its counters.
///
/// Sequence numbers must already be dense and monotonic; the UNIQUE
/// constraint on (conversation_id, sequence_number) backs that up.
pub fn append_messages_sync(
    conn: &Connection,
    conversation_id: &str,
    messages: &[Message],
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO messages
             (id, conversation_id, sequence_number, message_type, content,
              token_count, timestamp, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for msg in messages {
        stmt.execute(params![
            msg.id,
            conversation_id,
            msg.sequence_number,
            msg.message_type.to_string(),
            msg.content,
            msg.token_count,
            msg.timestamp,
            msg.metadata.as_ref().map(|m| m.to_string()),
        ])?;
    }

    let token_sum: i64 = messages.iter().map(|m| m.token_count).sum();
    conn.execute(
        "UPDATE conversations
         SET message_count = message_count + ?2,
             token_count = token_count + ?3,
             updated_at = ?4
         WHERE id = ?1",
        params![conversation_id, messages.len() as i64, token_sum, Utc::now()],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let message_type: String = row.get(3)?;
    let metadata: Option<String> = row.get(7)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_number: row.get(2)?,
        message_type: message_type
            .parse::<MessageType>()
            .unwrap_or(MessageType::Human),
        content: row.get(4)?,
        token_count: row.get(5)?,
        timestamp: row.get(6)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

/// Load a conversation with its messages ordered by sequence number.
pub fn get_conversation_sync(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<Option<Conversation>> {
    let conv = conn
        .query_row(
            "SELECT id, project_id, session_id, title, started_at, ended_at,
                    message_count, token_count, metadata
             FROM conversations WHERE id = ?1",
            [id],
            |row| {
                let metadata: Option<String> = row.get(8)?;
                Ok(Conversation {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    session_id: row.get(2)?,
                    title: row.get(3)?,
                    messages: Vec::new(),
                    started_at: row.get(4)?,
                    ended_at: row.get(5)?,
                    message_count: row.get(6)?,
                    token_count: row.get(7)?,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                })
            },
        )
        .optional()?;

    let Some(mut conv) = conv else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, sequence_number, message_type, content,
                token_count, timestamp, metadata
         FROM messages WHERE conversation_id = ?1
         ORDER BY sequence_number",
    )?;
    conv.messages = stmt
        .query_map([id], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Some(conv))
}

/// Conversation ids started within the last `days` days for a project.
pub fn recent_conversation_ids_sync(
    conn: &Connection,
    project_id: &str,
    days: i64,
    limit: usize,
) -> rusqlite::Result<Vec<String>> {
    let cutoff = Utc::now() - chrono::Duration::days(days);
    let mut stmt = conn.prepare(
        "SELECT id FROM conversations
         WHERE project_id = ?1 AND started_at >= ?2
         ORDER BY started_at DESC LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![project_id, cutoff, limit as i64], |row| row.get(0))?;
    rows.collect()
}

/// Mark a conversation ended.
pub fn end_conversation_sync(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let now = Utc::now();
    let changed = conn.execute(
        "UPDATE conversations SET ended_at = ?2, updated_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
        params![id, now],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::projects::{Project, upsert_project_sync};
    use crate::db::schema::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("PRAGMA foreign_keys=ON").unwrap();
        run_migrations(&conn).expect("migrate");
        let now = Utc::now();
        upsert_project_sync(
            &conn,
            &Project {
                id: "default".into(),
                name: "default".into(),
                description: String::new(),
                is_active: true,
                created_at: now,
                updated_at: now,
                settings: serde_json::json!({}),
            },
        )
        .unwrap();
        conn
    }

    fn sample_conversation() -> Conversation {
        let mut conv = Conversation::new("default");
        conv.push_message(MessageType::Human, "How to implement binary search?");
        conv.push_message(MessageType::Assistant, "Use two pointers over a sorted array.");
        conv
    }

    #[test]
    fn test_insert_and_roundtrip() {
        let conn = test_conn();
        let conv = sample_conversation();
        insert_conversation_sync(&conn, &conv).unwrap();
        append_messages_sync(&conn, &conv.id, &conv.messages).unwrap();

        let loaded = get_conversation_sync(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].sequence_number, 0);
        assert_eq!(loaded.messages[1].sequence_number, 1);
        assert_eq!(loaded.messages[0].message_type, MessageType::Human);
        assert_eq!(loaded.message_count, 2);
    }

    #[test]
    fn test_append_updates_counters() {
        let conn = test_conn();
        let mut conv = sample_conversation();
        conv.messages[0].token_count = 10;
        conv.messages[1].token_count = 40;
        conv.message_count = 0; // counters accumulate via append
        insert_conversation_sync(&conn, &conv).unwrap();
        append_messages_sync(&conn, &conv.id, &conv.messages).unwrap();

        let loaded = get_conversation_sync(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(loaded.message_count, 2);
        assert_eq!(loaded.token_count, 50);
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let conn = test_conn();
        let conv = sample_conversation();
        insert_conversation_sync(&conn, &conv).unwrap();
        append_messages_sync(&conn, &conv.id, &conv.messages).unwrap();
        // Re-appending the same sequence numbers violates the unique index
        assert!(append_messages_sync(&conn, &conv.id, &conv.messages).is_err());
    }

    #[test]
    fn test_missing_conversation_is_none() {
        let conn = test_conn();
        assert!(get_conversation_sync(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn test_end_conversation_idempotent() {
        let conn = test_conn();
        let conv = sample_conversation();
        insert_conversation_sync(&conn, &conv).unwrap();
        assert!(end_conversation_sync(&conn, &conv.id).unwrap());
        assert!(!end_conversation_sync(&conn, &conv.id).unwrap());
    }

    #[test]
    fn test_recent_ids_filtered_by_project() {
        let conn = test_conn();
        let conv = sample_conversation();
        insert_conversation_sync(&conn, &conv).unwrap();
        let ids = recent_conversation_ids_sync(&conn, "default", 7, 10).unwrap();
        assert_eq!(ids, vec![conv.id.clone()]);
        let other = recent_conversation_ids_sync(&conn, "other", 7, 10).unwrap();
        assert!(other.is_empty());
    }
}
