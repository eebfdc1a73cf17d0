// src/db/embeddings.rs
// Embedding records - informational relational copy of stored vectors.
// The vector store holds the authoritative float data.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

/// Metadata view of an embedding record (vector omitted).
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: String,
    pub memory_unit_id: String,
    pub model_name: String,
    pub dimension: usize,
}

/// Insert the embedding record for a memory unit (exactly one per unit).
///
/// Fails with a FOREIGN KEY violation when the memory unit row does not
/// exist - the dual-store writer relies on that to trigger compensation.
pub fn insert_embedding_record_sync(
    conn: &Connection,
    memory_unit_id: &str,
    model_name: &str,
    vector: &[f32],
) -> rusqlite::Result<()> {
    let vector_json =
        serde_json::to_string(vector).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT INTO embeddings (id, memory_unit_id, model_name, dimension, vector, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::new_v4().to_string(),
            memory_unit_id,
            model_name,
            vector.len() as i64,
            vector_json,
            Utc::now(),
        ],
    )?;
    Ok(())
}

pub fn delete_embedding_record_sync(
    conn: &Connection,
    memory_unit_id: &str,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "DELETE FROM embeddings WHERE memory_unit_id = ?1",
        [memory_unit_id],
    )?;
    Ok(changed > 0)
}

pub fn get_embedding_record_sync(
    conn: &Connection,
    memory_unit_id: &str,
) -> rusqlite::Result<Option<EmbeddingRecord>> {
    conn.query_row(
        "SELECT id, memory_unit_id, model_name, dimension FROM embeddings
         WHERE memory_unit_id = ?1",
        [memory_unit_id],
        |row| {
            Ok(EmbeddingRecord {
                id: row.get(0)?,
                memory_unit_id: row.get(1)?,
                model_name: row.get(2)?,
                dimension: row.get::<_, i64>(3)? as usize,
            })
        },
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_units::insert_memory_unit_sync;
    use crate::db::projects::{Project, upsert_project_sync};
    use crate::db::schema::run_migrations;
    use crate::memory::types::{MemoryUnit, MemoryUnitType};

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

    #[test]
    fn test_insert_requires_unit_row() {
        let conn = test_conn();
        let result = insert_embedding_record_sync(&conn, "missing-unit", "test-model", &[0.1, 0.2]);
        assert!(result.is_err(), "FK violation expected for missing unit");
    }

    #[test]
    fn test_roundtrip_and_delete() {
        let conn = test_conn();
        let unit = MemoryUnit::new("default", None, MemoryUnitType::Conversation);
        insert_memory_unit_sync(&conn, &unit).unwrap();
        insert_embedding_record_sync(&conn, &unit.id, "Qwen/Qwen3-Embedding-8B", &[0.0; 8]).unwrap();

        let record = get_embedding_record_sync(&conn, &unit.id).unwrap().unwrap();
        assert_eq!(record.dimension, 8);
        assert_eq!(record.model_name, "Qwen/Qwen3-Embedding-8B");

        assert!(delete_embedding_record_sync(&conn, &unit.id).unwrap());
        assert!(!delete_embedding_record_sync(&conn, &unit.id).unwrap());
        assert!(get_embedding_record_sync(&conn, &unit.id).unwrap().is_none());
    }

    #[test]
    fn test_one_record_per_unit() {
        let conn = test_conn();
        let unit = MemoryUnit::new("default", None, MemoryUnitType::Conversation);
        insert_memory_unit_sync(&conn, &unit).unwrap();
        insert_embedding_record_sync(&conn, &unit.id, "m", &[0.0; 4]).unwrap();
        let dup = insert_embedding_record_sync(&conn, &unit.id, "m", &[0.0; 4]);
        assert!(dup.is_err(), "unique constraint expected");
    }
}
