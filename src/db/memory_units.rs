// src/db/memory_units.rs
// Memory unit persistence and indexed reads

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::memory::types::{MemoryUnit, MemoryUnitType};

const UNIT_COLUMNS: &str = "id, project_id, conversation_id, unit_type, title, summary, content, \
     keywords, token_count, relevance_score, created_at, updated_at, expires_at, is_active, metadata";

fn row_to_unit(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryUnit> {
    let unit_type: String = row.get(3)?;
    let keywords: String = row.get(7)?;
    let metadata: String = row.get(14)?;
    Ok(MemoryUnit {
        id: row.get(0)?,
        project_id: row.get(1)?,
        conversation_id: row.get(2)?,
        unit_type: unit_type
            .parse::<MemoryUnitType>()
            .unwrap_or(MemoryUnitType::Conversation),
        title: row.get(4)?,
        summary: row.get(5)?,
        content: row.get(6)?,
        keywords: serde_json::from_str(&keywords).unwrap_or_default(),
        token_count: row.get(8)?,
        relevance_score: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        expires_at: row.get(12)?,
        is_active: row.get::<_, i64>(13)? != 0,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

pub fn insert_memory_unit_sync(conn: &Connection, unit: &MemoryUnit) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO memory_units
             (id, project_id, conversation_id, unit_type, title, summary, content,
              keywords, token_count, relevance_score, created_at, updated_at,
              expires_at, is_active, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            unit.id,
            unit.project_id,
            unit.conversation_id,
            unit.unit_type.to_string(),
            unit.title,
            unit.summary,
            unit.content,
            serde_json::to_string(&unit.keywords).unwrap_or_else(|_| "[]".to_string()),
            unit.token_count,
            unit.relevance_score,
            unit.created_at,
            unit.updated_at,
            unit.expires_at,
            unit.is_active as i64,
            unit.metadata.to_string(),
        ],
    )?;
    Ok(())
}

pub fn get_memory_unit_sync(conn: &Connection, id: &str) -> rusqlite::Result<Option<MemoryUnit>> {
    conn.query_row(
        &format!("SELECT {UNIT_COLUMNS} FROM memory_units WHERE id = ?1"),
        [id],
        row_to_unit,
    )
    .optional()
}

/// Hydrate several units by id. Missing ids are silently dropped - readers
/// must tolerate rows deleted between a vector hit and this lookup.
pub fn get_memory_units_by_ids_sync(
    conn: &Connection,
    ids: &[String],
) -> rusqlite::Result<Vec<MemoryUnit>> {
    let mut units = Vec::with_capacity(ids.len());
    let mut stmt =
        conn.prepare(&format!("SELECT {UNIT_COLUMNS} FROM memory_units WHERE id = ?1"))?;
    for id in ids {
        if let Some(unit) = stmt.query_row([id], row_to_unit).optional()? {
            units.push(unit);
        }
    }
    Ok(units)
}

pub fn delete_memory_unit_sync(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute("DELETE FROM memory_units WHERE id = ?1", [id])?;
    Ok(changed > 0)
}

/// Ids of units whose expiry has passed as of `now`.
pub fn list_expired_memory_units_sync(
    conn: &Connection,
    now: DateTime<Utc>,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM memory_units WHERE expires_at IS NOT NULL AND expires_at <= ?1",
    )?;
    let rows = stmt.query_map([now], |row| row.get(0))?;
    rows.collect()
}

/// Most recent active units derived from one conversation.
pub fn list_units_for_conversation_sync(
    conn: &Connection,
    conversation_id: &str,
    limit: usize,
) -> rusqlite::Result<Vec<MemoryUnit>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {UNIT_COLUMNS} FROM memory_units
         WHERE conversation_id = ?1 AND is_active = 1
         ORDER BY created_at DESC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![conversation_id, limit as i64], row_to_unit)?;
    rows.collect()
}

/// Parameters for the keyword candidate scan.
pub struct KeywordQuery<'a> {
    pub project_id: Option<&'a str>,
    pub keywords: &'a [String],
    pub unit_types: Option<&'a [MemoryUnitType]>,
    pub include_expired: bool,
    pub limit: usize,
}

/// Candidate units for keyword scoring: any query keyword present in the
/// stored keyword list, the title or the summary. Ordered newest first.
/// Scoring happens in the retriever; this only narrows the scan.
pub fn keyword_candidates_sync(
    conn: &Connection,
    query: &KeywordQuery<'_>,
) -> rusqlite::Result<Vec<MemoryUnit>> {
    if query.keywords.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = format!("SELECT {UNIT_COLUMNS} FROM memory_units WHERE is_active = 1");
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(project_id) = query.project_id {
        args.push(Box::new(project_id.to_string()));
        sql.push_str(&format!(" AND project_id = ?{}", args.len()));
    }

    let mut keyword_clauses = Vec::new();
    for keyword in query.keywords {
        let needle = format!("%{}%", keyword.to_lowercase());
        args.push(Box::new(needle));
        let idx = args.len();
        keyword_clauses.push(format!(
            "(lower(keywords) LIKE ?{idx} OR lower(title) LIKE ?{idx} OR lower(summary) LIKE ?{idx})"
        ));
    }
    sql.push_str(&format!(" AND ({})", keyword_clauses.join(" OR ")));

    if let Some(types) = query.unit_types {
        if !types.is_empty() {
            let mut placeholders = Vec::new();
            for t in types {
                args.push(Box::new(t.to_string()));
                placeholders.push(format!("?{}", args.len()));
            }
            sql.push_str(&format!(" AND unit_type IN ({})", placeholders.join(", ")));
        }
    }

    if !query.include_expired {
        args.push(Box::new(Utc::now()));
        sql.push_str(&format!(
            " AND (expires_at IS NULL OR expires_at > ?{})",
            args.len()
        ));
    }

    sql.push_str(" ORDER BY created_at DESC");
    args.push(Box::new(query.limit as i64));
    sql.push_str(&format!(" LIMIT ?{}", args.len()));

    let mut stmt = conn.prepare(&sql)?;
    let params_slice: Vec<&dyn rusqlite::types::ToSql> =
        args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(params_slice.as_slice(), row_to_unit)?;
    rows.collect()
}
