// src/vector/mod.rs
// Persisted vector collection over sqlite-vec with payload filters.
//
// The collection is a vec0 virtual table plus a payload side table in a
// dedicated database file. Point ids are UUID strings; the payload table
// maps them to the integer rowids vec0 requires.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::{DistanceMetric, VectorSettings};
use crate::db::DatabasePool;
use crate::error::{MemoryError, Result};
use crate::memory::types::MemoryUnit;

/// Payload carried with each vector point.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPayload {
    pub memory_unit_id: String,
    pub conversation_id: Option<String>,
    pub project_id: String,
    pub unit_type: String,
    pub title: String,
    pub keywords: Vec<String>,
    pub token_count: i64,
    /// Epoch seconds
    pub created_at: i64,
    /// Epoch seconds, None = never expires
    pub expires_at: Option<i64>,
    pub importance_score: f64,
    pub quality_score: f64,
}

impl VectorPayload {
    pub fn from_unit(unit: &MemoryUnit) -> Self {
        Self {
            memory_unit_id: unit.id.clone(),
            conversation_id: unit.conversation_id.clone(),
            project_id: unit.project_id.clone(),
            unit_type: unit.unit_type.to_string(),
            title: unit.title.clone(),
            keywords: unit.keywords.clone(),
            token_count: unit.token_count,
            created_at: unit.created_at.timestamp(),
            expires_at: unit.expires_at.map(|t| t.timestamp()),
            importance_score: unit.importance_score(),
            quality_score: unit.quality_score(),
        }
    }
}

/// Filter grammar for vector searches: field equality, set membership on
/// unit types, and the null-or-future expiry check.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub project_id: Option<String>,
    pub conversation_id: Option<String>,
    pub unit_types: Option<Vec<String>>,
    /// When set, only points with `expires_at IS NULL OR expires_at > t`
    /// match (t in epoch seconds).
    pub not_expired_at: Option<i64>,
}

impl VectorFilter {
    pub fn not_expired_now(mut self) -> Self {
        self.not_expired_at = Some(Utc::now().timestamp());
        self
    }
}

/// One search hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: VectorPayload,
}

/// Serialize an f32 slice into the little-endian blob sqlite-vec expects.
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn distance_function(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Cosine => "vec_distance_cosine",
        DistanceMetric::Euclid => "vec_distance_l2",
        // sqlite-vec has no raw dot-product distance; cosine is the closest
        // stand-in for normalized embedding spaces
        DistanceMetric::Dot => "vec_distance_cosine",
    }
}

fn distance_to_score(metric: DistanceMetric, distance: f32) -> f32 {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::Dot => 1.0 - distance,
        DistanceMetric::Euclid => 1.0 / (1.0 + distance),
    }
}

/// Vector store client. One instance is shared across the process.
pub struct VectorStore {
    pool: Arc<DatabasePool>,
    collection: String,
    dimension: usize,
    metric: DistanceMetric,
}

impl VectorStore {
    pub fn new(pool: Arc<DatabasePool>, settings: &VectorSettings) -> Self {
        Self {
            pool,
            collection: settings.collection_name.clone(),
            dimension: settings.vector_size,
            metric: settings.distance_metric,
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn payload_table(&self) -> String {
        format!("{}_payload", self.collection)
    }

    fn meta_table(&self) -> String {
        format!("{}_meta", self.collection)
    }

    /// Create the collection if absent. An existing collection with a
    /// different dimension is dropped and recreated (points must be
    /// re-embedded in the new space anyway).
    pub async fn ensure_collection(&self) -> Result<()> {
        let collection = self.collection.clone();
        let payload_table = self.payload_table();
        let meta_table = self.meta_table();
        let dimension = self.dimension;

        self.pool
            .run(move |conn| -> std::result::Result<(), rusqlite::Error> {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS \"{meta_table}\" (key TEXT PRIMARY KEY, value TEXT NOT NULL)"
                ))?;

                let existing_dim: Option<i64> = conn
                    .query_row(
                        &format!("SELECT value FROM \"{meta_table}\" WHERE key = 'dimension'"),
                        [],
                        |row| row.get::<_, String>(0),
                    )
                    .ok()
                    .and_then(|v| v.parse().ok());

                if let Some(dim) = existing_dim {
                    if dim as usize != dimension {
                        warn!(
                            old = dim,
                            new = dimension,
                            "Vector collection dimension changed, recreating"
                        );
                        conn.execute_batch(&format!(
                            "DROP TABLE IF EXISTS \"{collection}\";
                             DROP TABLE IF EXISTS \"{payload_table}\";
                             DELETE FROM \"{meta_table}\";"
                        ))?;
                    }
                }

                conn.execute_batch(&format!(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS \"{collection}\"
                         USING vec0(embedding float[{dimension}]);
                     CREATE TABLE IF NOT EXISTS \"{payload_table}\" (
                         rid              INTEGER PRIMARY KEY AUTOINCREMENT,
                         point_id         TEXT NOT NULL UNIQUE,
                         memory_unit_id   TEXT NOT NULL,
                         conversation_id  TEXT,
                         project_id       TEXT NOT NULL,
                         unit_type        TEXT NOT NULL,
                         title            TEXT NOT NULL DEFAULT '',
                         keywords         TEXT NOT NULL DEFAULT '[]',
                         token_count      INTEGER NOT NULL DEFAULT 0,
                         created_at       INTEGER NOT NULL,
                         expires_at       INTEGER,
                         importance_score REAL NOT NULL DEFAULT 0.5,
                         quality_score    REAL NOT NULL DEFAULT 0.5
                     );
                     CREATE INDEX IF NOT EXISTS \"idx_{payload_table}_project\"
                         ON \"{payload_table}\"(project_id, unit_type);"
                ))?;

                conn.execute(
                    &format!(
                        "INSERT INTO \"{meta_table}\" (key, value) VALUES ('dimension', ?1)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value"
                    ),
                    [dimension.to_string()],
                )?;
                Ok(())
            })
            .await?;

        info!(
            collection = %self.collection,
            dimension = self.dimension,
            "Vector collection ready"
        );
        Ok(())
    }

    /// Insert or replace a point. Rejects vectors of the wrong dimension.
    pub async fn upsert(&self, id: &str, vector: Vec<f32>, payload: VectorPayload) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::Validation(format!(
                "vector dimension {} does not match collection dimension {}",
                vector.len(),
                self.dimension
            )));
        }

        let collection = self.collection.clone();
        let payload_table = self.payload_table();
        let id = id.to_string();

        self.pool
            .run(move |conn| -> std::result::Result<(), rusqlite::Error> {
                let tx = conn.unchecked_transaction()?;

                // Replace any existing point with this id
                if let Ok(rid) = tx.query_row(
                    &format!("SELECT rid FROM \"{payload_table}\" WHERE point_id = ?1"),
                    [&id],
                    |row| row.get::<_, i64>(0),
                ) {
                    tx.execute(&format!("DELETE FROM \"{collection}\" WHERE rowid = ?1"), [rid])?;
                    tx.execute(
                        &format!("DELETE FROM \"{payload_table}\" WHERE rid = ?1"),
                        [rid],
                    )?;
                }

                tx.execute(
                    &format!(
                        "INSERT INTO \"{payload_table}\"
                             (point_id, memory_unit_id, conversation_id, project_id, unit_type,
                              title, keywords, token_count, created_at, expires_at,
                              importance_score, quality_score)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                    ),
                    rusqlite::params![
                        id,
                        payload.memory_unit_id,
                        payload.conversation_id,
                        payload.project_id,
                        payload.unit_type,
                        payload.title,
                        serde_json::to_string(&payload.keywords)
                            .unwrap_or_else(|_| "[]".to_string()),
                        payload.token_count,
                        payload.created_at,
                        payload.expires_at,
                        payload.importance_score,
                        payload.quality_score,
                    ],
                )?;
                let rid = tx.last_insert_rowid();

                tx.execute(
                    &format!("INSERT INTO \"{collection}\" (rowid, embedding) VALUES (?1, ?2)"),
                    rusqlite::params![rid, embedding_to_bytes(&vector)],
                )?;

                tx.commit()
            })
            .await?;
        Ok(())
    }

    /// Delete points by id. Idempotent - unknown ids are ignored.
    pub async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let collection = self.collection.clone();
        let payload_table = self.payload_table();
        let ids = ids.to_vec();

        self.pool
            .run(move |conn| -> std::result::Result<(), rusqlite::Error> {
                let tx = conn.unchecked_transaction()?;
                for id in &ids {
                    if let Ok(rid) = tx.query_row(
                        &format!("SELECT rid FROM \"{payload_table}\" WHERE point_id = ?1"),
                        [id],
                        |row| row.get::<_, i64>(0),
                    ) {
                        tx.execute(&format!("DELETE FROM \"{collection}\" WHERE rowid = ?1"), [rid])?;
                        tx.execute(
                            &format!("DELETE FROM \"{payload_table}\" WHERE rid = ?1"),
                            [rid],
                        )?;
                    }
                }
                tx.commit()
            })
            .await?;
        Ok(())
    }

    /// K-nearest search with payload filters and a score floor.
    pub async fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filter: &VectorFilter,
        score_threshold: Option<f32>,
    ) -> Result<Vec<VectorHit>> {
        if vector.len() != self.dimension {
            return Err(MemoryError::Validation(format!(
                "query vector dimension {} does not match collection dimension {}",
                vector.len(),
                self.dimension
            )));
        }

        let collection = self.collection.clone();
        let payload_table = self.payload_table();
        let metric = self.metric;
        let filter = filter.clone();

        let hits = self
            .pool
            .run(move |conn| -> std::result::Result<Vec<VectorHit>, rusqlite::Error> {
                let distance_fn = distance_function(metric);
                let mut sql = format!(
                    "SELECT p.point_id, p.memory_unit_id, p.conversation_id, p.project_id,
                            p.unit_type, p.title, p.keywords, p.token_count, p.created_at,
                            p.expires_at, p.importance_score, p.quality_score,
                            {distance_fn}(v.embedding, ?1) AS distance
                     FROM \"{collection}\" v
                     JOIN \"{payload_table}\" p ON p.rid = v.rowid
                     WHERE 1 = 1"
                );

                let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
                    vec![Box::new(embedding_to_bytes(&vector))];

                if let Some(project_id) = &filter.project_id {
                    args.push(Box::new(project_id.clone()));
                    sql.push_str(&format!(" AND p.project_id = ?{}", args.len()));
                }
                if let Some(conversation_id) = &filter.conversation_id {
                    args.push(Box::new(conversation_id.clone()));
                    sql.push_str(&format!(" AND p.conversation_id = ?{}", args.len()));
                }
                if let Some(types) = &filter.unit_types {
                    if !types.is_empty() {
                        let mut placeholders = Vec::new();
                        for t in types {
                            args.push(Box::new(t.clone()));
                            placeholders.push(format!("?{}", args.len()));
                        }
                        sql.push_str(&format!(
                            " AND p.unit_type IN ({})",
                            placeholders.join(", ")
                        ));
                    }
                }
                if let Some(now) = filter.not_expired_at {
                    args.push(Box::new(now));
                    sql.push_str(&format!(
                        " AND (p.expires_at IS NULL OR p.expires_at > ?{})",
                        args.len()
                    ));
                }

                args.push(Box::new(limit as i64));
                sql.push_str(&format!(" ORDER BY distance ASC LIMIT ?{}", args.len()));

                let mut stmt = conn.prepare(&sql)?;
                let params_slice: Vec<&dyn rusqlite::types::ToSql> =
                    args.iter().map(|b| b.as_ref()).collect();

                let rows = stmt.query_map(params_slice.as_slice(), |row| {
                    let keywords: String = row.get(6)?;
                    let distance: f32 = row.get(12)?;
                    Ok(VectorHit {
                        id: row.get(0)?,
                        score: distance_to_score(metric, distance),
                        payload: VectorPayload {
                            memory_unit_id: row.get(1)?,
                            conversation_id: row.get(2)?,
                            project_id: row.get(3)?,
                            unit_type: row.get(4)?,
                            title: row.get(5)?,
                            keywords: serde_json::from_str(&keywords).unwrap_or_default(),
                            token_count: row.get(7)?,
                            created_at: row.get(8)?,
                            expires_at: row.get(9)?,
                            importance_score: row.get(10)?,
                            quality_score: row.get(11)?,
                        },
                    })
                })?;
                rows.collect()
            })
            .await?;

        let threshold = score_threshold.unwrap_or(f32::MIN);
        Ok(hits.into_iter().filter(|h| h.score >= threshold).collect())
    }

    /// Fetch payloads for specific point ids. Missing ids are dropped.
    pub async fn get(&self, ids: &[String]) -> Result<Vec<(String, VectorPayload)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let payload_table = self.payload_table();
        let ids = ids.to_vec();

        let found = self
            .pool
            .run(
                move |conn| -> std::result::Result<Vec<(String, VectorPayload)>, rusqlite::Error> {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT point_id, memory_unit_id, conversation_id, project_id, unit_type,
                                title, keywords, token_count, created_at, expires_at,
                                importance_score, quality_score
                         FROM \"{payload_table}\" WHERE point_id = ?1"
                    ))?;
                    let mut found = Vec::new();
                    for id in &ids {
                        let row = stmt
                            .query_row([id], |row| {
                                let keywords: String = row.get(6)?;
                                Ok((
                                    row.get::<_, String>(0)?,
                                    VectorPayload {
                                        memory_unit_id: row.get(1)?,
                                        conversation_id: row.get(2)?,
                                        project_id: row.get(3)?,
                                        unit_type: row.get(4)?,
                                        title: row.get(5)?,
                                        keywords: serde_json::from_str(&keywords)
                                            .unwrap_or_default(),
                                        token_count: row.get(7)?,
                                        created_at: row.get(8)?,
                                        expires_at: row.get(9)?,
                                        importance_score: row.get(10)?,
                                        quality_score: row.get(11)?,
                                    },
                                ))
                            })
                            .ok();
                        if let Some(pair) = row {
                            found.push(pair);
                        }
                    }
                    Ok(found)
                },
            )
            .await?;
        Ok(found)
    }

    /// Number of points in the collection.
    pub async fn count(&self) -> Result<i64> {
        let payload_table = self.payload_table();
        self.pool
            .run(move |conn| {
                conn.query_row(
                    &format!("SELECT COUNT(*) FROM \"{payload_table}\""),
                    [],
                    |row| row.get(0),
                )
            })
            .await
    }

    /// Cheap liveness probe.
    pub async fn ping(&self) -> bool {
        self.pool.ping().await
    }
}
