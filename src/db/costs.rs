// src/db/costs.rs
// Append-only cost ledger

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

pub fn insert_cost_record_sync(
    conn: &Connection,
    provider: &str,
    model_name: &str,
    operation_type: &str,
    input_tokens: i64,
    output_tokens: i64,
    cost_usd: f64,
    metadata: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO cost_tracking
             (provider, model_name, operation_type, input_tokens, output_tokens,
              cost_usd, timestamp, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            provider,
            model_name,
            operation_type,
            input_tokens,
            output_tokens,
            cost_usd,
            Utc::now(),
            metadata,
        ],
    )?;
    Ok(())
}

/// Total ledgered cost since `since`.
pub fn total_cost_since_sync(
    conn: &Connection,
    since: DateTime<Utc>,
) -> rusqlite::Result<f64> {
    conn.query_row(
        "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_tracking WHERE timestamp >= ?1",
        [since],
        |row| row.get(0),
    )
}
