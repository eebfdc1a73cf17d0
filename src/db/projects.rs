// src/db/projects.rs
// Project records: scope identifiers for memory isolation

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A scope identifier. The project named by the default id always exists
/// and cannot be deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settings: Value,
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let settings: String = row.get(6)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        settings: serde_json::from_str(&settings).unwrap_or(Value::Null),
    })
}

const PROJECT_COLUMNS: &str =
    "id, name, description, is_active, created_at, updated_at, settings";

/// Insert or update a project row, preserving created_at on update.
pub fn upsert_project_sync(conn: &Connection, project: &Project) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO projects (id, name, description, is_active, created_at, updated_at, settings)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             description = excluded.description,
             is_active = excluded.is_active,
             updated_at = excluded.updated_at,
             settings = excluded.settings",
        params![
            project.id,
            project.name,
            project.description,
            project.is_active as i64,
            project.created_at,
            project.updated_at,
            project.settings.to_string(),
        ],
    )?;
    Ok(())
}

pub fn get_project_sync(conn: &Connection, id: &str) -> rusqlite::Result<Option<Project>> {
    conn.query_row(
        &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
        [id],
        row_to_project,
    )
    .optional()
}

pub fn list_projects_sync(conn: &Connection, only_active: bool) -> rusqlite::Result<Vec<Project>> {
    let sql = if only_active {
        format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE is_active = 1 ORDER BY id")
    } else {
        format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id")
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_project)?;
    rows.collect()
}

/// Soft-deactivate a project (never touches the row's data).
pub fn deactivate_project_sync(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE projects SET is_active = 0, updated_at = ?2 WHERE id = ?1",
        params![id, Utc::now()],
    )?;
    Ok(changed > 0)
}

/// Hard delete. Callers are responsible for the default-project guard.
pub fn delete_project_sync(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute("DELETE FROM projects WHERE id = ?1", [id])?;
    Ok(changed > 0)
}

/// Conversation / memory-unit counts for a project.
pub fn project_statistics_sync(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<(i64, i64)> {
    let conversations: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversations WHERE project_id = ?1",
        [id],
        |row| row.get(0),
    )?;
    let memory_units: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memory_units WHERE project_id = ?1 AND is_active = 1",
        [id],
        |row| row.get(0),
    )?;
    Ok((conversations, memory_units))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("PRAGMA foreign_keys=ON").unwrap();
        run_migrations(&conn).expect("migrate");
        conn
    }

    fn sample_project(id: &str) -> Project {
        let now = Utc::now();
        Project {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
            settings: serde_json::json!({}),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let conn = test_conn();
        upsert_project_sync(&conn, &sample_project("default")).unwrap();
        let got = get_project_sync(&conn, "default").unwrap().unwrap();
        assert_eq!(got.id, "default");
        assert!(got.is_active);
        assert!(get_project_sync(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let conn = test_conn();
        let mut project = sample_project("p");
        upsert_project_sync(&conn, &project).unwrap();
        project.name = "renamed".to_string();
        upsert_project_sync(&conn, &project).unwrap();
        let got = get_project_sync(&conn, "p").unwrap().unwrap();
        assert_eq!(got.name, "renamed");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM projects", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_deactivate_hides_from_active_list() {
        let conn = test_conn();
        upsert_project_sync(&conn, &sample_project("a")).unwrap();
        upsert_project_sync(&conn, &sample_project("b")).unwrap();
        assert!(deactivate_project_sync(&conn, "b").unwrap());

        let active = list_projects_sync(&conn, true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");

        let all = list_projects_sync(&conn, false).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_statistics_empty_project() {
        let conn = test_conn();
        upsert_project_sync(&conn, &sample_project("p")).unwrap();
        assert_eq!(project_statistics_sync(&conn, "p").unwrap(), (0, 0));
    }
}
