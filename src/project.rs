// src/project.rs
// Project record lifecycle and the default-project invariant

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::info;

use crate::db::{DatabasePool, Project, projects};
use crate::error::{MemoryError, Result};

/// Manages project scope records.
///
/// The default project always exists and can never be deleted or
/// deactivated. Other projects are created on first reference and
/// soft-deactivated rather than removed; hard deletion must be explicit.
pub struct ProjectManager {
    pool: Arc<DatabasePool>,
    default_project_id: String,
}

impl ProjectManager {
    pub fn new(pool: Arc<DatabasePool>, default_project_id: impl Into<String>) -> Self {
        Self {
            pool,
            default_project_id: default_project_id.into(),
        }
    }

    pub fn default_project_id(&self) -> &str {
        &self.default_project_id
    }

    /// Validate a caller-supplied project id: 1..=64 chars of
    /// [A-Za-z0-9._-].
    pub fn validate_project_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 64
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }

    /// Seed the default project if missing. Called once at startup.
    pub async fn ensure_default(&self) -> Result<Project> {
        self.get_or_create(&self.default_project_id.clone(), Some("Default project"))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Project>> {
        let id = id.to_string();
        self.pool
            .run(move |conn| projects::get_project_sync(conn, &id))
            .await
    }

    /// Fetch a project, creating it on first reference.
    pub async fn get_or_create(&self, id: &str, name: Option<&str>) -> Result<Project> {
        if !Self::validate_project_id(id) {
            return Err(MemoryError::Validation(format!(
                "invalid project id: {id:?}"
            )));
        }

        if let Some(existing) = self.get(id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let project = Project {
            id: id.to_string(),
            name: name.unwrap_or(id).to_string(),
            description: String::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
            settings: json!({}),
        };
        let stored = project.clone();
        self.pool
            .run(move |conn| projects::upsert_project_sync(conn, &stored))
            .await?;
        info!(project_id = %id, "Project created");
        Ok(project)
    }

    pub async fn list(&self, only_active: bool) -> Result<Vec<Project>> {
        self.pool
            .run(move |conn| projects::list_projects_sync(conn, only_active))
            .await
    }

    /// Update mutable fields of an existing project.
    pub async fn update(
        &self,
        id: &str,
        name: Option<String>,
        description: Option<String>,
        settings: Option<Value>,
    ) -> Result<Project> {
        let mut project = self
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("project {id}")))?;

        if let Some(name) = name {
            project.name = name;
        }
        if let Some(description) = description {
            project.description = description;
        }
        if let Some(settings) = settings {
            project.settings = settings;
        }
        project.updated_at = Utc::now();

        let stored = project.clone();
        self.pool
            .run(move |conn| projects::upsert_project_sync(conn, &stored))
            .await?;
        Ok(project)
    }

    /// Soft-deactivate a project. The default project cannot be touched.
    pub async fn deactivate(&self, id: &str) -> Result<bool> {
        if id == self.default_project_id {
            return Err(MemoryError::Validation(
                "the default project cannot be deactivated".to_string(),
            ));
        }
        let id = id.to_string();
        self.pool
            .run(move |conn| projects::deactivate_project_sync(conn, &id))
            .await
    }

    /// Hard delete, only on explicit request. The default project and any
    /// project that still owns conversations are protected.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        if id == self.default_project_id {
            return Err(MemoryError::Validation(
                "the default project cannot be deleted".to_string(),
            ));
        }

        let (conversations, memory_units) = self.statistics(id).await?;
        if conversations > 0 || memory_units > 0 {
            return Err(MemoryError::Validation(format!(
                "project {id} still owns {conversations} conversations and {memory_units} memory units"
            )));
        }

        let id = id.to_string();
        self.pool
            .run(move |conn| projects::delete_project_sync(conn, &id))
            .await
    }

    /// (conversation count, active memory-unit count)
    pub async fn statistics(&self, id: &str) -> Result<(i64, i64)> {
        let id = id.to_string();
        self.pool
            .run(move |conn| projects::project_statistics_sync(conn, &id))
            .await
    }
}
