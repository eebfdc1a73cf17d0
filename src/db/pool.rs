// src/db/pool.rs
// Async connection pool using deadpool-sqlite
//
// Handlers should reach for `pool.run()` (errors arrive as MemoryError);
// internal helpers and migrations use `pool.interact()` (anyhow). Either
// way the closure executes on a blocking thread, never on the runtime.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, HookError, Object, Pool, Runtime};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;

use crate::error::{MemoryError, is_sqlite_contention};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// One-shot process-wide installation of the sqlite-vec extension.
/// Must happen before the first connection opens.
static VEC_EXTENSION: OnceLock<()> = OnceLock::new();

#[allow(clippy::missing_transmute_annotations)]
pub(crate) fn register_vec_extension() {
    VEC_EXTENSION.get_or_init(|| {
        // SAFETY: sqlite3_auto_extension wants an Option<extern "C" fn()>;
        // sqlite3_vec_init is a statically linked symbol with the init
        // signature SQLite expects, so the transmuted pointer stays valid
        // for the whole process.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        }
        tracing::debug!("sqlite-vec auto-extension installed");
    });
}

/// How many times a contended statement is retried before giving up.
const CONTENTION_RETRIES: usize = 3;
/// First retry delay; each subsequent retry waits 4x longer, capped.
const CONTENTION_BASE_DELAY: Duration = Duration::from_millis(100);
const CONTENTION_MAX_DELAY: Duration = Duration::from_secs(2);

fn mem_error_is_contention(err: &MemoryError) -> bool {
    matches!(err, MemoryError::Db(db) if is_sqlite_contention(db))
}

/// Walk an anyhow chain looking for a SQLITE_BUSY / SQLITE_LOCKED cause,
/// whether it surfaced as a bare rusqlite error or wrapped in MemoryError.
fn chain_has_contention(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(db) = cause.downcast_ref::<rusqlite::Error>() {
            return is_sqlite_contention(db);
        }
        cause
            .downcast_ref::<MemoryError>()
            .is_some_and(mem_error_is_contention)
    })
}

/// Retry an operation on contention with multiplicative backoff
/// (100ms, 400ms, 1600ms). Any other error returns immediately.
async fn with_contention_retry<F, Fut, R, E>(
    mut op: F,
    is_contention: impl Fn(&E) -> bool,
) -> std::result::Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<R, E>>,
    E: std::fmt::Display,
{
    let mut delay = CONTENTION_BASE_DELAY;
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < CONTENTION_RETRIES && is_contention(&e) => {
                attempt += 1;
                tracing::warn!(
                    attempt,
                    max = CONTENTION_RETRIES,
                    ?delay,
                    "SQLite contention, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(4).min(CONTENTION_MAX_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Which schema a pool installs on open.
enum DbKind {
    /// Main relational store: projects, conversations, messages,
    /// memory_units, embeddings, cost_tracking.
    Main,
    /// Vector store file: the VectorStore owns its own DDL
    /// (collection tables appear via ensure_collection).
    Vector,
}

enum DbStorage {
    File(PathBuf),
    InMemory { label: &'static str },
}

/// Database pool wrapper with sqlite-vec support and per-connection setup.
pub struct DatabasePool {
    pool: Pool,
    path: Option<PathBuf>,
    /// URI for in-memory databases (shared state across pool connections)
    memory_uri: Option<String>,
}

impl DatabasePool {
    /// Open the main relational store at the given path.
    pub async fn open(path: &Path, max_size: usize) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf()), DbKind::Main, max_size).await
    }

    /// Open the vector store file (collection DDL is owned by VectorStore).
    pub async fn open_vector(path: &Path, max_size: usize) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf()), DbKind::Vector, max_size).await
    }

    /// Open a pooled in-memory main store (tests).
    ///
    /// Uses a shared-cache URI so all pool connections see the same data.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_internal(DbStorage::InMemory { label: "memdb" }, DbKind::Main, 8).await
    }

    /// Open a pooled in-memory vector store (tests).
    pub async fn open_vector_in_memory() -> Result<Self> {
        Self::open_internal(DbStorage::InMemory { label: "memvec" }, DbKind::Vector, 8).await
    }

    async fn open_internal(storage: DbStorage, kind: DbKind, max_size: usize) -> Result<Self> {
        register_vec_extension();

        let (conn_str, file_path) = match &storage {
            DbStorage::File(p) => {
                prepare_database_path(p)?;
                (p.to_string_lossy().into_owned(), Some(p.clone()))
            }
            DbStorage::InMemory { label } => (
                format!(
                    "file:{label}_{}?mode=memory&cache=shared",
                    uuid::Uuid::new_v4().simple()
                ),
                None,
            ),
        };
        let memory_uri = file_path.is_none().then(|| conn_str.clone());

        let pool = Config::new(&conn_str)
            .builder(Runtime::Tokio1)
            .context("Failed to create pool builder")?
            .max_size(max_size.max(1))
            .post_create(connection_init_hook(file_path.clone()))
            .build()
            .context("Failed to build connection pool")?;

        let db_pool = Self {
            pool,
            path: file_path,
            memory_uri,
        };

        if matches!(kind, DbKind::Main) {
            db_pool
                .interact(|conn| {
                    super::schema::run_migrations(conn)?;
                    Ok(())
                })
                .await?;
        }

        Ok(db_pool)
    }

    /// Get the memory URI (for sharing state in tests)
    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn checkout(&self) -> std::result::Result<Object, MemoryError> {
        self.pool
            .get()
            .await
            .map_err(|e| MemoryError::ResourceExhausted(format!("connection checkout: {e}")))
    }

    /// Run a closure with a pooled connection, returning anyhow::Result.
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.checkout().await?;
        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("connection task failed: {e}"))?
    }

    /// Run a closure with a pooled connection, converting errors to
    /// MemoryError. Preferred for tool and API handlers.
    pub async fn run<F, R, E>(&self, f: F) -> std::result::Result<R, MemoryError>
    where
        F: FnOnce(&Connection) -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<MemoryError> + Send + 'static,
    {
        let conn = self.checkout().await?;
        conn.interact(move |conn| f(conn).map_err(Into::into))
            .await
            .map_err(|e| MemoryError::Other(format!("connection task failed: {e}")))?
    }

    /// Like [`run`](Self::run) with retry on SQLite contention.
    /// Use for critical writes that must not be lost. The closure must be
    /// `Clone` to support retries.
    pub async fn run_with_retry<F, R, E>(&self, f: F) -> std::result::Result<R, MemoryError>
    where
        F: FnOnce(&Connection) -> std::result::Result<R, E> + Send + Clone + 'static,
        R: Send + 'static,
        E: Into<MemoryError> + Send + 'static,
    {
        with_contention_retry(|| self.run(f.clone()), mem_error_is_contention).await
    }

    /// Like [`interact`](Self::interact) with retry on SQLite contention.
    pub async fn interact_with_retry<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + Clone + 'static,
        R: Send + 'static,
    {
        with_contention_retry(|| self.interact(f.clone()), chain_has_contention).await
    }

    /// Get pool status for monitoring.
    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    /// Cheap liveness probe.
    pub async fn ping(&self) -> bool {
        self.interact(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(Into::into)
        })
        .await
        .is_ok()
    }
}

/// Pool status snapshot for monitoring.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Create the parent directory of a database file, keeping it private.
fn prepare_database_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        restrict_file_mode(parent, 0o700);
    }
    Ok(())
}

/// Restrict filesystem permissions on Unix; no-op elsewhere.
#[cfg(unix)]
fn restrict_file_mode(path: &Path, mode: u32) {
    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mut perms = metadata.permissions();
    perms.set_mode(mode);
    if let Err(e) = std::fs::set_permissions(path, perms) {
        tracing::warn!(path = %path.display(), "Failed to restrict permissions: {e}");
    }
}

#[cfg(not(unix))]
fn restrict_file_mode(_path: &Path, _mode: u32) {}

/// Apply per-connection PRAGMAs. File-backed connections get WAL plus a
/// relaxed sync mode; in-memory connections only need FK enforcement and
/// the busy timeout (WAL does not apply to them).
fn init_connection(conn: &Connection, file: Option<&Path>) -> rusqlite::Result<()> {
    let mut pragmas = String::from(
        "PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000;",
    );
    if file.is_some() {
        pragmas.push_str(
            " PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             PRAGMA journal_size_limit=32768;",
        );
    }
    conn.execute_batch(&pragmas)?;

    if let Some(path) = file {
        restrict_file_mode(path, 0o600);
    }
    Ok(())
}

/// Single post_create hook for both storage flavors: runs the PRAGMA
/// setup and, for file-backed databases, locks down the file mode.
fn connection_init_hook(file: Option<PathBuf>) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let file = file.clone();
        Box::pin(async move {
            conn.interact(move |conn| init_connection(conn, file.as_deref()))
                .await
                .map_err(|e| HookError::Message(format!("hook interact failed: {e}").into()))?
                .map_err(|e| HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_in_memory_shares_state() {
        let pool = DatabasePool::open_in_memory()
            .await
            .expect("Failed to open in-memory pool");

        pool.interact(|conn| {
            conn.execute(
                "INSERT INTO projects (id, name, created_at, updated_at)
                 VALUES ('p1', 'test', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .await
        .expect("insert failed");

        // A different pooled connection must see the row (shared cache)
        let name: String = pool
            .interact(|conn| {
                conn.query_row("SELECT name FROM projects WHERE id = 'p1'", [], |row| {
                    row.get(0)
                })
                .map_err(Into::into)
            })
            .await
            .expect("query failed");
        assert_eq!(name, "test");
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let pool = DatabasePool::open_in_memory().await.expect("open");
        let result = pool
            .interact(|conn| {
                conn.execute(
                    "INSERT INTO conversations (id, project_id, started_at, created_at, updated_at)
                     VALUES ('c1', 'missing-project', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(result.is_err(), "FK violation should surface");
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let pool = std::sync::Arc::new(DatabasePool::open_in_memory().await.expect("open"));

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.interact_with_retry(move |conn| {
                    conn.execute(
                        "INSERT INTO projects (id, name, created_at, updated_at)
                         VALUES (?1, ?2, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                        rusqlite::params![format!("p{i}"), format!("project-{i}")],
                    )?;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().expect("concurrent insert failed");
        }

        let count: i64 = pool
            .interact(|conn| {
                conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .expect("count failed");
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn test_run_converts_errors() {
        let pool = DatabasePool::open_in_memory().await.expect("open");
        let result: std::result::Result<(), MemoryError> = pool
            .run(|conn| {
                conn.execute("INSERT INTO nonexistent VALUES (1)", [])?;
                Ok::<_, rusqlite::Error>(())
            })
            .await;
        assert!(matches!(result, Err(MemoryError::Db(_))));
    }

    #[tokio::test]
    async fn test_non_contention_error_fails_fast() {
        let pool = DatabasePool::open_in_memory().await.expect("open");
        // A schema error must not be retried; run_with_retry should return
        // it on the first attempt
        let result = pool
            .run_with_retry(|conn| {
                conn.execute("INSERT INTO nonexistent VALUES (1)", [])?;
                Ok::<_, rusqlite::Error>(())
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ping() {
        let pool = DatabasePool::open_in_memory().await.expect("open");
        assert!(pool.ping().await);
    }

    #[tokio::test]
    async fn test_vector_pool_has_no_main_schema() {
        let pool = DatabasePool::open_vector_in_memory().await.expect("open");
        let exists: bool = pool
            .interact(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM sqlite_master WHERE type='table' AND name='projects'",
                        [],
                        |_| Ok(true),
                    )
                    .unwrap_or(false))
            })
            .await
            .expect("query");
        assert!(!exists);
    }

    // ------------------------------------------------------------------
    // Contention classification
    // ------------------------------------------------------------------

    fn busy_error() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        )
    }

    #[test]
    fn test_mem_error_contention_classification() {
        assert!(mem_error_is_contention(&MemoryError::Db(busy_error())));
        assert!(!mem_error_is_contention(&MemoryError::Other(
            "database is locked".to_string()
        )));
    }

    #[test]
    fn test_chain_detects_wrapped_contention() {
        let direct: anyhow::Error = busy_error().into();
        assert!(chain_has_contention(&direct));

        let wrapped: anyhow::Error = MemoryError::Db(busy_error()).into();
        assert!(chain_has_contention(&wrapped));

        let nested = wrapped.context("while storing memory unit");
        assert!(chain_has_contention(&nested));

        // Message text alone never counts as contention
        let text_only = anyhow::anyhow!("database is locked");
        assert!(!chain_has_contention(&text_only));
    }

    #[tokio::test]
    async fn test_retry_helper_gives_up_after_budget() {
        let mut calls = 0usize;
        let result: std::result::Result<(), MemoryError> = with_contention_retry(
            || {
                calls += 1;
                async { Err(MemoryError::Db(busy_error())) }
            },
            mem_error_is_contention,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, CONTENTION_RETRIES + 1);
    }
}
