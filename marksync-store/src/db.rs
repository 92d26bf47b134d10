//! Pool setup and schema migrations.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tokio::sync::Mutex;
use tracing::info;

use marksync_core::config::StorageConfig;
use marksync_core::{KindClasses, ProjectId};

use crate::error::{io_err, StoreError};

/// Current schema version - increment when adding migrations.
pub(crate) const SCHEMA_VERSION: i64 = 1;

/// Handle to the change log database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) classes: Arc<KindClasses>,
    project_locks: Arc<StdMutex<HashMap<ProjectId, Arc<Mutex<()>>>>>,
}

impl Store {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(
        path: &Path,
        config: &StorageConfig,
        classes: KindClasses,
    ) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        info!(path = %path.display(), "opening change log database");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .connect_with(options)
            .await?;

        run_migrations(&pool).await?;
        Ok(Self::from_pool(pool, classes))
    }

    /// Fresh private in-memory database with all migrations applied.
    pub async fn in_memory(classes: KindClasses) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // One connection: every `sqlite::memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        run_migrations(&pool).await?;
        Ok(Self::from_pool(pool, classes))
    }

    fn from_pool(pool: SqlitePool, classes: KindClasses) -> Self {
        Self {
            pool,
            classes: Arc::new(classes),
            project_locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn kind_classes(&self) -> &KindClasses {
        &self.classes
    }

    /// Per-project write lock; unrelated projects never wait on each other.
    pub(crate) fn project_lock(&self, project: ProjectId) -> Arc<Mutex<()>> {
        let mut locks = self
            .project_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(project).or_default().clone()
    }

    pub(crate) fn forget_project_lock(&self, project: ProjectId) {
        let mut locks = self
            .project_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.remove(&project);
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: current_version,
            supported: SCHEMA_VERSION,
        });
    }
    if current_version == SCHEMA_VERSION {
        return Ok(());
    }

    info!(
        from = current_version,
        to = SCHEMA_VERSION,
        "migrating change log schema"
    );

    let mut tx = pool.begin().await?;

    // AUTOINCREMENT: a dropped project's id is never handed out again.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            next_change_id INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS changes (
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            id INTEGER NOT NULL,
            user_name TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            address INTEGER NOT NULL,
            kind INTEGER NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (project_id, id)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_changes_address ON changes(project_id, address, kind)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cursors (
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            user_name TEXT NOT NULL,
            last_change_id INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (project_id, user_name)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            name TEXT PRIMARY KEY,
            password_hash TEXT NOT NULL,
            real_name TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO schema_version (version, description) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind("projects, changes, cursors, users")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!("change log schema migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_migrations_idempotent() {
        let store = Store::in_memory(KindClasses::default()).await.unwrap();
        run_migrations(&store.pool).await.unwrap();
        run_migrations(&store.pool).await.unwrap();
    }

    #[tokio::test]
    async fn schema_version_recorded() {
        let store = Store::in_memory(KindClasses::default()).await.unwrap();
        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn newer_schema_is_refused() {
        let store = Store::in_memory(KindClasses::default()).await.unwrap();
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION + 1)
            .execute(&store.pool)
            .await
            .unwrap();
        let err = run_migrations(&store.pool).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaTooNew { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn file_database_is_created_with_parent_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("marksync.db");
        let store = Store::open(&path, &StorageConfig::default(), KindClasses::default())
            .await
            .unwrap();
        assert!(path.exists());
        store.close().await;
    }
}
