//! Dataset registry
//!
//! Shared table of datasets present under the dataset root. Every operation
//! is a single atomic SQL statement so that workers in different processes
//! never act on a value another worker changed in between.

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to prepare registry location: {0}")]
    Io(#[from] std::io::Error),
}

/// One row of the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetEntry {
    /// Never reused: a row deleted and inserted again gets a new generation
    pub generation: i64,
    pub name: String,
    pub local_path: PathBuf,
    pub persist: bool,
    pub ready: bool,
    pub refcount: i64,
}

/// What the caller must do after giving back a reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other holders remain, or the entry is persisted
    Retained { refcount: i64 },
    /// Last reference gone; the row was deleted and the directory must go
    Remove(PathBuf),
    /// No counted reference existed for this name
    NotHeld,
}

/// Atomic operations the dataset cache relies on
#[async_trait]
pub trait DatasetRegistry: Send + Sync {
    /// Inserts `{ready: 0, refcount: 1}` unless a row exists; `true` if inserted
    async fn insert_if_absent(
        &self,
        name: &str,
        local_path: &Path,
        persist: bool,
    ) -> Result<bool, RegistryError>;

    /// Flips `ready` from 0 to 1; `false` if the row is gone or already ready
    async fn mark_ready(&self, name: &str) -> Result<bool, RegistryError>;

    /// Adds one reference and returns the generation of the row it was
    /// counted on; `None` if the row is gone
    async fn increment(&self, name: &str) -> Result<Option<i64>, RegistryError>;

    /// Drops one reference and deletes the row once it was the last one
    async fn release(&self, name: &str) -> Result<ReleaseOutcome, RegistryError>;

    /// Deletes the row regardless of its counters
    async fn remove(&self, name: &str) -> Result<(), RegistryError>;

    async fn get(&self, name: &str) -> Result<Option<DatasetEntry>, RegistryError>;
}

/// Registry stored in a SQLite file next to the datasets
#[derive(Debug, Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Opens (creating if needed) the registry file and its schema
    pub async fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let registry = Self { pool };
        registry.run_migrations().await?;

        info!("Dataset registry opened at {}", path.display());
        Ok(registry)
    }

    async fn run_migrations(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS datasets (
                generation INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                local_path TEXT NOT NULL,
                persist INTEGER NOT NULL DEFAULT 0,
                ready INTEGER NOT NULL DEFAULT 0,
                refcount INTEGER NOT NULL DEFAULT 0 CHECK (refcount >= 0),
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DatasetRegistry for SqliteRegistry {
    async fn insert_if_absent(
        &self,
        name: &str,
        local_path: &Path,
        persist: bool,
    ) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO datasets (name, local_path, persist, ready, refcount, created_at)
            VALUES (?1, ?2, ?3, 0, 1, ?4)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(local_path.to_string_lossy().into_owned())
        .bind(persist)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_ready(&self, name: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query("UPDATE datasets SET ready = 1 WHERE name = ?1 AND ready = 0")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment(&self, name: &str) -> Result<Option<i64>, RegistryError> {
        let generation = sqlx::query_scalar::<_, i64>(
            "UPDATE datasets SET refcount = refcount + 1 WHERE name = ?1 RETURNING generation",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(generation)
    }

    async fn release(&self, name: &str) -> Result<ReleaseOutcome, RegistryError> {
        let decremented = sqlx::query_as::<_, (i64, i64)>(
            r#"
            UPDATE datasets SET refcount = refcount - 1
            WHERE name = ?1 AND refcount > 0
            RETURNING refcount, persist
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some((refcount, persist)) = decremented else {
            return Ok(ReleaseOutcome::NotHeld);
        };
        let persist = persist != 0;

        if refcount > 0 || persist {
            debug!("Dataset {} retained (refcount={}, persist={})", name, refcount, persist);
            return Ok(ReleaseOutcome::Retained { refcount });
        }

        // A waiter may have taken a reference since the decrement.
        let deleted = sqlx::query_scalar::<_, String>(
            r#"
            DELETE FROM datasets
            WHERE name = ?1 AND refcount = 0 AND persist = 0
            RETURNING local_path
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match deleted {
            Some(path) => ReleaseOutcome::Remove(PathBuf::from(path)),
            None => ReleaseOutcome::Retained { refcount: 0 },
        })
    }

    async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM datasets WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<DatasetEntry>, RegistryError> {
        let row = sqlx::query_as::<_, DatasetRow>(
            r#"
            SELECT generation, name, local_path, persist, ready, refcount
            FROM datasets
            WHERE name = ?1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct DatasetRow {
    generation: i64,
    name: String,
    local_path: String,
    persist: i64,
    ready: i64,
    refcount: i64,
}

impl From<DatasetRow> for DatasetEntry {
    fn from(row: DatasetRow) -> Self {
        DatasetEntry {
            generation: row.generation,
            name: row.name,
            local_path: PathBuf::from(row.local_path),
            persist: row.persist != 0,
            ready: row.ready != 0,
            refcount: row.refcount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqliteRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SqliteRegistry::open(&dir.path().join("registry.db"))
            .await
            .unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn test_insert_if_absent_only_once() {
        let (_dir, registry) = open_temp().await;
        let path = Path::new("/data/mnist");

        assert!(registry.insert_if_absent("mnist", path, false).await.unwrap());
        assert!(!registry.insert_if_absent("mnist", path, true).await.unwrap());

        let entry = registry.get("mnist").await.unwrap().unwrap();
        assert_eq!(entry.refcount, 1);
        assert!(!entry.ready);
        assert!(!entry.persist);
        assert_eq!(entry.local_path, PathBuf::from("/data/mnist"));
    }

    #[tokio::test]
    async fn test_mark_ready_is_compare_and_set() {
        let (_dir, registry) = open_temp().await;
        registry
            .insert_if_absent("mnist", Path::new("/data/mnist"), false)
            .await
            .unwrap();

        assert!(registry.mark_ready("mnist").await.unwrap());
        assert!(!registry.mark_ready("mnist").await.unwrap());
        assert!(!registry.mark_ready("cifar").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_deletes_on_last_reference() {
        let (_dir, registry) = open_temp().await;
        registry
            .insert_if_absent("mnist", Path::new("/data/mnist"), false)
            .await
            .unwrap();
        assert!(registry.increment("mnist").await.unwrap().is_some());

        assert_eq!(
            registry.release("mnist").await.unwrap(),
            ReleaseOutcome::Retained { refcount: 1 }
        );
        assert_eq!(
            registry.release("mnist").await.unwrap(),
            ReleaseOutcome::Remove(PathBuf::from("/data/mnist"))
        );
        assert!(registry.get("mnist").await.unwrap().is_none());
        assert_eq!(registry.release("mnist").await.unwrap(), ReleaseOutcome::NotHeld);
        assert!(registry.increment("mnist").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_keeps_persisted_entry() {
        let (_dir, registry) = open_temp().await;
        registry
            .insert_if_absent("imagenet", Path::new("/data/imagenet"), true)
            .await
            .unwrap();

        assert_eq!(
            registry.release("imagenet").await.unwrap(),
            ReleaseOutcome::Retained { refcount: 0 }
        );
        let entry = registry.get("imagenet").await.unwrap().unwrap();
        assert_eq!(entry.refcount, 0);
        assert_eq!(registry.release("imagenet").await.unwrap(), ReleaseOutcome::NotHeld);
    }

    #[tokio::test]
    async fn test_recreated_row_gets_new_generation() {
        let (_dir, registry) = open_temp().await;
        let path = Path::new("/data/mnist");

        registry.insert_if_absent("mnist", path, false).await.unwrap();
        let first = registry.increment("mnist").await.unwrap().unwrap();
        assert_eq!(registry.get("mnist").await.unwrap().unwrap().generation, first);

        registry.remove("mnist").await.unwrap();
        registry.insert_if_absent("mnist", path, false).await.unwrap();

        let second = registry.get("mnist").await.unwrap().unwrap().generation;
        assert_ne!(first, second);
        assert_eq!(registry.increment("mnist").await.unwrap(), Some(second));
    }
}
