//! SQLite cache entry store
//!
//! One row per fingerprint. Entries are superseded, never edited: a
//! re-execution after an invalidated hit overwrites the row wholesale.

use crate::error::EngineError;
use crate::runtime::invocation::verify_outputs;
use crate::runtime::resolve::SlotMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

/// Outputs recorded for a successful execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub template: String,
    pub outputs: SlotMap,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether every recorded output still exists and is non-empty
    pub async fn is_valid(&self) -> bool {
        verify_outputs(&self.outputs).await.is_ok()
    }
}

/// Cache entry store backed by a SQLite pool
#[derive(Debug, Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    /// Open (creating if needed) the cache database at `path`
    pub async fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!("🗄️ Cache store ready: {}", path.display());
        Ok(store)
    }

    /// Private in-memory store for throwaway runs and tests
    pub async fn in_memory() -> Result<Self, EngineError> {
        // every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                fingerprint TEXT PRIMARY KEY,
                template TEXT NOT NULL,
                outputs JSON NOT NULL,
                run_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_cache_entries_template
            ON cache_entries(template)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Entry recorded for a fingerprint, if any
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<CacheEntry>, EngineError> {
        let row = sqlx::query(
            "SELECT fingerprint, template, outputs, run_id, created_at FROM cache_entries WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let outputs_json: String = row.try_get("outputs")?;
        let created_ms: i64 = row.try_get("created_at")?;
        Ok(Some(CacheEntry {
            fingerprint: row.try_get("fingerprint")?,
            template: row.try_get("template")?,
            outputs: serde_json::from_str(&outputs_json)?,
            run_id: row.try_get("run_id")?,
            created_at: DateTime::from_timestamp_millis(created_ms).unwrap_or_default(),
        }))
    }

    /// Insert an entry, superseding any previous one for the fingerprint
    pub async fn insert(&self, entry: &CacheEntry) -> Result<(), EngineError> {
        let outputs_json = serde_json::to_string(&entry.outputs)?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (fingerprint, template, outputs, run_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                template = excluded.template,
                outputs = excluded.outputs,
                run_id = excluded.run_id,
                created_at = excluded.created_at
            "#,
        )
        .bind(&entry.fingerprint)
        .bind(&entry.template)
        .bind(&outputs_json)
        .bind(&entry.run_id)
        .bind(entry.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        tracing::debug!("💾 Cached {} outputs under {}", entry.template, &entry.fingerprint[..12.min(entry.fingerprint.len())]);
        Ok(())
    }

    /// Number of stored entries
    pub async fn count(&self) -> Result<i64, EngineError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::SlotValue;

    fn entry(fingerprint: &str, output: &Path) -> CacheEntry {
        CacheEntry {
            fingerprint: fingerprint.into(),
            template: "combine".into(),
            outputs: SlotMap::from([("mesh".to_string(), SlotValue::File(output.to_path_buf()))]),
            run_id: "run-1".into(),
            created_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = CacheStore::in_memory().await.unwrap();
        let stored = entry("abc", Path::new("/w/s1/combine/bh.stl"));
        store.insert(&stored).await.unwrap();

        assert_eq!(store.lookup("abc").await.unwrap(), Some(stored));
        assert_eq!(store.lookup("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_supersedes_existing_entry() {
        let store = CacheStore::in_memory().await.unwrap();
        store.insert(&entry("abc", Path::new("/old"))).await.unwrap();
        let mut newer = entry("abc", Path::new("/new"));
        newer.run_id = "run-2".into();
        store.insert(&newer).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.lookup("abc").await.unwrap().unwrap().run_id, "run-2");
    }

    #[tokio::test]
    async fn test_file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested/cache.db");
        {
            let store = CacheStore::open(&db).await.unwrap();
            store.insert(&entry("abc", Path::new("/x"))).await.unwrap();
        }
        let reopened = CacheStore::open(&db).await.unwrap();
        assert!(reopened.lookup("abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_entry_validity_follows_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = dir.path().join("bh.stl");
        let cached = entry("abc", &mesh);
        assert!(!cached.is_valid().await);

        tokio::fs::write(&mesh, b"solid bh").await.unwrap();
        assert!(cached.is_valid().await);
    }
}
