//! SQLite key-value store.
//!
//! Features:
//! - WAL mode for concurrent readers
//! - Compare-and-swap as a single conditional `UPDATE ... WHERE version = ?`,
//!   so the version check and the write are one atomic statement
//! - Prefix listing ordered by key

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{RegistryError, Result};
use crate::store::{mismatch, validate_key, Entry, KvStore};

type Row = (String, Vec<u8>, i64, i64, i64);

/// SQLite implementation of KvStore.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a SQLite store at the given path with default pool settings.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &StoreConfig::default()).await
    }

    /// Open or create a SQLite store using the pool settings in `config`.
    pub async fn open_with(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite store at {:?}", path);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| RegistryError::StoreUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| RegistryError::StoreUnavailable(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RegistryError::StoreUnavailable(e.to_string()))?;

        // A memory database lives and dies with its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| RegistryError::StoreUnavailable(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY NOT NULL,
                value BLOB NOT NULL,
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    fn now_unix() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    fn unix_to_system_time(unix: i64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(unix.max(0) as u64)
    }

    fn row_to_entry((key, value, version, created_at, updated_at): Row) -> Entry {
        Entry {
            key,
            value,
            version: version as u64,
            created_at: Self::unix_to_system_time(created_at),
            updated_at: Self::unix_to_system_time(updated_at),
        }
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        validate_key(key)?;

        let row: Option<Row> = sqlx::query_as(
            "SELECT key, value, version, created_at, updated_at FROM kv_store WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Self::row_to_entry))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> Result<u64> {
        validate_key(key)?;
        let now = Self::now_unix();

        let affected = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO kv_store (key, value, version, created_at, updated_at)
                VALUES (?, ?, 1, ?, ?)
                ON CONFLICT(key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(&value)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE kv_store SET value = ?, version = version + 1, updated_at = ? WHERE key = ? AND version = ?",
            )
            .bind(&value)
            .bind(now)
            .bind(key)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            let found = self.version(key).await?;
            return Err(mismatch(key, expected_version, found));
        }

        Ok(expected_version + 1)
    }

    async fn delete(&self, key: &str, expected_version: u64) -> Result<()> {
        validate_key(key)?;

        let affected = sqlx::query("DELETE FROM kv_store WHERE key = ? AND version = ?")
            .bind(key)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected == 0 {
            let found = self.version(key).await?;
            return Err(mismatch(key, expected_version.max(1), found));
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<Entry>> {
        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT key, value, version, created_at, updated_at FROM kv_store
            WHERE substr(key, 1, length(?1)) = ?1
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Self::row_to_entry).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_create_and_get() {
        let store = SqliteStore::in_memory().await.unwrap();

        let version = store
            .compare_and_swap("nodes/n1", 0, b"value".to_vec())
            .await
            .unwrap();
        assert_eq!(version, 1);

        let entry = store.get("nodes/n1").await.unwrap().unwrap();
        assert_eq!(entry.key, "nodes/n1");
        assert_eq!(entry.value, b"value");
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_sqlite_compare_and_swap() {
        let store = SqliteStore::in_memory().await.unwrap();

        store.compare_and_swap("k", 0, b"v1".to_vec()).await.unwrap();
        let v2 = store.compare_and_swap("k", 1, b"v2".to_vec()).await.unwrap();
        assert_eq!(v2, 2);

        let result = store.compare_and_swap("k", 1, b"v3".to_vec()).await;
        assert!(matches!(
            result,
            Err(RegistryError::Conflict {
                expected: 1,
                found: 2,
                ..
            })
        ));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"v2");
    }

    #[tokio::test]
    async fn test_sqlite_create_existing() {
        let store = SqliteStore::in_memory().await.unwrap();

        store.compare_and_swap("k", 0, b"v1".to_vec()).await.unwrap();
        let result = store.compare_and_swap("k", 0, b"v2".to_vec()).await;
        assert!(matches!(result, Err(RegistryError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_sqlite_delete() {
        let store = SqliteStore::in_memory().await.unwrap();

        store.compare_and_swap("k", 0, b"v".to_vec()).await.unwrap();
        assert!(matches!(
            store.delete("k", 3).await,
            Err(RegistryError::Conflict { .. })
        ));
        store.delete("k", 1).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(matches!(
            store.delete("k", 1).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_list_prefix_literal() {
        let store = SqliteStore::in_memory().await.unwrap();

        store.compare_and_swap("pods/a_b/x", 0, b"1".to_vec()).await.unwrap();
        store.compare_and_swap("pods/aXb/y", 0, b"2".to_vec()).await.unwrap();
        store.compare_and_swap("nodes/n1", 0, b"3".to_vec()).await.unwrap();

        // `_` is matched literally, not as a LIKE wildcard
        let keys: Vec<String> = store
            .list_prefix("pods/a_b/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["pods/a_b/x"]);

        assert_eq!(store.list_prefix("pods/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.compare_and_swap("nodes/n1", 0, b"v".to_vec()).await.unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.version("nodes/n1").await.unwrap(), 1);
    }
}
