//! SQLite-backed feature store.
//!
//! Source of truth for computed features. One row per (user_id,
//! feature_name); batches land in a single transaction so a failed flush
//! leaves no partial state. The `raw_events` history table is only ever read
//! here, as the cold fallback for the windowed counters.

use crate::types::FeatureRecord;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Database(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable feature persistence plus the historical count used when the
/// activity cache misses.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Upsert every feature row of the given records under one transaction.
    async fn upsert_features(&self, records: &[FeatureRecord]) -> Result<(), StoreError>;

    /// Count raw events for `user_id` with `timestamp > now - window_seconds`.
    async fn count_recent_events(
        &self,
        user_id: &str,
        window_seconds: i64,
        now: i64,
    ) -> Result<i64, StoreError>;
}

/// Run schema migrations from SQL files.
///
/// Reads every `.sql` file in the directory in name order and executes it.
/// Files must use `IF NOT EXISTS` clauses so reruns are idempotent.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::Database(format!(
            "schema directory not found: {}",
            schema_dir
        )));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    for entry in sql_files {
        let path = entry.path();
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
        log::debug!("applied schema file: {}", path.display());
    }

    Ok(())
}

const UPSERT_FEATURE_SQL: &str = r#"
INSERT INTO features (
    user_id, feature_name, feature_value, computed_at, feature_version, ab_variant
) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(user_id, feature_name) DO UPDATE SET
    feature_value = excluded.feature_value,
    computed_at = excluded.computed_at,
    feature_version = excluded.feature_version,
    ab_variant = excluded.ab_variant
"#;

/// One stored feature row, shaped for the read API's per-user lookup.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRow {
    pub feature_name: String,
    pub feature_value: f64,
    pub computed_at: String,
    pub feature_version: String,
    pub ab_variant: String,
}

pub struct SqliteFeatureStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFeatureStore {
    /// Open (or create) the store and bring the schema up to date.
    pub fn open(db_path: &str, schema_dir: &str) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn, schema_dir)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one event to the raw history table. The pipeline itself never
    /// calls this; it exists for the ingestion side and for backfilling
    /// counter state in tests.
    pub fn insert_raw_event(
        &self,
        user_id: &str,
        event_type: &str,
        timestamp: i64,
        payload: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO raw_events (user_id, event_type, timestamp, payload) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, event_type, timestamp, payload],
        )?;
        Ok(())
    }

    /// Latest feature set for one user, the query backing
    /// `GET /features/{user_id}`.
    pub fn load_user_features(&self, user_id: &str) -> Result<Vec<FeatureRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT feature_name, feature_value, computed_at, feature_version, ab_variant
             FROM features WHERE user_id = ?1 ORDER BY feature_name",
        )?;

        let rows = stmt
            .query_map([user_id], |row| {
                Ok(FeatureRow {
                    feature_name: row.get(0)?,
                    feature_value: row.get(1)?,
                    computed_at: row.get(2)?,
                    feature_version: row.get(3)?,
                    ab_variant: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

#[async_trait]
impl FeatureStore for SqliteFeatureStore {
    async fn upsert_features(&self, records: &[FeatureRecord]) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_FEATURE_SQL)?;
            for record in records {
                for (name, value) in &record.features {
                    stmt.execute(params![
                        record.user_id,
                        name,
                        value.as_f64(),
                        record.computed_at,
                        record.feature_version,
                        record.ab_variant,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn count_recent_events(
        &self,
        user_id: &str,
        window_seconds: i64,
        now: i64,
    ) -> Result<i64, StoreError> {
        let cutoff = now - window_seconds;
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM raw_events WHERE user_id = ?1 AND timestamp > ?2",
            params![user_id, cutoff],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Store double whose every operation fails, for degradation paths.
    pub struct FailingStore;

    #[async_trait]
    impl FeatureStore for FailingStore {
        async fn upsert_features(&self, _records: &[FeatureRecord]) -> Result<(), StoreError> {
            Err(StoreError::Database("injected store failure".to_string()))
        }

        async fn count_recent_events(
            &self,
            _user_id: &str,
            _window_seconds: i64,
            _now: i64,
        ) -> Result<i64, StoreError> {
            Err(StoreError::Database("injected store failure".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureValue;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn open_test_store() -> (tempfile::TempDir, SqliteFeatureStore) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("features.db");
        let store = SqliteFeatureStore::open(db_path.to_str().unwrap(), "sql").unwrap();
        (dir, store)
    }

    fn make_record(user_id: &str, computed_at: &str, features: &[(&str, f64)]) -> FeatureRecord {
        let mut map = BTreeMap::new();
        for (name, value) in features {
            map.insert(name.to_string(), FeatureValue::Float(*value));
        }
        FeatureRecord {
            user_id: user_id.to_string(),
            event_type: "view".to_string(),
            timestamp: computed_at.to_string(),
            computed_at: computed_at.to_string(),
            feature_version: "v2".to_string(),
            ab_variant: "A".to_string(),
            features: map,
            raw_event: json!({"user_id": user_id}),
        }
    }

    #[tokio::test]
    async fn test_upsert_inserts_rows() {
        let (_dir, store) = open_test_store();

        let record = make_record("u1", "t0", &[("activity_count_1h", 3.0), ("is_new_user", 1.0)]);
        store.upsert_features(&[record]).await.unwrap();

        let rows = store.load_user_features("u1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].feature_name, "activity_count_1h");
        assert_eq!(rows[0].feature_value, 3.0);
        assert_eq!(rows[0].feature_version, "v2");
    }

    #[tokio::test]
    async fn test_upsert_replaces_on_conflict() {
        let (_dir, store) = open_test_store();

        store
            .upsert_features(&[make_record("u1", "t0", &[("engagement_score", 20.0)])])
            .await
            .unwrap();
        store
            .upsert_features(&[make_record("u1", "t1", &[("engagement_score", 35.0)])])
            .await
            .unwrap();

        let rows = store.load_user_features("u1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].feature_value, 35.0);
        assert_eq!(rows[0].computed_at, "t1");
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let (_dir, store) = open_test_store();

        let record = make_record("u1", "t0", &[("engagement_score", 20.0)]);
        store.upsert_features(&[record.clone()]).await.unwrap();
        store.upsert_features(&[record.clone()]).await.unwrap();
        store.upsert_features(&[record]).await.unwrap();

        let rows = store.load_user_features("u1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].feature_value, 20.0);
    }

    #[tokio::test]
    async fn test_batch_upsert_multiple_users() {
        let (_dir, store) = open_test_store();

        let batch = vec![
            make_record("u1", "t0", &[("engagement_score", 10.0)]),
            make_record("u2", "t0", &[("engagement_score", 30.0)]),
            make_record("u3", "t0", &[("engagement_score", 50.0)]),
        ];
        store.upsert_features(&batch).await.unwrap();

        assert_eq!(store.load_user_features("u1").unwrap().len(), 1);
        assert_eq!(store.load_user_features("u2").unwrap()[0].feature_value, 30.0);
        assert_eq!(store.load_user_features("u3").unwrap()[0].feature_value, 50.0);
    }

    #[tokio::test]
    async fn test_count_recent_events_windows() {
        let (_dir, store) = open_test_store();
        let now = 1_700_000_000;

        store.insert_raw_event("u1", "view", now - 100, None).unwrap();
        store.insert_raw_event("u1", "view", now - 200, None).unwrap();
        store.insert_raw_event("u1", "view", now - 7_000, None).unwrap();
        store.insert_raw_event("u2", "view", now - 50, None).unwrap();

        // 1h window catches the two recent events for u1 only
        assert_eq!(store.count_recent_events("u1", 3_600, now).await.unwrap(), 2);
        // 6h window also catches the older one
        assert_eq!(store.count_recent_events("u1", 21_600, now).await.unwrap(), 3);
        // boundary is exclusive
        assert_eq!(store.count_recent_events("u1", 100, now).await.unwrap(), 0);
        assert_eq!(store.count_recent_events("u3", 3_600, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("features.db");
        let path = db_path.to_str().unwrap();

        let store = SqliteFeatureStore::open(path, "sql").unwrap();
        store
            .upsert_features(&[make_record("u1", "t0", &[("engagement_score", 20.0)])])
            .await
            .unwrap();
        drop(store);

        // Reopening reruns the migrations against the existing schema
        let store = SqliteFeatureStore::open(path, "sql").unwrap();
        assert_eq!(store.load_user_features("u1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_schema_dir_is_an_error() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("features.db");
        let result = SqliteFeatureStore::open(db_path.to_str().unwrap(), "no-such-dir");
        assert!(result.is_err());
    }
}
