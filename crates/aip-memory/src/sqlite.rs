//! SQLite-backed discovery store.

use crate::migration::run_migrations;
use aip_types::discovery::{DiscoveryStore, RecordFilter, ServerConfig, ServerRecord};
use aip_types::error::{AipError, AipResult};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Discovery store persisting records in a single SQLite table.
#[derive(Clone)]
pub struct SqliteDiscoveryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDiscoveryStore {
    /// Open (or create) the database at `path` and migrate it.
    pub fn open(path: &Path) -> AipResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(store_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(store_err)?;
        Self::from_connection(conn)
    }

    /// A fresh in-memory database.
    pub fn open_in_memory() -> AipResult<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn from_connection(conn: Connection) -> AipResult<Self> {
        run_migrations(&conn).map_err(|e| AipError::Store(format!("Migration failed: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> AipResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AipError::Internal(e.to_string()))
    }

    fn write(&self, record: &ServerRecord, insert: bool) -> AipResult<()> {
        let config = serde_json::to_string(&record.config)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let changed = if insert {
            conn.execute(
                "INSERT INTO server_records (name, description, config, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    record.name,
                    record.description,
                    config,
                    record.config.state.to_string(),
                    now
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    AipError::Store(format!("Record '{}' already exists", record.name))
                }
                other => store_err(other),
            })?
        } else {
            conn.execute(
                "UPDATE server_records SET description = ?2, config = ?3, state = ?4, updated_at = ?5
                 WHERE name = ?1",
                rusqlite::params![
                    record.name,
                    record.description,
                    config,
                    record.config.state.to_string(),
                    now
                ],
            )
            .map_err(store_err)?
        };
        if changed == 0 {
            return Err(AipError::Store(format!("No record named '{}'", record.name)));
        }
        debug!(name = %record.name, state = %record.config.state, "Stored server record");
        Ok(())
    }
}

fn store_err(e: rusqlite::Error) -> AipError {
    AipError::Store(e.to_string())
}

fn row_to_record(name: String, description: String, config: String) -> AipResult<ServerRecord> {
    let config: ServerConfig = serde_json::from_str(&config)
        .map_err(|e| AipError::Store(format!("Corrupt config for '{name}': {e}")))?;
    Ok(ServerRecord {
        name,
        description,
        config,
    })
}

#[async_trait]
impl DiscoveryStore for SqliteDiscoveryStore {
    async fn exists(&self, name: &str) -> AipResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM server_records WHERE name = ?1",
                rusqlite::params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    async fn add(&self, record: ServerRecord) -> AipResult<()> {
        self.write(&record, true)
    }

    async fn update(&self, record: ServerRecord) -> AipResult<()> {
        self.write(&record, false)
    }

    async fn get(&self, name: &str) -> AipResult<Option<ServerRecord>> {
        let row = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT name, description, config FROM server_records WHERE name = ?1",
                rusqlite::params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(store_err)?
        };
        row.map(|(n, d, c)| row_to_record(n, d, c)).transpose()
    }

    async fn query(&self, filter: &RecordFilter) -> AipResult<Vec<ServerRecord>> {
        // The state column narrows the scan; everything else is matched in Rust.
        let state = filter
            .metadata
            .get("state")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let rows: Vec<(String, String, String)> = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT name, description, config FROM server_records
                     WHERE (?1 IS NULL OR state = ?1) ORDER BY name",
                )
                .map_err(store_err)?;
            let mapped = stmt
                .query_map(rusqlite::params![state], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .map_err(store_err)?;
            mapped.collect::<Result<_, _>>().map_err(store_err)?
        };

        let mut records = Vec::new();
        for (name, description, config) in rows {
            let record = row_to_record(name, description, config)?;
            if filter.matches(&record) {
                records.push(record);
                if filter.limit.is_some_and(|limit| records.len() >= limit) {
                    break;
                }
            }
        }
        Ok(records)
    }

    async fn remove(&self, name: &str) -> AipResult<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM server_records WHERE name = ?1",
                rusqlite::params![name],
            )
            .map_err(store_err)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aip_types::discovery::ServerState;

    fn record(name: &str, description: &str) -> ServerRecord {
        ServerRecord {
            name: name.to_string(),
            description: description.to_string(),
            config: ServerConfig {
                url: format!("{name}/default"),
                transport: "grpc".into(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_add_get_roundtrip_preserves_extra_keys() {
        let store = SqliteDiscoveryStore::open_in_memory().unwrap();
        let mut rec = record("weather", "forecasts");
        rec.config
            .extra
            .insert("region".into(), serde_json::json!("eu"));
        store.add(rec.clone()).await.unwrap();
        assert_eq!(store.get("weather").await.unwrap(), Some(rec));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_add_is_store_error() {
        let store = SqliteDiscoveryStore::open_in_memory().unwrap();
        store.add(record("weather", "")).await.unwrap();
        let err = store.add(record("weather", "")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_update_missing_fails() {
        let store = SqliteDiscoveryStore::open_in_memory().unwrap();
        assert!(store.update(record("ghost", "")).await.is_err());
    }

    #[tokio::test]
    async fn test_query_by_state_and_terms() {
        let store = SqliteDiscoveryStore::open_in_memory().unwrap();
        store
            .add(record("weather", "Weather forecasts by city"))
            .await
            .unwrap();
        store
            .add(record("stocks", "Stock quotes and weather of markets"))
            .await
            .unwrap();
        store.add(record("chess", "Chess referee")).await.unwrap();
        store.set_state("stocks", ServerState::Stopped).await.unwrap();

        let mut filter = RecordFilter::with_state(ServerState::Running);
        filter.query = "WEATHER".into();
        let found = store.query(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "weather");

        let stopped = store
            .query(&RecordFilter::with_state(ServerState::Stopped))
            .await
            .unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].config.state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_query_limit() {
        let store = SqliteDiscoveryStore::open_in_memory().unwrap();
        for name in ["a", "b", "c", "d"] {
            store.add(record(name, "tool")).await.unwrap();
        }
        let filter = RecordFilter {
            limit: Some(3),
            ..RecordFilter::all()
        };
        let names: Vec<_> = store
            .query(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("discovery.db");
        {
            let store = SqliteDiscoveryStore::open(&path).unwrap();
            store.add(record("weather", "forecasts")).await.unwrap();
        }
        let store = SqliteDiscoveryStore::open(&path).unwrap();
        assert!(store.exists("weather").await.unwrap());
        assert!(store.remove("weather").await.unwrap());
        assert!(!store.exists("weather").await.unwrap());
    }
}
