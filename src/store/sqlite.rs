//! SQLite Coordination Store
//!
//! Durable store backed by an embedded SQLite file. Conditional writes run
//! inside `IMMEDIATE` transactions so processes sharing the file see one
//! serial order of versions. Writes made by this process notify watchers
//! directly; a poller picks up writes made by other processes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    conflict, prefix_stream, CoordinationStore, ExpectedVersion, Version, Versioned, WatchEvent,
    WatchStream,
};
use crate::error::Result;

const WATCH_CAPACITY: usize = 4096;

/// SQLite-backed coordination store
pub struct SqliteStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// Change notifications
    events: broadcast::Sender<WatchEvent>,
    /// Last version announced per key (dedups poller and local notifications)
    announced: std::sync::Mutex<HashMap<String, Version>>,
}

impl SqliteStore {
    /// Create or open the store database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        // Initialize schema
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value_int INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO store_meta (key, value_int) VALUES ('last_version', 0);
            "#,
        )?;

        let announced = Self::scan_versions(&conn)?;
        let (events, _) = broadcast::channel(WATCH_CAPACITY);

        Ok(Self {
            conn: Mutex::new(conn),
            events,
            announced: std::sync::Mutex::new(announced),
        })
    }

    /// Start polling for writes made by other processes
    pub fn start_poller(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.poll_once().await {
                            tracing::warn!("Coordination store poll failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Compare the table against announced versions and emit the difference
    async fn poll_once(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        let current = Self::scan_versions(&conn)?;
        let mut announced = self.announced.lock().unwrap_or_else(|e| e.into_inner());

        for (key, version) in &current {
            if announced.get(key) != Some(version) {
                let _ = self.events.send(WatchEvent::Put {
                    key: key.clone(),
                    version: *version,
                });
            }
        }
        for key in announced.keys() {
            if !current.contains_key(key) {
                let _ = self.events.send(WatchEvent::Deleted { key: key.clone() });
            }
        }

        *announced = current;
        Ok(())
    }

    fn scan_versions(conn: &Connection) -> Result<HashMap<String, Version>> {
        let mut stmt = conn.prepare("SELECT key, version FROM kv")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as Version))
        })?;

        let mut versions = HashMap::new();
        for row in rows {
            let (key, version) = row?;
            versions.insert(key, version);
        }
        Ok(versions)
    }

    fn current_version(conn: &Connection, key: &str) -> Result<Option<Version>> {
        let version: Option<i64> = conn
            .query_row("SELECT version FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(version.map(|v| v as Version))
    }

    fn announce(&self, event: WatchEvent) {
        let mut announced = self.announced.lock().unwrap_or_else(|e| e.into_inner());
        match &event {
            WatchEvent::Put { key, version } => {
                announced.insert(key.clone(), *version);
            }
            WatchEvent::Deleted { key } => {
                announced.remove(key);
            }
            WatchEvent::Lagged => {}
        }
        let _ = self.events.send(event);
    }
}

#[async_trait::async_trait]
impl CoordinationStore for SqliteStore {
    async fn read(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
        let conn = self.conn.lock().await;
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT value, version FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.map(|(value, version)| Versioned {
            value,
            version: version as Version,
        }))
    }

    async fn write(&self, key: &str, value: Vec<u8>, expected: ExpectedVersion) -> Result<Version> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::current_version(&tx, key)?;
        if !expected.matches(current) {
            return Err(conflict(key, expected, current));
        }

        tx.execute(
            "UPDATE store_meta SET value_int = value_int + 1 WHERE key = 'last_version'",
            [],
        )?;
        let version: i64 = tx.query_row(
            "SELECT value_int FROM store_meta WHERE key = 'last_version'",
            [],
            |row| row.get(0),
        )?;

        tx.execute(
            r#"
            INSERT INTO kv (key, value, version) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = ?2, version = ?3, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value, version],
        )?;
        tx.commit()?;

        let version = version as Version;
        self.announce(WatchEvent::Put {
            key: key.to_string(),
            version,
        });
        Ok(version)
    }

    async fn delete(&self, key: &str, expected: ExpectedVersion) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::current_version(&tx, key)?;
        if current.is_none() || !expected.matches(current) {
            return Err(conflict(key, expected, current));
        }

        tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        tx.commit()?;

        self.announce(WatchEvent::Deleted { key: key.to_string() });
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned<Vec<u8>>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key, value, version FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, value, version) = row?;
            entries.push((
                key,
                Versioned {
                    value,
                    version: version as Version,
                },
            ));
        }
        Ok(entries)
    }

    fn watch(&self, prefix: &str) -> WatchStream {
        prefix_stream(self.events.subscribe(), prefix)
    }
}
