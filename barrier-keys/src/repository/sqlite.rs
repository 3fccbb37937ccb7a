//! Embedded single-file repository
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use super::{active_count_conflict, ChangeSet, KeyChange, KeyRepository};
use crate::crypto::Algorithm;
use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyRecord, KeyStatus, KeyTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const COLUMNS: &str =
    "version, id, algorithm, wrapped_key, wrapping_key_version, status, created_at";

/// Repository stored in a single SQLite file
///
/// The connection is shared behind a mutex and every call runs on the
/// blocking thread pool.
pub struct SqliteKeyRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyRepository {
    /// Open (or create) the database file and its tables
    pub async fn open<P: AsRef<Path>>(path: P) -> KeyResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> KeyResult<Connection> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "FULL")?;
            Self::run_migrations(&conn)?;
            info!(path = %path.display(), "Opened SQLite key repository");
            Ok(conn)
        })
        .await
        .map_err(|e| KeyError::StorageUnavailable(format!("sqlite open task failed: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A private in-memory database
    pub fn open_in_memory() -> KeyResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> KeyResult<()> {
        for tier in KeyTier::ALL {
            let table = tier.table_name();
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    version INTEGER PRIMARY KEY CHECK (version > 0),
                    id TEXT NOT NULL,
                    algorithm TEXT NOT NULL,
                    wrapped_key BLOB NOT NULL,
                    wrapping_key_version INTEGER,
                    status TEXT NOT NULL CHECK (status IN ('active', 'retired', 'revoked')),
                    created_at TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS {table}_one_active
                    ON {table}(status) WHERE status = 'active';
                "#,
                table = table
            ))?;
        }
        Ok(())
    }

    async fn with_conn<F, T>(&self, f: F) -> KeyResult<T>
    where
        F: FnOnce(&mut Connection) -> KeyResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| KeyError::StorageUnavailable(format!("sqlite task failed: {}", e)))?
    }

    fn apply(tx: &Transaction<'_>, change: &KeyChange) -> KeyResult<()> {
        match change {
            KeyChange::Insert(record) => {
                tx.execute(
                    &format!(
                        "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        record.tier.table_name(),
                        COLUMNS
                    ),
                    params![
                        record.version,
                        record.id.to_string(),
                        record.algorithm.as_str(),
                        record.wrapped_key,
                        record.wrapping_key_version,
                        record.status.as_str(),
                        record.created_at.to_rfc3339(),
                    ],
                )?;
            }
            KeyChange::SetStatus {
                tier,
                version,
                from,
                to,
            } => {
                let updated = tx.execute(
                    &format!(
                        "UPDATE {} SET status = ?1 WHERE version = ?2 AND status = ?3",
                        tier.table_name()
                    ),
                    params![to.as_str(), version, from.as_str()],
                )?;
                if updated == 0 {
                    return Err(Self::missing_or_stale(tx, *tier, *version, *from)?);
                }
            }
            KeyChange::Rewrap {
                tier,
                version,
                wrapped_key,
                wrapping_key_version,
            } => {
                let updated = tx.execute(
                    &format!(
                        "UPDATE {} SET wrapped_key = ?1, wrapping_key_version = ?2 \
                         WHERE version = ?3",
                        tier.table_name()
                    ),
                    params![wrapped_key, wrapping_key_version, version],
                )?;
                if updated == 0 {
                    return Err(KeyError::KeyNotFound {
                        tier: *tier,
                        version: *version,
                    });
                }
            }
        }
        Ok(())
    }

    fn missing_or_stale(
        tx: &Transaction<'_>,
        tier: KeyTier,
        version: u32,
        expected: KeyStatus,
    ) -> KeyResult<KeyError> {
        let status: Option<String> = tx
            .query_row(
                &format!("SELECT status FROM {} WHERE version = ?1", tier.table_name()),
                params![version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match status {
            None => KeyError::KeyNotFound { tier, version },
            Some(status) => KeyError::Conflict(format!(
                "{} v{} is {}, expected {}",
                tier, version, status, expected
            )),
        })
    }
}

struct RawRecord {
    version: u32,
    id: String,
    algorithm: String,
    wrapped_key: Vec<u8>,
    wrapping_key_version: Option<u32>,
    status: String,
    created_at: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            version: row.get(0)?,
            id: row.get(1)?,
            algorithm: row.get(2)?,
            wrapped_key: row.get(3)?,
            wrapping_key_version: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_record(self, tier: KeyTier) -> KeyResult<KeyRecord> {
        let algorithm: Algorithm = self
            .algorithm
            .parse()
            .map_err(|_| KeyError::InvalidFormat(format!("unknown algorithm {}", self.algorithm)))?;
        Ok(KeyRecord {
            id: Uuid::parse_str(&self.id).map_err(|e| KeyError::InvalidFormat(e.to_string()))?,
            tier,
            version: self.version,
            algorithm,
            wrapped_key: self.wrapped_key,
            wrapping_key_version: self.wrapping_key_version,
            status: self.status.parse()?,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map_err(|e| KeyError::InvalidFormat(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

fn query_records(
    conn: &Connection,
    tier: KeyTier,
    filter: &str,
    arg: Option<&dyn rusqlite::ToSql>,
) -> KeyResult<Vec<KeyRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} {} ORDER BY version",
        COLUMNS,
        tier.table_name(),
        filter
    ))?;
    let rows = match arg {
        Some(arg) => stmt.query_map([arg], RawRecord::from_row)?.collect::<Result<Vec<_>, _>>()?,
        None => stmt.query_map([], RawRecord::from_row)?.collect::<Result<Vec<_>, _>>()?,
    };
    rows.into_iter().map(|raw| raw.into_record(tier)).collect()
}

#[async_trait]
impl KeyRepository for SqliteKeyRepository {
    async fn get(&self, tier: KeyTier, version: u32) -> KeyResult<KeyRecord> {
        self.with_conn(move |conn| {
            query_records(conn, tier, "WHERE version = ?1", Some(&version))?
                .pop()
                .ok_or(KeyError::KeyNotFound { tier, version })
        })
        .await
    }

    async fn get_active(&self, tier: KeyTier) -> KeyResult<KeyRecord> {
        self.with_conn(move |conn| {
            query_records(conn, tier, "WHERE status = 'active'", None)?
                .pop()
                .ok_or(KeyError::NoActiveKey(tier))
        })
        .await
    }

    async fn list_versions(&self, tier: KeyTier) -> KeyResult<Vec<u32>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT version FROM {} ORDER BY version",
                tier.table_name()
            ))?;
            let versions = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<u32>, _>>()?;
            Ok(versions)
        })
        .await
    }

    async fn list(&self, tier: KeyTier) -> KeyResult<Vec<KeyRecord>> {
        self.with_conn(move |conn| query_records(conn, tier, "", None)).await
    }

    async fn commit(&self, changes: ChangeSet) -> KeyResult<()> {
        changes.validate()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for change in changes.ordered() {
                Self::apply(&tx, change)?;
            }
            for tier in changes.touched_tiers() {
                let active: i64 = tx.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {} WHERE status = 'active'",
                        tier.table_name()
                    ),
                    [],
                    |row| row.get(0),
                )?;
                if active != 1 {
                    return Err(active_count_conflict(tier, active as usize));
                }
            }
            tx.commit()?;
            debug!(changes = changes.len(), backend = "sqlite", "Committed key changes");
            Ok(())
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
