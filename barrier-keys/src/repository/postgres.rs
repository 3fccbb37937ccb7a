//! Client/server relational repository
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
use crate::key_types::{KeyRecord, KeyTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row, Transaction};
use tracing::{debug, error, info};
use uuid::Uuid;

const COLUMNS: &str =
    "version, id, algorithm, wrapped_key, wrapping_key_version, status, created_at";

/// Repository stored in PostgreSQL, one table per tier
pub struct PostgresKeyRepository {
    client: Mutex<Client>,
}

impl PostgresKeyRepository {
    /// Connect using a connection string and create the tables
    pub async fn connect(database_url: &str) -> KeyResult<Self> {
        info!("Connecting to key repository database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Key repository connection error");
            }
        });

        Self::from_client(client).await
    }

    /// Use a connection supplied by the host
    pub async fn from_client(client: Client) -> KeyResult<Self> {
        Self::run_migrations(&client).await?;
        info!("Key repository database initialized");
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    async fn run_migrations(client: &Client) -> KeyResult<()> {
        for tier in KeyTier::ALL {
            let table = tier.table_name();
            client
                .batch_execute(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        version INTEGER PRIMARY KEY CHECK (version > 0),
                        id UUID NOT NULL,
                        algorithm TEXT NOT NULL,
                        wrapped_key BYTEA NOT NULL,
                        wrapping_key_version INTEGER,
                        status VARCHAR(10) NOT NULL
                            CHECK (status IN ('active', 'retired', 'revoked')),
                        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    CREATE UNIQUE INDEX IF NOT EXISTS {table}_one_active
                        ON {table}(status) WHERE status = 'active';
                    "#,
                    table = table
                ))
                .await?;
        }
        Ok(())
    }

    async fn apply(tx: &Transaction<'_>, change: &KeyChange) -> KeyResult<()> {
        match change {
            KeyChange::Insert(record) => {
                tx.execute(
                    &format!(
                        "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                        record.tier.table_name(),
                        COLUMNS
                    ),
                    &[
                        &to_sql_version(record.version)?,
                        &record.id,
                        &record.algorithm.as_str(),
                        &record.wrapped_key,
                        &record.wrapping_key_version.map(to_sql_version).transpose()?,
                        &record.status.as_str(),
                        &record.created_at,
                    ],
                )
                .await?;
            }
            KeyChange::SetStatus {
                tier,
                version,
                from,
                to,
            } => {
                let updated = tx
                    .execute(
                        &format!(
                            "UPDATE {} SET status = $1 WHERE version = $2 AND status = $3",
                            tier.table_name()
                        ),
                        &[&to.as_str(), &to_sql_version(*version)?, &from.as_str()],
                    )
                    .await?;
                if updated == 0 {
                    let current = tx
                        .query_opt(
                            &format!("SELECT status FROM {} WHERE version = $1", tier.table_name()),
                            &[&to_sql_version(*version)?],
                        )
                        .await?;
                    return Err(match current {
                        None => KeyError::KeyNotFound {
                            tier: *tier,
                            version: *version,
                        },
                        Some(row) => KeyError::Conflict(format!(
                            "{} v{} is {}, expected {}",
                            tier,
                            version,
                            row.get::<_, String>(0),
                            from
                        )),
                    });
                }
            }
            KeyChange::Rewrap {
                tier,
                version,
                wrapped_key,
                wrapping_key_version,
            } => {
                let updated = tx
                    .execute(
                        &format!(
                            "UPDATE {} SET wrapped_key = $1, wrapping_key_version = $2 \
                             WHERE version = $3",
                            tier.table_name()
                        ),
                        &[
                            wrapped_key,
                            &wrapping_key_version.map(to_sql_version).transpose()?,
                            &to_sql_version(*version)?,
                        ],
                    )
                    .await?;
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
}

fn to_sql_version(version: u32) -> KeyResult<i32> {
    i32::try_from(version)
        .map_err(|_| KeyError::InvalidFormat(format!("version {} exceeds storage range", version)))
}

fn from_sql_version(version: i32) -> KeyResult<u32> {
    u32::try_from(version)
        .map_err(|_| KeyError::InvalidFormat(format!("negative stored version {}", version)))
}

fn row_to_record(tier: KeyTier, row: &Row) -> KeyResult<KeyRecord> {
    let algorithm: String = row.try_get("algorithm")?;
    let algorithm: Algorithm = algorithm
        .parse()
        .map_err(|_| KeyError::InvalidFormat(format!("unknown algorithm {}", algorithm)))?;
    let status: String = row.try_get("status")?;
    let wrapping_key_version: Option<i32> = row.try_get("wrapping_key_version")?;

    Ok(KeyRecord {
        id: row.try_get::<_, Uuid>("id")?,
        tier,
        version: from_sql_version(row.try_get("version")?)?,
        algorithm,
        wrapped_key: row.try_get("wrapped_key")?,
        wrapping_key_version: wrapping_key_version.map(from_sql_version).transpose()?,
        status: status.parse()?,
        created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
    })
}

async fn query_records(
    client: &Client,
    tier: KeyTier,
    filter: &str,
    params: &[&(dyn ToSql + Sync)],
) -> KeyResult<Vec<KeyRecord>> {
    let rows = client
        .query(
            &format!(
                "SELECT {} FROM {} {} ORDER BY version",
                COLUMNS,
                tier.table_name(),
                filter
            ),
            params,
        )
        .await?;
    rows.iter().map(|row| row_to_record(tier, row)).collect()
}

#[async_trait]
impl KeyRepository for PostgresKeyRepository {
    async fn get(&self, tier: KeyTier, version: u32) -> KeyResult<KeyRecord> {
        let client = self.client.lock().await;
        query_records(&*client, tier, "WHERE version = $1", &[&to_sql_version(version)?])
            .await?
            .pop()
            .ok_or(KeyError::KeyNotFound { tier, version })
    }

    async fn get_active(&self, tier: KeyTier) -> KeyResult<KeyRecord> {
        let client = self.client.lock().await;
        query_records(&*client, tier, "WHERE status = 'active'", &[])
            .await?
            .pop()
            .ok_or(KeyError::NoActiveKey(tier))
    }

    async fn list_versions(&self, tier: KeyTier) -> KeyResult<Vec<u32>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!("SELECT version FROM {} ORDER BY version", tier.table_name()),
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| from_sql_version(row.try_get(0)?))
            .collect()
    }

    async fn list(&self, tier: KeyTier) -> KeyResult<Vec<KeyRecord>> {
        let client = self.client.lock().await;
        query_records(&*client, tier, "", &[]).await
    }

    async fn commit(&self, changes: ChangeSet) -> KeyResult<()> {
        changes.validate()?;

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        for change in changes.ordered() {
            Self::apply(&tx, change).await?;
        }
        for tier in changes.touched_tiers() {
            let row = tx
                .query_one(
                    &format!(
                        "SELECT COUNT(*) FROM {} WHERE status = 'active'",
                        tier.table_name()
                    ),
                    &[],
                )
                .await?;
            let active: i64 = row.try_get(0)?;
            if active != 1 {
                return Err(active_count_conflict(tier, active as usize));
            }
        }
        tx.commit().await?;

        debug!(changes = changes.len(), backend = "postgres", "Committed key changes");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
