//! Persistence of wrapped key records
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


pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::MemoryKeyRepository;
pub use postgres::PostgresKeyRepository;
pub use sqlite::SqliteKeyRepository;

use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyRecord, KeyStatus, KeyTier};
use async_trait::async_trait;
use barrier_config::StorageSettings;
use std::collections::BTreeSet;
use std::sync::Arc;

/// One mutation inside a `ChangeSet`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyChange {
    /// Create a new record. Versions are write-once.
    Insert(KeyRecord),
    /// Move a record from `from` to `to`; fails if its status is not `from`
    SetStatus {
        tier: KeyTier,
        version: u32,
        from: KeyStatus,
        to: KeyStatus,
    },
    /// Replace a record's envelope, keeping its version and key material.
    /// Only used when the parent key changes underneath it.
    Rewrap {
        tier: KeyTier,
        version: u32,
        wrapped_key: Vec<u8>,
        wrapping_key_version: Option<u32>,
    },
}

impl KeyChange {
    pub fn tier(&self) -> KeyTier {
        match self {
            KeyChange::Insert(record) => record.tier,
            KeyChange::SetStatus { tier, .. } | KeyChange::Rewrap { tier, .. } => *tier,
        }
    }
}

/// A batch of changes applied atomically by `KeyRepository::commit`
///
/// Status changes and rewraps are applied before inserts so that demoting the
/// old active record never collides with the new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<KeyChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, record: KeyRecord) -> Self {
        self.changes.push(KeyChange::Insert(record));
        self
    }

    pub fn set_status(
        mut self,
        tier: KeyTier,
        version: u32,
        from: KeyStatus,
        to: KeyStatus,
    ) -> Self {
        self.changes.push(KeyChange::SetStatus {
            tier,
            version,
            from,
            to,
        });
        self
    }

    pub fn rewrap(
        mut self,
        tier: KeyTier,
        version: u32,
        wrapped_key: Vec<u8>,
        wrapping_key_version: Option<u32>,
    ) -> Self {
        self.changes.push(KeyChange::Rewrap {
            tier,
            version,
            wrapped_key,
            wrapping_key_version,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Tiers that must hold exactly one active record after the commit
    pub fn touched_tiers(&self) -> BTreeSet<KeyTier> {
        self.changes.iter().map(KeyChange::tier).collect()
    }

    /// Changes in application order: updates first, then inserts
    pub fn ordered(&self) -> impl Iterator<Item = &KeyChange> {
        let updates = self
            .changes
            .iter()
            .filter(|change| !matches!(change, KeyChange::Insert(_)));
        let inserts = self
            .changes
            .iter()
            .filter(|change| matches!(change, KeyChange::Insert(_)));
        updates.chain(inserts)
    }

    /// Reject changes that no backend may apply
    pub fn validate(&self) -> KeyResult<()> {
        for change in &self.changes {
            match change {
                KeyChange::Insert(record) => {
                    if record.version == 0 {
                        return Err(KeyError::InvalidFormat(format!(
                            "{} versions start at 1",
                            record.tier
                        )));
                    }
                    if record.tier.parent().is_some() != record.wrapping_key_version.is_some() {
                        return Err(KeyError::InvalidFormat(format!(
                            "{} v{} has an inconsistent wrapping key version",
                            record.tier, record.version
                        )));
                    }
                }
                KeyChange::SetStatus {
                    tier,
                    version,
                    from,
                    to,
                } => check_transition(*tier, *version, *from, *to)?,
                KeyChange::Rewrap { .. } => {}
            }
        }
        Ok(())
    }
}

/// Allowed lifecycle moves: active -> retired, active/retired -> revoked
pub fn check_transition(
    tier: KeyTier,
    version: u32,
    from: KeyStatus,
    to: KeyStatus,
) -> KeyResult<()> {
    match (from, to) {
        (KeyStatus::Active, KeyStatus::Retired)
        | (KeyStatus::Active, KeyStatus::Revoked)
        | (KeyStatus::Retired, KeyStatus::Revoked) => Ok(()),
        _ => Err(KeyError::Conflict(format!(
            "{} v{} cannot move from {} to {}",
            tier, version, from, to
        ))),
    }
}

/// Error for a tier that ended a commit without exactly one active record
pub(crate) fn active_count_conflict(tier: KeyTier, active: usize) -> KeyError {
    KeyError::Conflict(format!(
        "commit would leave {} active {} records, expected 1",
        active, tier
    ))
}

/// Storage contract for wrapped key records
///
/// Implementations hold no cryptographic logic and never see plaintext key
/// material. Unreachable backends surface `StorageUnavailable`; write
/// collisions surface `Conflict`.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Fetch one version of a tier
    async fn get(&self, tier: KeyTier, version: u32) -> KeyResult<KeyRecord>;

    /// Fetch the active record of a tier
    async fn get_active(&self, tier: KeyTier) -> KeyResult<KeyRecord>;

    /// All versions of a tier, ascending
    async fn list_versions(&self, tier: KeyTier) -> KeyResult<Vec<u32>>;

    /// All records of a tier, ascending by version
    async fn list(&self, tier: KeyTier) -> KeyResult<Vec<KeyRecord>>;

    /// Apply a change set atomically
    ///
    /// Either every change is applied or none is. After the changes, each
    /// touched tier must hold exactly one active record, otherwise the batch
    /// is rejected with `Conflict`.
    async fn commit(&self, changes: ChangeSet) -> KeyResult<()>;

    /// Store a single new record
    async fn put(&self, record: KeyRecord) -> KeyResult<()> {
        self.commit(ChangeSet::new().insert(record)).await
    }

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Open the repository selected by the storage settings
pub async fn open_repository(settings: &StorageSettings) -> KeyResult<Arc<dyn KeyRepository>> {
    let repository: Arc<dyn KeyRepository> = match settings {
        StorageSettings::Memory => Arc::new(MemoryKeyRepository::new()),
        StorageSettings::Sqlite { path } => Arc::new(SqliteKeyRepository::open(path).await?),
        StorageSettings::Postgres { url } => Arc::new(PostgresKeyRepository::connect(url).await?),
    };
    Ok(repository)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Algorithm;
    use uuid::Uuid;

    fn record(tier: KeyTier, version: u32) -> KeyRecord {
        let wrapping = tier.parent().map(|_| 1);
        KeyRecord::new_active(
            Uuid::new_v4(),
            tier,
            version,
            Algorithm::Aes256Gcm,
            vec![0; 4],
            wrapping,
        )
    }

    #[test]
    fn test_updates_are_ordered_before_inserts() {
        let changes = ChangeSet::new()
            .insert(record(KeyTier::Root, 2))
            .set_status(KeyTier::Root, 1, KeyStatus::Active, KeyStatus::Retired);

        let ordered: Vec<_> = changes.ordered().collect();
        assert!(matches!(ordered[0], KeyChange::SetStatus { .. }));
        assert!(matches!(ordered[1], KeyChange::Insert(_)));
        assert_eq!(changes.touched_tiers().into_iter().collect::<Vec<_>>(), vec![KeyTier::Root]);
    }

    #[test]
    fn test_revoked_is_final() {
        assert!(check_transition(KeyTier::Root, 1, KeyStatus::Retired, KeyStatus::Revoked).is_ok());
        assert!(matches!(
            check_transition(KeyTier::Root, 1, KeyStatus::Revoked, KeyStatus::Retired),
            Err(KeyError::Conflict(_))
        ));
        assert!(check_transition(KeyTier::Root, 1, KeyStatus::Retired, KeyStatus::Active).is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_inserts() {
        let mut unwrapped_root = record(KeyTier::Root, 1);
        unwrapped_root.wrapping_key_version = None;
        assert!(ChangeSet::new().insert(unwrapped_root).validate().is_err());
        assert!(ChangeSet::new().insert(record(KeyTier::Intermediate, 0)).validate().is_err());
        assert!(ChangeSet::new().insert(record(KeyTier::Unseal, 1)).validate().is_ok());
    }
}
