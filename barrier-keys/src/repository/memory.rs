//! In-process repository for tests and ephemeral deployments
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
use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyRecord, KeyTier};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

type Records = BTreeMap<(KeyTier, u32), KeyRecord>;

/// Repository backed by an ordered map
///
/// Commits are applied to a copy which replaces the live map only when every
/// change succeeded.
#[derive(Default)]
pub struct MemoryKeyRepository {
    records: RwLock<Records>,
}

impl MemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records across all tiers
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(records: &mut Records, change: &KeyChange) -> KeyResult<()> {
        match change {
            KeyChange::Insert(record) => {
                let key = (record.tier, record.version);
                if records.contains_key(&key) {
                    return Err(KeyError::Conflict(format!(
                        "{} v{} already exists",
                        record.tier, record.version
                    )));
                }
                records.insert(key, record.clone());
            }
            KeyChange::SetStatus {
                tier,
                version,
                from,
                to,
            } => {
                let record = records.get_mut(&(*tier, *version)).ok_or(KeyError::KeyNotFound {
                    tier: *tier,
                    version: *version,
                })?;
                if record.status != *from {
                    return Err(KeyError::Conflict(format!(
                        "{} v{} is {}, expected {}",
                        tier, version, record.status, from
                    )));
                }
                record.status = *to;
            }
            KeyChange::Rewrap {
                tier,
                version,
                wrapped_key,
                wrapping_key_version,
            } => {
                let record = records.get_mut(&(*tier, *version)).ok_or(KeyError::KeyNotFound {
                    tier: *tier,
                    version: *version,
                })?;
                record.wrapped_key = wrapped_key.clone();
                record.wrapping_key_version = *wrapping_key_version;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KeyRepository for MemoryKeyRepository {
    async fn get(&self, tier: KeyTier, version: u32) -> KeyResult<KeyRecord> {
        self.records
            .read()
            .get(&(tier, version))
            .cloned()
            .ok_or(KeyError::KeyNotFound { tier, version })
    }

    async fn get_active(&self, tier: KeyTier) -> KeyResult<KeyRecord> {
        self.records
            .read()
            .range((tier, 0)..=(tier, u32::MAX))
            .map(|(_, record)| record)
            .find(|record| record.is_active())
            .cloned()
            .ok_or(KeyError::NoActiveKey(tier))
    }

    async fn list_versions(&self, tier: KeyTier) -> KeyResult<Vec<u32>> {
        Ok(self
            .records
            .read()
            .range((tier, 0)..=(tier, u32::MAX))
            .map(|((_, version), _)| *version)
            .collect())
    }

    async fn list(&self, tier: KeyTier) -> KeyResult<Vec<KeyRecord>> {
        Ok(self
            .records
            .read()
            .range((tier, 0)..=(tier, u32::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn commit(&self, changes: ChangeSet) -> KeyResult<()> {
        changes.validate()?;

        let mut records = self.records.write();
        let mut staged = records.clone();
        for change in changes.ordered() {
            Self::apply(&mut staged, change)?;
        }

        for tier in changes.touched_tiers() {
            let active = staged
                .range((tier, 0)..=(tier, u32::MAX))
                .filter(|(_, record)| record.is_active())
                .count();
            if active != 1 {
                return Err(active_count_conflict(tier, active));
            }
        }

        *records = staged;
        debug!(changes = changes.len(), backend = "memory", "Committed key changes");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
