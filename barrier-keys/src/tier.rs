//! Versioned key state shared by the root and intermediate tiers
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


use crate::cache::KeyCache;
use crate::crypto::{Algorithm, KeyMaterial};
use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyRecord, KeyStatus, KeyTier};
use crate::repository::{ChangeSet, KeyRepository};
use crate::retry::StoragePolicy;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// A tier whose key wraps the records of the tier below it
#[async_trait]
pub trait WrappingKey: Send + Sync {
    /// The wrapping tier
    fn tier(&self) -> KeyTier;

    /// Wrap `child` under the active key; returns the envelope and the
    /// version of the key that produced it
    async fn wrap_child(
        &self,
        child_tier: KeyTier,
        child_version: u32,
        child: &KeyMaterial,
    ) -> KeyResult<(Vec<u8>, u32)>;

    /// Recover the key material of a child record
    async fn unwrap_child(&self, record: &KeyRecord) -> KeyResult<KeyMaterial>;
}

/// Per-tier state: active pointer, cache access and storage policy
///
/// The active pointer mirrors the repository's status column. Readers copy it
/// under a shared lock; rotation and revocation hold the exclusive lock only
/// for the commit and the swap.
pub(crate) struct TierKeys {
    tier: KeyTier,
    repo: Arc<dyn KeyRepository>,
    cache: Arc<KeyCache>,
    policy: StoragePolicy,
    algorithm: Algorithm,
    active: RwLock<Option<u32>>,
    rotation: Mutex<()>,
}

impl TierKeys {
    pub(crate) fn new(
        tier: KeyTier,
        repo: Arc<dyn KeyRepository>,
        cache: Arc<KeyCache>,
        policy: StoragePolicy,
        algorithm: Algorithm,
    ) -> Self {
        Self {
            tier,
            repo,
            cache,
            policy,
            algorithm,
            active: RwLock::new(None),
            rotation: Mutex::new(()),
        }
    }

    pub(crate) fn tier(&self) -> KeyTier {
        self.tier
    }

    /// Algorithm used for newly generated keys of this tier
    pub(crate) fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn repo(&self) -> &Arc<dyn KeyRepository> {
        &self.repo
    }

    pub(crate) fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    pub(crate) fn policy(&self) -> &StoragePolicy {
        &self.policy
    }

    /// Serialise rotations and revocations of this tier
    pub(crate) async fn lock_rotation(&self) -> MutexGuard<'_, ()> {
        self.rotation.lock().await
    }

    /// Version used for new encryptions
    pub(crate) async fn active_version(&self) -> KeyResult<u32> {
        if let Some(version) = *self.active.read().await {
            return Ok(version);
        }

        let mut active = self.active.write().await;
        if let Some(version) = *active {
            return Ok(version);
        }
        let record = self.fetch_active().await?;
        *active = Some(record.version);
        debug!(tier = %self.tier, version = record.version, "Loaded active key pointer");
        Ok(record.version)
    }

    /// Forget the active pointer; the next reader reloads it from storage
    pub(crate) async fn reset(&self) {
        *self.active.write().await = None;
    }

    pub(crate) async fn fetch(&self, version: u32) -> KeyResult<KeyRecord> {
        let tier = self.tier;
        self.policy
            .read("get", || self.repo.get(tier, version))
            .await
    }

    pub(crate) async fn fetch_active(&self) -> KeyResult<KeyRecord> {
        let tier = self.tier;
        self.policy
            .read("get_active", || self.repo.get_active(tier))
            .await
    }

    /// Next unused version: one past the highest ever stored
    pub(crate) async fn next_version(&self) -> KeyResult<u32> {
        let tier = self.tier;
        let versions = self
            .policy
            .read("list_versions", || self.repo.list_versions(tier))
            .await?;
        let highest = versions.into_iter().max().unwrap_or(0);
        highest
            .checked_add(1)
            .ok_or_else(|| KeyError::Conflict(format!("{} version space exhausted", tier)))
    }

    /// Key material for `version`, from the cache or by unwrapping its record
    pub(crate) async fn material(
        &self,
        parent: &dyn WrappingKey,
        version: u32,
    ) -> KeyResult<Arc<KeyMaterial>> {
        if let Some(material) = self.cache.get(self.tier, version) {
            return Ok(material);
        }

        let epoch = self.cache.epoch(self.tier);
        let record = self.fetch(version).await?;
        record.ensure_usable()?;

        let material = match parent.unwrap_child(&record).await {
            Ok(material) => material,
            Err(e @ (KeyError::KeyRevoked { .. } | KeyError::KeyNotFound { .. })) => {
                // The parent may have been rotated underneath us; retry once
                // if the record now names another wrapping version.
                let fresh = self.fetch(version).await?;
                fresh.ensure_usable()?;
                if fresh.wrapping_key_version == record.wrapping_key_version {
                    return Err(e);
                }
                parent.unwrap_child(&fresh).await?
            }
            Err(e) => return Err(e),
        };

        let material = Arc::new(material);
        self.cache.put_if_epoch(
            self.tier,
            version,
            Arc::clone(&material),
            self.cache.default_ttl(),
            epoch,
        );
        Ok(material)
    }

    /// Build a new active record wrapped by `parent`
    pub(crate) async fn generate(
        &self,
        parent: &dyn WrappingKey,
        id: uuid::Uuid,
        version: u32,
    ) -> KeyResult<(KeyMaterial, KeyRecord)> {
        let material = KeyMaterial::generate(self.algorithm);
        let (wrapped, parent_version) = parent.wrap_child(self.tier, version, &material).await?;
        let record = KeyRecord::new_active(
            id,
            self.tier,
            version,
            self.algorithm,
            wrapped,
            Some(parent_version),
        );
        Ok((material, record))
    }

    /// Persist a rotation and swap the active pointer
    ///
    /// The exclusive lock is held for the commit only, so encryptions stall
    /// for at most one repository round trip. A failed commit may still have
    /// been applied (a timed-out write keeps running in the backend), so the
    /// pointer is dropped and the next reader reloads it from storage.
    pub(crate) async fn commit_rotation(
        &self,
        changes: ChangeSet,
        previous: u32,
        new_version: u32,
    ) -> KeyResult<()> {
        let mut active = self.active.write().await;
        if let Err(e) = self.policy.write("commit", self.repo.commit(changes)).await {
            *active = None;
            self.cache.invalidate_tier(self.tier);
            warn!(
                tier = %self.tier,
                previous_version = previous,
                attempted_version = new_version,
                error = %e,
                "Rotation commit failed, active key will be reloaded from storage"
            );
            return Err(e);
        }
        *active = Some(new_version);
        self.cache.invalidate_tier(self.tier);
        info!(
            tier = %self.tier,
            previous_version = previous,
            new_version = new_version,
            "Rotated key"
        );
        Ok(())
    }

    /// Mark a retired version revoked
    ///
    /// Revoking the active version is a `Conflict`: rotate first. Revoking an
    /// already revoked version is a no-op.
    pub(crate) async fn revoke(&self, version: u32) -> KeyResult<()> {
        let _rotation = self.lock_rotation().await;
        self.revoke_locked(version).await
    }

    /// `revoke` for a caller already holding the rotation lock
    pub(crate) async fn revoke_locked(&self, version: u32) -> KeyResult<()> {
        let record = self.fetch(version).await?;
        match record.status {
            KeyStatus::Revoked => {
                debug!(tier = %self.tier, version = version, "Key already revoked");
                return Ok(());
            }
            KeyStatus::Active => {
                return Err(KeyError::Conflict(format!(
                    "{} v{} is active; rotate before revoking",
                    self.tier, version
                )));
            }
            KeyStatus::Retired => {}
        }

        let changes =
            ChangeSet::new().set_status(self.tier, version, KeyStatus::Retired, KeyStatus::Revoked);
        let _active = self.active.write().await;
        self.policy.write("commit", self.repo.commit(changes)).await?;
        self.cache.invalidate(self.tier, version);
        info!(tier = %self.tier, version = version, "Revoked key");
        Ok(())
    }
}
