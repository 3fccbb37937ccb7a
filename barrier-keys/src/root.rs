//! Root key service
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
use crate::crypto::{unwrap_key, wrap_key, Algorithm, KeyMaterial};
use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyRecord, KeyStatus, KeyTier};
use crate::repository::{ChangeSet, KeyRepository};
use crate::retry::StoragePolicy;
use crate::tier::{TierKeys, WrappingKey};
use crate::unseal::UnsealKeyService;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Manages root key versions, each wrapped by the unseal key
///
/// Root keys only ever wrap intermediate keys. Retired versions stay
/// available so that intermediate records wrapped by them keep opening.
pub struct RootKeyService {
    unseal: Arc<UnsealKeyService>,
    keys: TierKeys,
}

impl RootKeyService {
    pub fn new(
        unseal: Arc<UnsealKeyService>,
        repo: Arc<dyn KeyRepository>,
        cache: Arc<KeyCache>,
        policy: StoragePolicy,
        algorithm: Algorithm,
    ) -> Self {
        Self {
            unseal,
            keys: TierKeys::new(KeyTier::Root, repo, cache, policy, algorithm),
        }
    }

    /// Version used to wrap new intermediate keys
    pub async fn active_version(&self) -> KeyResult<u32> {
        self.unseal.ensure_unsealed().await?;
        self.keys.active_version().await
    }

    /// Wrap an intermediate key with the active root key
    ///
    /// Returns the envelope and the root version that produced it.
    pub async fn encrypt_intermediate_wrap(
        &self,
        intermediate_version: u32,
        intermediate: &KeyMaterial,
    ) -> KeyResult<(Vec<u8>, u32)> {
        self.unseal.ensure_unsealed().await?;
        let version = self.keys.active_version().await?;
        let root = self.keys.material(self.unseal.as_ref(), version).await?;
        let wrapped = wrap_key(
            &root,
            version,
            KeyTier::Intermediate,
            intermediate_version,
            intermediate,
        )?;
        Ok((wrapped, version))
    }

    /// Unwrap an intermediate key with the root version that wrapped it
    ///
    /// Retired root versions are resolved transparently; a revoked one fails
    /// with `KeyRevoked`.
    pub async fn decrypt_intermediate_wrap(
        &self,
        wrapped: &[u8],
        root_version: u32,
        intermediate_version: u32,
        intermediate_algorithm: Algorithm,
    ) -> KeyResult<KeyMaterial> {
        self.unseal.ensure_unsealed().await?;
        let root = self.keys.material(self.unseal.as_ref(), root_version).await?;
        unwrap_key(
            &root,
            root_version,
            KeyTier::Intermediate,
            intermediate_version,
            intermediate_algorithm,
            wrapped,
        )
    }

    /// Create a new root version and make it active
    ///
    /// The new record, the demotion of the previous one and the re-wrap of the
    /// active intermediate key under the new root are one commit. Older
    /// intermediate versions keep their original root version.
    pub async fn rotate(&self) -> KeyResult<u32> {
        Ok(self.rotate_versions().await?.1)
    }

    /// Rotate and report `(previous, new)` active versions
    pub(crate) async fn rotate_versions(&self) -> KeyResult<(u32, u32)> {
        self.unseal.ensure_unsealed().await?;
        let _rotation = self.keys.lock_rotation().await;
        // The new record is wrapped under the unseal key; keep that key fixed until commit
        let _unseal_rotation = self.unseal.lock_rotation().await;

        let current = self.keys.fetch_active().await?;
        let new_version = self.keys.next_version().await?;
        let (new_root, record) = self
            .keys
            .generate(self.unseal.as_ref(), current.id, new_version)
            .await?;

        let mut changes = ChangeSet::new()
            .set_status(KeyTier::Root, current.version, KeyStatus::Active, KeyStatus::Retired)
            .insert(record);

        let repo = self.keys.repo();
        match self
            .keys
            .policy()
            .read("get_active", || repo.get_active(KeyTier::Intermediate))
            .await
        {
            Ok(intermediate) => {
                let wrapping_version = intermediate.wrapping_key_version.ok_or_else(|| {
                    KeyError::InvalidFormat(format!(
                        "intermediate v{} has no wrapping root version",
                        intermediate.version
                    ))
                })?;
                let material = self
                    .decrypt_intermediate_wrap(
                        &intermediate.wrapped_key,
                        wrapping_version,
                        intermediate.version,
                        intermediate.algorithm,
                    )
                    .await?;
                let rewrapped = wrap_key(
                    &new_root,
                    new_version,
                    KeyTier::Intermediate,
                    intermediate.version,
                    &material,
                )?;
                changes = changes.rewrap(
                    KeyTier::Intermediate,
                    intermediate.version,
                    rewrapped,
                    Some(new_version),
                );
            }
            Err(KeyError::NoActiveKey(_)) => {
                debug!("No active intermediate key to re-wrap");
            }
            Err(e) => return Err(e),
        }

        self.keys
            .commit_rotation(changes, current.version, new_version)
            .await?;
        Ok((current.version, new_version))
    }

    /// Revoke a retired root version
    ///
    /// Intermediate keys wrapped by it can no longer be opened, so cached
    /// intermediate material is dropped too. The version still wrapping the
    /// active intermediate key cannot be revoked: rotate the intermediate
    /// tier first.
    pub async fn revoke(&self, version: u32) -> KeyResult<()> {
        self.unseal.ensure_unsealed().await?;
        let _rotation = self.keys.lock_rotation().await;

        let repo = self.keys.repo();
        match self
            .keys
            .policy()
            .read("get_active", || repo.get_active(KeyTier::Intermediate))
            .await
        {
            Ok(intermediate) if intermediate.wrapping_key_version == Some(version) => {
                return Err(KeyError::Conflict(format!(
                    "root v{} wraps the active intermediate v{}; \
                     rotate the intermediate tier first",
                    version, intermediate.version
                )));
            }
            Ok(_) | Err(KeyError::NoActiveKey(_)) => {}
            Err(e) => return Err(e),
        }

        self.keys.revoke_locked(version).await?;
        self.keys.cache().invalidate_tier(KeyTier::Intermediate);
        Ok(())
    }

    /// Every stored root record, ascending by version
    pub async fn records(&self) -> KeyResult<Vec<KeyRecord>> {
        let repo = self.keys.repo();
        self.keys
            .policy()
            .read("list", || repo.list(KeyTier::Root))
            .await
    }

    pub(crate) async fn reset(&self) {
        self.keys.reset().await;
    }
}

#[async_trait]
impl WrappingKey for RootKeyService {
    fn tier(&self) -> KeyTier {
        self.keys.tier()
    }

    async fn wrap_child(
        &self,
        child_tier: KeyTier,
        child_version: u32,
        child: &KeyMaterial,
    ) -> KeyResult<(Vec<u8>, u32)> {
        if child_tier != KeyTier::Intermediate {
            return Err(KeyError::InvalidFormat(format!(
                "root key only wraps intermediate keys, got {}",
                child_tier
            )));
        }
        self.encrypt_intermediate_wrap(child_version, child).await
    }

    async fn unwrap_child(&self, record: &KeyRecord) -> KeyResult<KeyMaterial> {
        let root_version = record.wrapping_key_version.ok_or_else(|| {
            KeyError::InvalidFormat(format!(
                "{} v{} has no wrapping version",
                record.tier, record.version
            ))
        })?;
        self.decrypt_intermediate_wrap(
            &record.wrapped_key,
            root_version,
            record.version,
            record.algorithm,
        )
        .await
    }
}
