//! The barrier: the full key hierarchy behind one handle
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
use crate::content::ContentCipher;
use crate::crypto::Algorithm;
use crate::error::{KeyError, KeyResult};
use crate::intermediate::IntermediateKeyService;
use crate::key_types::KeyTier;
use crate::repository::KeyRepository;
use crate::retry::{RetryConfig, StoragePolicy};
use crate::root::RootKeyService;
use crate::unseal::{KdfParams, SealStatus, UnsealKeyService, UnsealSecret, UnsealSecretSource};
use barrier_config::BarrierSettings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Tunables of a barrier instance
#[derive(Debug, Clone)]
pub struct BarrierConfig {
    /// Algorithm for newly generated keys; existing records keep theirs
    pub algorithm: Algorithm,
    /// Maximum cached unwrapped keys; 0 disables the cache
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub storage: StoragePolicy,
    pub kdf: KdfParams,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Aes256Gcm,
            cache_capacity: 64,
            cache_ttl: Duration::from_secs(300),
            storage: StoragePolicy::default(),
            kdf: KdfParams::default(),
        }
    }
}

impl BarrierConfig {
    /// Build from loaded settings
    pub fn from_settings(settings: &BarrierSettings) -> KeyResult<Self> {
        let calls = &settings.storage_calls;
        Ok(Self {
            algorithm: settings.algorithm.parse()?,
            cache_capacity: settings.cache.capacity,
            cache_ttl: Duration::from_secs(settings.cache.ttl_secs),
            storage: StoragePolicy::new(
                Duration::from_millis(calls.timeout_ms),
                RetryConfig::new(
                    calls.max_retries,
                    Duration::from_millis(calls.initial_delay_ms),
                    Duration::from_millis(calls.max_delay_ms),
                    2.0,
                ),
            ),
            kdf: KdfParams::default(),
        })
    }
}

/// Result of a rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationOutcome {
    pub tier: KeyTier,
    pub previous_version: u32,
    pub new_version: u32,
    pub reason: String,
    pub rotated_at: DateTime<Utc>,
}

/// Point-in-time view of the barrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarrierStatus {
    pub seal: SealStatus,
    pub backend: &'static str,
    /// Active version per tier, as stored
    pub active_versions: BTreeMap<KeyTier, u32>,
    pub cached_keys: usize,
}

/// Unseal, root and intermediate services sharing one repository and cache
pub struct Barrier {
    repo: Arc<dyn KeyRepository>,
    cache: Arc<KeyCache>,
    policy: StoragePolicy,
    unseal: Arc<UnsealKeyService>,
    root: Arc<RootKeyService>,
    intermediate: Arc<IntermediateKeyService>,
    content: ContentCipher,
}

impl Barrier {
    /// Build a sealed barrier over `repo`
    pub fn new(repo: Arc<dyn KeyRepository>, config: BarrierConfig) -> Self {
        let cache = Arc::new(KeyCache::new(config.cache_capacity, config.cache_ttl));
        let unseal = Arc::new(
            UnsealKeyService::new(
                Arc::clone(&repo),
                Arc::clone(&cache),
                config.storage.clone(),
                config.algorithm,
            )
            .with_kdf_params(config.kdf),
        );
        let root = Arc::new(RootKeyService::new(
            Arc::clone(&unseal),
            Arc::clone(&repo),
            Arc::clone(&cache),
            config.storage.clone(),
            config.algorithm,
        ));
        let intermediate = Arc::new(IntermediateKeyService::new(
            Arc::clone(&unseal),
            Arc::clone(&root),
            Arc::clone(&repo),
            Arc::clone(&cache),
            config.storage.clone(),
            config.algorithm,
        ));
        let content = ContentCipher::new(Arc::clone(&intermediate), config.algorithm);

        info!(
            backend = repo.backend_name(),
            algorithm = %config.algorithm,
            cache_capacity = config.cache_capacity,
            cache_ttl_secs = config.cache_ttl.as_secs(),
            "Barrier created (sealed)"
        );

        Self {
            repo,
            cache,
            policy: config.storage,
            unseal,
            root,
            intermediate,
            content,
        }
    }

    pub async fn unseal(&self, secret: UnsealSecret) -> KeyResult<()> {
        self.unseal.unseal(secret).await
    }

    /// Unseal from a source; `Ok(false)` if it had no secret
    pub async fn unseal_from(&self, source: &dyn UnsealSecretSource) -> KeyResult<bool> {
        self.unseal.unseal_from(source).await
    }

    /// Drop every key from memory; storage is untouched
    pub async fn seal(&self) {
        self.unseal.seal().await;
        self.root.reset().await;
        self.intermediate.reset().await;
    }

    pub async fn is_sealed(&self) -> bool {
        self.unseal.is_sealed().await
    }

    /// Encrypt with the active intermediate key
    pub async fn encrypt_key(&self, plaintext: &[u8]) -> KeyResult<(Vec<u8>, u32)> {
        self.intermediate.encrypt_key(plaintext).await
    }

    /// Decrypt a ciphertext tagged with `version`
    pub async fn decrypt_key(&self, ciphertext: &[u8], version: u32) -> KeyResult<Vec<u8>> {
        self.intermediate.decrypt_key(ciphertext, version).await
    }

    /// Encrypt under a fresh data key protected by the intermediate key
    pub async fn encrypt_content(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        self.content.encrypt(plaintext).await
    }

    pub async fn decrypt_content(&self, envelope: &[u8]) -> KeyResult<Vec<u8>> {
        self.content.decrypt(envelope).await
    }

    /// Rotate the root or intermediate tier
    ///
    /// The unseal tier needs a new secret: use `rotate_unseal`.
    pub async fn rotate(&self, tier: KeyTier, reason: &str) -> KeyResult<RotationOutcome> {
        let (previous_version, new_version) = match tier {
            KeyTier::Root => self.root.rotate_versions().await?,
            KeyTier::Intermediate => self.intermediate.rotate_versions().await?,
            KeyTier::Unseal => {
                return Err(KeyError::Configuration(
                    "unseal rotation requires a new secret".to_string(),
                ))
            }
        };
        Ok(Self::outcome(tier, previous_version, new_version, reason))
    }

    /// Replace the unseal key, re-wrapping every root key under it
    pub async fn rotate_unseal(
        &self,
        new_secret: UnsealSecret,
        reason: &str,
    ) -> KeyResult<RotationOutcome> {
        let (previous_version, new_version) = self.unseal.rotate_versions(new_secret).await?;
        Ok(Self::outcome(KeyTier::Unseal, previous_version, new_version, reason))
    }

    fn outcome(
        tier: KeyTier,
        previous_version: u32,
        new_version: u32,
        reason: &str,
    ) -> RotationOutcome {
        info!(
            tier = %tier,
            previous_version = previous_version,
            new_version = new_version,
            reason = reason,
            "Key rotation completed"
        );
        RotationOutcome {
            tier,
            previous_version,
            new_version,
            reason: reason.to_string(),
            rotated_at: Utc::now(),
        }
    }

    /// Revoke a retired root or intermediate version
    pub async fn revoke(&self, tier: KeyTier, version: u32) -> KeyResult<()> {
        match tier {
            KeyTier::Root => self.root.revoke(version).await,
            KeyTier::Intermediate => self.intermediate.revoke(version).await,
            KeyTier::Unseal => Err(KeyError::Conflict(
                "unseal keys are replaced by rotation, not revoked".to_string(),
            )),
        }
    }

    /// Seal state and stored active versions
    ///
    /// Available while sealed: it reads only record metadata.
    pub async fn status(&self) -> KeyResult<BarrierStatus> {
        let seal = self.unseal.status().await;
        let mut active_versions = BTreeMap::new();
        if seal != SealStatus::Closed {
            for tier in KeyTier::ALL {
                let repo = &self.repo;
                match self
                    .policy
                    .read("get_active", || repo.get_active(tier))
                    .await
                {
                    Ok(record) => {
                        active_versions.insert(tier, record.version);
                    }
                    Err(KeyError::NoActiveKey(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(BarrierStatus {
            seal,
            backend: self.repo.backend_name(),
            active_versions,
            cached_keys: self.cache.len(),
        })
    }

    /// Seal and refuse every further call with `Closed`; idempotent
    pub async fn shutdown(&self) {
        if self.unseal.status().await == SealStatus::Closed {
            warn!("Barrier already shut down");
            return;
        }
        self.unseal.close().await;
        self.root.reset().await;
        self.intermediate.reset().await;
        info!("Barrier shut down");
    }

    pub fn unseal_service(&self) -> &Arc<UnsealKeyService> {
        &self.unseal
    }

    pub fn root(&self) -> &Arc<RootKeyService> {
        &self.root
    }

    pub fn intermediate(&self) -> &Arc<IntermediateKeyService> {
        &self.intermediate
    }

    pub fn repository(&self) -> &Arc<dyn KeyRepository> {
        &self.repo
    }
}
