//! Unseal key service
//!
//! Holds the top-level key of the hierarchy. The key itself never reaches
//! storage: the unseal tier's record only describes how to rebuild it from an
//! external secret (raw key, or a passphrase stretched with Argon2id).
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
use crate::crypto::{unwrap_key, wrap_key, Algorithm, KeyMaterial, KEY_LEN};
use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyRecord, KeyStatus, KeyTier};
use crate::repository::{ChangeSet, KeyRepository};
use crate::retry::StoragePolicy;
use crate::tier::WrappingKey;
use argon2::{Argon2, Params, Version};
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Environment variable read by `EnvSecretSource::default()`
pub const UNSEAL_SECRET_ENV: &str = "BARRIER_UNSEAL_SECRET";

const SALT_LEN: usize = 16;

/// External secret the unseal key is rebuilt from
#[derive(Clone)]
pub enum UnsealSecret {
    /// 256-bit key used as is
    Key(Zeroizing<[u8; KEY_LEN]>),
    /// Passphrase stretched with Argon2id
    Passphrase(Zeroizing<String>),
}

impl UnsealSecret {
    pub fn from_key(bytes: [u8; KEY_LEN]) -> Self {
        UnsealSecret::Key(Zeroizing::new(bytes))
    }

    pub fn from_passphrase(passphrase: impl Into<String>) -> KeyResult<Self> {
        let passphrase = Zeroizing::new(passphrase.into());
        if passphrase.is_empty() {
            return Err(KeyError::Configuration("Unseal passphrase is empty".to_string()));
        }
        Ok(UnsealSecret::Passphrase(passphrase))
    }

    /// 64 hex characters are a raw key; anything else is a passphrase
    pub fn parse(value: &str) -> KeyResult<Self> {
        let trimmed = value.trim();
        if trimmed.len() == KEY_LEN * 2 {
            if let Ok(bytes) = hex::decode(trimmed) {
                let mut key = Zeroizing::new([0u8; KEY_LEN]);
                key.copy_from_slice(&bytes);
                return Ok(UnsealSecret::Key(key));
            }
        }
        Self::from_passphrase(trimmed)
    }

    fn kind(&self) -> &'static str {
        match self {
            UnsealSecret::Key(_) => "key",
            UnsealSecret::Passphrase(_) => "passphrase",
        }
    }
}

impl fmt::Debug for UnsealSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnsealSecret::{}(<redacted>)", self.kind())
    }
}

/// Where the unseal secret comes from
#[async_trait]
pub trait UnsealSecretSource: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// The secret, or `None` if this source has nothing to offer
    async fn fetch(&self) -> KeyResult<Option<UnsealSecret>>;
}

/// Reads the secret from an environment variable
#[derive(Debug, Clone)]
pub struct EnvSecretSource {
    var: String,
}

impl EnvSecretSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvSecretSource {
    fn default() -> Self {
        Self::new(UNSEAL_SECRET_ENV)
    }
}

#[async_trait]
impl UnsealSecretSource for EnvSecretSource {
    fn describe(&self) -> String {
        format!("env:{}", self.var)
    }

    async fn fetch(&self) -> KeyResult<Option<UnsealSecret>> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => UnsealSecret::parse(&value).map(Some),
            _ => Ok(None),
        }
    }
}

/// A secret handed over by the host
#[derive(Debug, Clone)]
pub struct StaticSecretSource {
    secret: UnsealSecret,
}

impl StaticSecretSource {
    pub fn new(secret: UnsealSecret) -> Self {
        Self { secret }
    }
}

#[async_trait]
impl UnsealSecretSource for StaticSecretSource {
    fn describe(&self) -> String {
        "static".to_string()
    }

    async fn fetch(&self) -> KeyResult<Option<UnsealSecret>> {
        Ok(Some(self.secret.clone()))
    }
}

/// Argon2id cost parameters for new passphrase-derived unseal keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

/// Content of an unseal record: how to rebuild the key, never the key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kdf", rename_all = "snake_case")]
enum UnsealDescriptor {
    Raw,
    Argon2id { salt: String, params: KdfParams },
}

impl UnsealDescriptor {
    fn for_secret(secret: &UnsealSecret, params: KdfParams) -> Self {
        match secret {
            UnsealSecret::Key(_) => UnsealDescriptor::Raw,
            UnsealSecret::Passphrase(_) => {
                let mut salt = [0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                UnsealDescriptor::Argon2id {
                    salt: hex::encode(salt),
                    params,
                }
            }
        }
    }

    fn encode(&self) -> KeyResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> KeyResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| KeyError::InvalidFormat(format!("unseal record: {}", e)))
    }

    fn derive(&self, secret: &UnsealSecret, algorithm: Algorithm) -> KeyResult<KeyMaterial> {
        match (self, secret) {
            (UnsealDescriptor::Raw, UnsealSecret::Key(key)) => {
                Ok(KeyMaterial::from_bytes(algorithm, **key))
            }
            (UnsealDescriptor::Argon2id { salt, params }, UnsealSecret::Passphrase(passphrase)) => {
                let salt = hex::decode(salt)
                    .map_err(|e| KeyError::InvalidFormat(format!("unseal salt: {}", e)))?;
                let params = Params::new(params.m_cost, params.t_cost, params.p_cost, Some(KEY_LEN))
                    .map_err(|e| KeyError::Configuration(format!("Argon2 parameters: {}", e)))?;
                let mut out = Zeroizing::new([0u8; KEY_LEN]);
                Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params)
                    .hash_password_into(passphrase.as_bytes(), &salt, &mut out[..])
                    .map_err(|e| {
                        KeyError::Encryption(format!("Argon2id derivation failed: {}", e))
                    })?;
                Ok(KeyMaterial::from_bytes(algorithm, *out))
            }
            _ => Err(KeyError::IntegrityFailure(format!(
                "unseal secret ({}) does not match the stored key source",
                secret.kind()
            ))),
        }
    }
}

/// Observable seal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SealStatus {
    Sealed,
    Unsealing,
    Unsealed,
    Closed,
}

enum SealState {
    Sealed,
    Unsealing,
    Unsealed { version: u32, key: Arc<KeyMaterial> },
}

/// Unseal key service
///
/// `Sealed -> Unsealing -> Unsealed`. Every crypto operation of every tier
/// checks `ensure_unsealed` first and fails fast with `Sealed` until the key
/// has been verified against the active root record.
pub struct UnsealKeyService {
    repo: Arc<dyn KeyRepository>,
    cache: Arc<KeyCache>,
    policy: StoragePolicy,
    algorithm: Algorithm,
    kdf: KdfParams,
    state: RwLock<SealState>,
    rotation: Mutex<()>,
    /// Bumped by every seal; an unseal started before a seal never publishes
    seal_generation: AtomicU64,
    closed: AtomicBool,
}

impl UnsealKeyService {
    pub fn new(
        repo: Arc<dyn KeyRepository>,
        cache: Arc<KeyCache>,
        policy: StoragePolicy,
        algorithm: Algorithm,
    ) -> Self {
        Self {
            repo,
            cache,
            policy,
            algorithm,
            kdf: KdfParams::default(),
            state: RwLock::new(SealState::Sealed),
            rotation: Mutex::new(()),
            seal_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Argon2id costs used when a new passphrase-derived key is created
    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub async fn status(&self) -> SealStatus {
        if self.closed.load(Ordering::Acquire) {
            return SealStatus::Closed;
        }
        match &*self.state.read().await {
            SealState::Sealed => SealStatus::Sealed,
            SealState::Unsealing => SealStatus::Unsealing,
            SealState::Unsealed { .. } => SealStatus::Unsealed,
        }
    }

    pub async fn is_sealed(&self) -> bool {
        self.status().await != SealStatus::Unsealed
    }

    /// Fail with `Sealed` (or `Closed`) unless the key is available
    pub async fn ensure_unsealed(&self) -> KeyResult<()> {
        self.current().await.map(|_| ())
    }

    /// Version of the unseal key in memory
    pub async fn active_version(&self) -> KeyResult<u32> {
        self.current().await.map(|(version, _)| version)
    }

    async fn current(&self) -> KeyResult<(u32, Arc<KeyMaterial>)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeyError::Closed);
        }
        match &*self.state.read().await {
            SealState::Unsealed { version, key } => Ok((*version, Arc::clone(key))),
            _ => Err(KeyError::Sealed),
        }
    }

    /// Rebuild the unseal key from `secret` and verify it
    ///
    /// On an empty repository this initializes the hierarchy: unseal, root
    /// and intermediate version 1 are written in one commit. A wrong secret
    /// fails with `IntegrityFailure` and leaves the service sealed.
    pub async fn unseal(&self, secret: UnsealSecret) -> KeyResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeyError::Closed);
        }
        let generation = {
            let mut state = self.state.write().await;
            match &*state {
                SealState::Unsealed { .. } => {
                    debug!("Barrier already unsealed");
                    return Ok(());
                }
                SealState::Unsealing => {
                    return Err(KeyError::Conflict("unseal already in progress".to_string()));
                }
                SealState::Sealed => *state = SealState::Unsealing,
            }
            self.seal_generation.load(Ordering::Acquire)
        };

        let result = self.open(&secret).await;

        let mut state = self.state.write().await;
        if self.seal_generation.load(Ordering::Acquire) != generation {
            // Sealed while unsealing: the seal wins and the state it set stays
            warn!("Barrier sealed during unseal, discarding unsealed key");
            return Err(KeyError::Sealed);
        }
        match result {
            Ok((version, key)) => {
                *state = SealState::Unsealed {
                    version,
                    key: Arc::new(key),
                };
                info!(unseal_version = version, secret_kind = secret.kind(), "Barrier unsealed");
                Ok(())
            }
            Err(e) => {
                *state = SealState::Sealed;
                warn!(error = %e, "Unseal failed, barrier stays sealed");
                Err(e)
            }
        }
    }

    /// Unseal from a secret source; `Ok(false)` if the source had no secret
    pub async fn unseal_from(&self, source: &dyn UnsealSecretSource) -> KeyResult<bool> {
        match source.fetch().await? {
            Some(secret) => {
                debug!(source = %source.describe(), "Unsealing from secret source");
                self.unseal(secret).await?;
                Ok(true)
            }
            None => {
                debug!(source = %source.describe(), "Secret source is empty, staying sealed");
                Ok(false)
            }
        }
    }

    async fn open(&self, secret: &UnsealSecret) -> KeyResult<(u32, KeyMaterial)> {
        let record = match self
            .policy
            .read("get_active", || self.repo.get_active(KeyTier::Unseal))
            .await
        {
            Ok(record) => record,
            Err(KeyError::NoActiveKey(KeyTier::Unseal)) => return self.bootstrap(secret).await,
            Err(e) => return Err(e),
        };

        let key = UnsealDescriptor::decode(&record.wrapped_key)?.derive(secret, record.algorithm)?;

        // Verify against the active root record before declaring success
        let root = self
            .policy
            .read("get_active", || self.repo.get_active(KeyTier::Root))
            .await?;
        if root.wrapping_key_version != Some(record.version) {
            return Err(KeyError::IntegrityFailure(format!(
                "root v{} is not wrapped by unseal v{}",
                root.version, record.version
            )));
        }
        unwrap_key(
            &key,
            record.version,
            KeyTier::Root,
            root.version,
            root.algorithm,
            &root.wrapped_key,
        )
        .map_err(|_| {
            KeyError::IntegrityFailure("unseal secret does not open the root key".to_string())
        })?;

        Ok((record.version, key))
    }

    async fn bootstrap(&self, secret: &UnsealSecret) -> KeyResult<(u32, KeyMaterial)> {
        for tier in [KeyTier::Root, KeyTier::Intermediate] {
            let versions = self
                .policy
                .read("list_versions", || self.repo.list_versions(tier))
                .await?;
            if !versions.is_empty() {
                return Err(KeyError::Conflict(format!(
                    "{} keys exist without an unseal record",
                    tier
                )));
            }
        }

        let descriptor = UnsealDescriptor::for_secret(secret, self.kdf);
        let unseal_key = descriptor.derive(secret, self.algorithm)?;
        let root = KeyMaterial::generate(self.algorithm);
        let intermediate = KeyMaterial::generate(self.algorithm);

        let changes = ChangeSet::new()
            .insert(KeyRecord::new_active(
                Uuid::new_v4(),
                KeyTier::Unseal,
                1,
                self.algorithm,
                descriptor.encode()?,
                None,
            ))
            .insert(KeyRecord::new_active(
                Uuid::new_v4(),
                KeyTier::Root,
                1,
                self.algorithm,
                wrap_key(&unseal_key, 1, KeyTier::Root, 1, &root)?,
                Some(1),
            ))
            .insert(KeyRecord::new_active(
                Uuid::new_v4(),
                KeyTier::Intermediate,
                1,
                self.algorithm,
                wrap_key(&root, 1, KeyTier::Intermediate, 1, &intermediate)?,
                Some(1),
            ));
        self.policy.write("commit", self.repo.commit(changes)).await?;

        info!(
            algorithm = %self.algorithm,
            backend = self.repo.backend_name(),
            "Initialized barrier key hierarchy"
        );
        Ok((1, unseal_key))
    }

    /// Drop the unseal key and every cached key
    pub async fn seal(&self) {
        let mut state = self.state.write().await;
        *state = SealState::Sealed;
        self.seal_generation.fetch_add(1, Ordering::AcqRel);
        drop(state);
        self.cache.clear();
        info!("Barrier sealed");
    }

    /// Seal permanently; every later call fails with `Closed`
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.seal().await;
    }

    /// Wrap a root key under the active unseal key
    pub async fn wrap(&self, root_version: u32, root: &KeyMaterial) -> KeyResult<(Vec<u8>, u32)> {
        let (version, key) = self.current().await?;
        let wrapped = wrap_key(&key, version, KeyTier::Root, root_version, root)?;
        Ok((wrapped, version))
    }

    /// Unwrap a root record
    ///
    /// Runs under the shared state lock, so an unseal rotation cannot swap
    /// the key between reading the record and opening it. A record read
    /// before that rotation is refetched.
    pub async fn unwrap(&self, record: &KeyRecord) -> KeyResult<KeyMaterial> {
        if record.tier != KeyTier::Root {
            return Err(KeyError::InvalidFormat(format!(
                "unseal key only wraps root records, got {}",
                record.tier
            )));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(KeyError::Closed);
        }

        let state = self.state.read().await;
        let (version, key) = match &*state {
            SealState::Unsealed { version, key } => (*version, Arc::clone(key)),
            _ => return Err(KeyError::Sealed),
        };

        let refreshed;
        let record = if record.wrapping_key_version == Some(version) {
            record
        } else {
            let root_version = record.version;
            refreshed = self
                .policy
                .read("get", || self.repo.get(KeyTier::Root, root_version))
                .await?;
            &refreshed
        };
        if record.wrapping_key_version != Some(version) {
            return Err(KeyError::IntegrityFailure(format!(
                "root v{} is wrapped by unseal v{:?}, active is v{}",
                record.version, record.wrapping_key_version, version
            )));
        }

        let material = unwrap_key(
            &key,
            version,
            KeyTier::Root,
            record.version,
            record.algorithm,
            &record.wrapped_key,
        )?;
        drop(state);
        Ok(material)
    }

    /// Replace the unseal key with one derived from `new_secret`
    ///
    /// Every root record is re-wrapped under the new key in the same commit
    /// that retires the old unseal record; root versions and material are
    /// unchanged. Concurrent unwraps wait for the swap.
    pub async fn rotate(&self, new_secret: UnsealSecret) -> KeyResult<u32> {
        Ok(self.rotate_versions(new_secret).await?.1)
    }

    /// Rotate and report `(previous, new)` unseal versions
    ///
    /// Reads, key derivation and re-wrapping run under the rotation lock
    /// only. The state lock is taken exclusively for the commit and the key
    /// swap, so unwraps stall for at most one repository round trip. Root
    /// rotations hold the same rotation lock, so no root record can appear
    /// between the listing and the commit.
    pub(crate) async fn rotate_versions(&self, new_secret: UnsealSecret) -> KeyResult<(u32, u32)> {
        let _rotation = self.rotation.lock().await;
        let (current_version, current_key) = self.current().await?;

        let current = self
            .policy
            .read("get_active", || self.repo.get_active(KeyTier::Unseal))
            .await?;
        if current.version != current_version {
            return Err(KeyError::Conflict(format!(
                "active unseal record is v{}, memory holds v{}",
                current.version, current_version
            )));
        }
        let versions = self
            .policy
            .read("list_versions", || self.repo.list_versions(KeyTier::Unseal))
            .await?;
        let new_version = versions.into_iter().max().unwrap_or(0) + 1;

        let descriptor = UnsealDescriptor::for_secret(&new_secret, self.kdf);
        let new_key = descriptor.derive(&new_secret, self.algorithm)?;

        let mut changes = ChangeSet::new()
            .set_status(KeyTier::Unseal, current.version, KeyStatus::Active, KeyStatus::Retired)
            .insert(KeyRecord::new_active(
                current.id,
                KeyTier::Unseal,
                new_version,
                self.algorithm,
                descriptor.encode()?,
                None,
            ));

        let roots = self
            .policy
            .read("list", || self.repo.list(KeyTier::Root))
            .await?;
        let rewrapped = roots.len();
        for root in roots {
            let material = unwrap_key(
                &current_key,
                current_version,
                KeyTier::Root,
                root.version,
                root.algorithm,
                &root.wrapped_key,
            )?;
            let wrapped = wrap_key(&new_key, new_version, KeyTier::Root, root.version, &material)?;
            changes = changes.rewrap(KeyTier::Root, root.version, wrapped, Some(new_version));
        }

        let mut state = self.state.write().await;
        match &*state {
            SealState::Unsealed { version, .. } if *version == current_version => {}
            SealState::Unsealed { version, .. } => {
                return Err(KeyError::Conflict(format!(
                    "unseal key changed to v{} during rotation",
                    version
                )));
            }
            _ => return Err(KeyError::Sealed),
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(KeyError::Closed);
        }

        if let Err(e) = self.policy.write("commit", self.repo.commit(changes)).await {
            // The write may have landed anyway; storage decides which key is live
            let stored = self
                .policy
                .read("get_active", || self.repo.get_active(KeyTier::Unseal))
                .await;
            match stored {
                Ok(record) if record.version == current_version => {
                    warn!(
                        previous_version = current_version,
                        attempted_version = new_version,
                        error = %e,
                        "Unseal rotation commit failed, keeping previous unseal key"
                    );
                    return Err(e);
                }
                Ok(record) if record.version == new_version => {
                    warn!(
                        previous_version = current_version,
                        new_version = new_version,
                        error = %e,
                        "Unseal rotation commit reported an error but was applied"
                    );
                }
                _ => {
                    *state = SealState::Sealed;
                    self.cache.clear();
                    self.seal_generation.fetch_add(1, Ordering::AcqRel);
                    error!(
                        previous_version = current_version,
                        attempted_version = new_version,
                        error = %e,
                        "Unseal rotation outcome unknown, barrier sealed"
                    );
                    return Err(e);
                }
            }
        }

        *state = SealState::Unsealed {
            version: new_version,
            key: Arc::new(new_key),
        };
        info!(
            previous_version = current_version,
            new_version = new_version,
            rewrapped_root_keys = rewrapped,
            "Rotated unseal key"
        );
        Ok((current_version, new_version))
    }

    /// Serialise with unseal rotation
    ///
    /// Held by root rotations from wrapping the new root key until its
    /// commit, so unseal rotation never misses a root record.
    pub(crate) async fn lock_rotation(&self) -> MutexGuard<'_, ()> {
        self.rotation.lock().await
    }
}

#[async_trait]
impl WrappingKey for UnsealKeyService {
    fn tier(&self) -> KeyTier {
        KeyTier::Unseal
    }

    async fn wrap_child(
        &self,
        child_tier: KeyTier,
        child_version: u32,
        child: &KeyMaterial,
    ) -> KeyResult<(Vec<u8>, u32)> {
        if child_tier != KeyTier::Root {
            return Err(KeyError::InvalidFormat(format!(
                "unseal key only wraps root keys, got {}",
                child_tier
            )));
        }
        self.wrap(child_version, child).await
    }

    async fn unwrap_child(&self, record: &KeyRecord) -> KeyResult<KeyMaterial> {
        self.unwrap(record).await
    }
}
