//! Intermediate key service
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
use crate::crypto::{open, seal, Algorithm, EnvelopeHeader};
use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyRecord, KeyStatus, KeyTier};
use crate::repository::{ChangeSet, KeyRepository};
use crate::retry::StoragePolicy;
use crate::root::RootKeyService;
use crate::tier::TierKeys;
use crate::unseal::UnsealKeyService;
use std::sync::Arc;

/// Associated data bound into every intermediate ciphertext
const PAYLOAD_CONTEXT: &[u8] = b"payload:intermediate";

/// Encrypts caller payloads with versioned intermediate keys
///
/// Ciphertexts carry the intermediate version in their authenticated header;
/// decryption is addressed by that version and works for every retired
/// version until it is revoked.
pub struct IntermediateKeyService {
    unseal: Arc<UnsealKeyService>,
    root: Arc<RootKeyService>,
    keys: TierKeys,
}

impl IntermediateKeyService {
    pub fn new(
        unseal: Arc<UnsealKeyService>,
        root: Arc<RootKeyService>,
        repo: Arc<dyn KeyRepository>,
        cache: Arc<KeyCache>,
        policy: StoragePolicy,
        algorithm: Algorithm,
    ) -> Self {
        Self {
            unseal,
            root,
            keys: TierKeys::new(KeyTier::Intermediate, repo, cache, policy, algorithm),
        }
    }

    /// Version used for new encryptions
    pub async fn active_version(&self) -> KeyResult<u32> {
        self.unseal.ensure_unsealed().await?;
        self.keys.active_version().await
    }

    /// Encrypt with the active intermediate key
    pub async fn encrypt_key(&self, plaintext: &[u8]) -> KeyResult<(Vec<u8>, u32)> {
        self.unseal.ensure_unsealed().await?;
        let version = self.keys.active_version().await?;
        let key = self.keys.material(self.root.as_ref(), version).await?;
        let ciphertext = seal(&key, version, PAYLOAD_CONTEXT, plaintext)?;
        Ok((ciphertext, version))
    }

    /// Decrypt a ciphertext produced by `encrypt_key`
    ///
    /// `version` must match the version in the ciphertext header, otherwise
    /// the call fails with `IntegrityFailure` before any key is loaded.
    pub async fn decrypt_key(&self, ciphertext: &[u8], version: u32) -> KeyResult<Vec<u8>> {
        self.unseal.ensure_unsealed().await?;
        let header = EnvelopeHeader::parse(ciphertext)?;
        if header.key_version != version {
            return Err(KeyError::IntegrityFailure(format!(
                "ciphertext is tagged v{}, caller claims v{}",
                header.key_version, version
            )));
        }
        let key = self.keys.material(self.root.as_ref(), version).await?;
        open(&key, version, PAYLOAD_CONTEXT, ciphertext)
    }

    /// Create a new intermediate version wrapped by the active root key
    pub async fn rotate(&self) -> KeyResult<u32> {
        Ok(self.rotate_versions().await?.1)
    }

    /// Rotate and report `(previous, new)` active versions
    pub(crate) async fn rotate_versions(&self) -> KeyResult<(u32, u32)> {
        self.unseal.ensure_unsealed().await?;
        let _rotation = self.keys.lock_rotation().await;

        let current = self.keys.fetch_active().await?;
        let new_version = self.keys.next_version().await?;
        let (_material, record) = self
            .keys
            .generate(self.root.as_ref(), current.id, new_version)
            .await?;

        let changes = ChangeSet::new()
            .set_status(
                KeyTier::Intermediate,
                current.version,
                KeyStatus::Active,
                KeyStatus::Retired,
            )
            .insert(record);
        self.keys
            .commit_rotation(changes, current.version, new_version)
            .await?;
        Ok((current.version, new_version))
    }

    /// Revoke a retired intermediate version
    pub async fn revoke(&self, version: u32) -> KeyResult<()> {
        self.unseal.ensure_unsealed().await?;
        self.keys.revoke(version).await
    }

    /// Every stored intermediate record, ascending by version
    pub async fn records(&self) -> KeyResult<Vec<KeyRecord>> {
        let repo = self.keys.repo();
        self.keys
            .policy()
            .read("list", || repo.list(KeyTier::Intermediate))
            .await
    }

    /// Algorithm of newly generated intermediate keys
    pub fn algorithm(&self) -> Algorithm {
        self.keys.algorithm()
    }

    pub(crate) async fn reset(&self) {
        self.keys.reset().await;
    }
}
