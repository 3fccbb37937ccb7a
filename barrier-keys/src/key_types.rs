//! Key record definitions
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


use crate::crypto::Algorithm;
use crate::error::{KeyError, KeyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tier of the key hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyTier {
    /// Top-level key derived from an external secret
    Unseal,
    /// Wraps intermediate keys; wrapped by the unseal key
    Root,
    /// Encrypts caller payloads; wrapped by the root key
    Intermediate,
}

impl KeyTier {
    pub const ALL: [KeyTier; 3] = [KeyTier::Unseal, KeyTier::Root, KeyTier::Intermediate];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyTier::Unseal => "unseal",
            KeyTier::Root => "root",
            KeyTier::Intermediate => "intermediate",
        }
    }

    /// Table holding this tier's records in relational backends
    pub fn table_name(&self) -> &'static str {
        match self {
            KeyTier::Unseal => "barrier_unseal_keys",
            KeyTier::Root => "barrier_root_keys",
            KeyTier::Intermediate => "barrier_intermediate_keys",
        }
    }

    /// The tier whose key wraps this tier's records
    pub fn parent(&self) -> Option<KeyTier> {
        match self {
            KeyTier::Unseal => None,
            KeyTier::Root => Some(KeyTier::Unseal),
            KeyTier::Intermediate => Some(KeyTier::Root),
        }
    }
}

impl fmt::Display for KeyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a key record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Used for new encryptions
    Active,
    /// Kept only to decrypt existing data
    Retired,
    /// Explicitly disallowed; decryption fails
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Retired => "retired",
            KeyStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = KeyError;

    fn from_str(s: &str) -> KeyResult<Self> {
        match s {
            "active" => Ok(KeyStatus::Active),
            "retired" => Ok(KeyStatus::Retired),
            "revoked" => Ok(KeyStatus::Revoked),
            other => Err(KeyError::InvalidFormat(format!("Unknown key status: {}", other))),
        }
    }
}

/// A persisted, wrapped key version
///
/// `wrapped_key` is always ciphertext under the parent tier's key. For the
/// unseal tier it only references the external secret (KDF salt and a
/// verification tag), never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Logical slot, stable across versions of a tier
    pub id: Uuid,
    pub tier: KeyTier,
    pub version: u32,
    pub algorithm: Algorithm,
    #[serde(with = "hex_bytes")]
    pub wrapped_key: Vec<u8>,
    /// Parent tier version used to wrap this record; `None` for the unseal tier
    pub wrapping_key_version: Option<u32>,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
}

impl KeyRecord {
    /// A new active record
    pub fn new_active(
        id: Uuid,
        tier: KeyTier,
        version: u32,
        algorithm: Algorithm,
        wrapped_key: Vec<u8>,
        wrapping_key_version: Option<u32>,
    ) -> Self {
        Self {
            id,
            tier,
            version,
            algorithm,
            wrapped_key,
            wrapping_key_version,
            status: KeyStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }

    /// Fail with `KeyRevoked` if this version may no longer be used
    pub fn ensure_usable(&self) -> KeyResult<()> {
        if self.status == KeyStatus::Revoked {
            return Err(KeyError::KeyRevoked {
                tier: self.tier,
                version: self.version,
            });
        }
        Ok(())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parents() {
        assert_eq!(KeyTier::Unseal.parent(), None);
        assert_eq!(KeyTier::Root.parent(), Some(KeyTier::Unseal));
        assert_eq!(KeyTier::Intermediate.parent(), Some(KeyTier::Root));
    }

    #[test]
    fn test_status_parsing() {
        for status in [KeyStatus::Active, KeyStatus::Retired, KeyStatus::Revoked] {
            assert_eq!(status.as_str().parse::<KeyStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<KeyStatus>().is_err());
    }

    #[test]
    fn test_revoked_record_is_unusable() {
        let mut record = KeyRecord::new_active(
            Uuid::new_v4(),
            KeyTier::Root,
            3,
            Algorithm::Aes256Gcm,
            vec![1, 2, 3],
            Some(1),
        );
        assert!(record.ensure_usable().is_ok());

        record.status = KeyStatus::Revoked;
        assert!(matches!(
            record.ensure_usable(),
            Err(KeyError::KeyRevoked { tier: KeyTier::Root, version: 3 })
        ));
    }

    #[test]
    fn test_record_json_hex_encodes_wrapped_key() {
        let record = KeyRecord::new_active(
            Uuid::new_v4(),
            KeyTier::Intermediate,
            1,
            Algorithm::ChaCha20Poly1305,
            vec![0xde, 0xad],
            Some(1),
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"dead\""));
        let back: KeyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
