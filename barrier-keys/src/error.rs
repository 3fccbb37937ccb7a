//! Error types for the barrier
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


use crate::key_types::KeyTier;
use thiserror::Error;

/// Barrier errors
///
/// Messages name the tier and version involved but never carry key material
/// or plaintext.
#[derive(Error, Debug)]
pub enum KeyError {
    /// The unseal key is not available; every crypto operation is blocked.
    #[error("Barrier is sealed")]
    Sealed,

    #[error("Key not found: {tier} version {version}")]
    KeyNotFound { tier: KeyTier, version: u32 },

    #[error("No active key for tier {0}")]
    NoActiveKey(KeyTier),

    #[error("Key revoked: {tier} version {version}")]
    KeyRevoked { tier: KeyTier, version: u32 },

    /// A write collided with existing state. Never retried blindly.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backend is unreachable or timed out. Retryable with backoff.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Authenticated decryption failed: wrong key, tampering or a swapped
    /// version tag.
    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Barrier has been shut down")]
    Closed,
}

impl KeyError {
    /// Whether the caller may retry the operation with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeyError::StorageUnavailable(_))
    }

    /// Whether the error means "service not ready" rather than a failure
    pub fn is_sealed(&self) -> bool {
        matches!(self, KeyError::Sealed)
    }
}

impl From<rusqlite::Error> for KeyError {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &error {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                return KeyError::Conflict(error.to_string());
            }
        }
        KeyError::StorageUnavailable(error.to_string())
    }
}

impl From<tokio_postgres::Error> for KeyError {
    fn from(error: tokio_postgres::Error) -> Self {
        if error.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
            return KeyError::Conflict(error.to_string());
        }
        KeyError::StorageUnavailable(error.to_string())
    }
}

/// Result type for barrier operations
pub type KeyResult<T> = Result<T, KeyError>;
