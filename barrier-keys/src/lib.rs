//! Barrier key hierarchy for Armoricore services
//!
//! Three tiers of keys protect caller data: an unseal key rebuilt from an
//! operator secret wraps root keys, root keys wrap intermediate keys, and
//! intermediate keys encrypt payloads. Only wrapped keys are persisted.
//! Every tier is versioned and rotates without losing access to what older
//! versions encrypted.
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


pub mod barrier;
pub mod cache;
pub mod content;
pub mod crypto;
pub mod error;
pub mod intermediate;
pub mod key_types;
pub mod repository;
pub mod retry;
pub mod root;
pub mod service_integration;
pub mod tier;
pub mod unseal;

pub use barrier::{Barrier, BarrierConfig, BarrierStatus, RotationOutcome};
pub use cache::KeyCache;
pub use content::ContentCipher;
pub use crypto::{Algorithm, KeyMaterial};
pub use error::{KeyError, KeyResult};
pub use intermediate::IntermediateKeyService;
pub use key_types::{KeyRecord, KeyStatus, KeyTier};
pub use repository::{
    ChangeSet, KeyChange, KeyRepository, MemoryKeyRepository, PostgresKeyRepository,
    SqliteKeyRepository,
};
pub use retry::{RetryConfig, StoragePolicy};
pub use root::RootKeyService;
pub use service_integration::*;
pub use tier::WrappingKey;
pub use unseal::{
    EnvSecretSource, KdfParams, SealStatus, StaticSecretSource, UnsealKeyService, UnsealSecret,
    UnsealSecretSource, UNSEAL_SECRET_ENV,
};
