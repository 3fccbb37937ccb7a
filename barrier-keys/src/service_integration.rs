//! Service integration helpers for hosting the barrier in a service
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


use crate::barrier::{Barrier, BarrierConfig};
use crate::error::KeyResult;
use crate::repository::open_repository;
use crate::unseal::{EnvSecretSource, UnsealSecretSource};
use barrier_config::{BarrierSettings, StorageSettings};
use std::sync::Arc;
use tracing::{info, warn};

/// Initialize the barrier for a service
///
/// Opens the configured repository and unseals from `BARRIER_UNSEAL_SECRET`
/// when it is set. Without it the barrier is returned sealed and waits for
/// an operator to call `unseal`.
pub async fn init_barrier(settings: &BarrierSettings) -> KeyResult<Arc<Barrier>> {
    init_barrier_with_source(settings, &EnvSecretSource::default()).await
}

/// Initialize the barrier, unsealing from `source` if it holds a secret
pub async fn init_barrier_with_source(
    settings: &BarrierSettings,
    source: &dyn UnsealSecretSource,
) -> KeyResult<Arc<Barrier>> {
    let config = BarrierConfig::from_settings(settings)?;

    // Postgres URLs may carry credentials; only the backend kind is logged
    let storage = match &settings.storage {
        StorageSettings::Sqlite { .. } => "sqlite",
        StorageSettings::Postgres { .. } => "postgres",
        StorageSettings::Memory => "memory",
    };
    info!(
        storage = storage,
        algorithm = %config.algorithm,
        "Initializing barrier"
    );

    let repo = open_repository(&settings.storage).await?;
    let barrier = Arc::new(Barrier::new(repo, config));

    if !barrier.unseal_from(source).await? {
        warn!(
            source = %source.describe(),
            "No unseal secret available, barrier starts sealed"
        );
    }

    Ok(barrier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use crate::unseal::{StaticSecretSource, UnsealSecret};
    use std::collections::HashMap;

    fn memory_settings() -> BarrierSettings {
        let vars: HashMap<&str, &str> = [("BARRIER_STORAGE", "memory")].into_iter().collect();
        BarrierSettings::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_init_unseals_from_source() {
        let source = StaticSecretSource::new(UnsealSecret::from_key([3u8; KEY_LEN]));
        let barrier = init_barrier_with_source(&memory_settings(), &source).await.unwrap();
        assert!(!barrier.is_sealed().await);

        let (ct, version) = barrier.encrypt_key(b"service secret").await.unwrap();
        assert_eq!(barrier.decrypt_key(&ct, version).await.unwrap(), b"service secret");
    }

    #[tokio::test]
    async fn test_init_without_secret_stays_sealed() {
        let source = EnvSecretSource::new("BARRIER_TEST_SECRET_THAT_IS_NEVER_SET");
        let barrier = init_barrier_with_source(&memory_settings(), &source).await.unwrap();
        assert!(barrier.is_sealed().await);
    }
}
