//! In-memory cache of unwrapped key material
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


use crate::crypto::KeyMaterial;
use crate::key_types::KeyTier;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest lifetime of an entry; longer TTLs are clamped
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

struct CacheEntry {
    material: Arc<KeyMaterial>,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<(KeyTier, u32), CacheEntry>,
    /// Bumped on every invalidation of a tier
    epochs: HashMap<KeyTier, u64>,
}

/// Bounded map of `(tier, version)` to unwrapped key material
///
/// Expiry is checked on access against the monotonic clock. A capacity of
/// zero disables the cache: every lookup misses and puts are dropped.
pub struct KeyCache {
    state: RwLock<CacheState>,
    capacity: usize,
    default_ttl: Duration,
}

impl KeyCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::with_capacity(capacity),
                epochs: HashMap::new(),
            }),
            capacity,
            default_ttl,
        }
    }

    /// A cache that never holds anything
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0 && !self.default_ttl.is_zero()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, tier: KeyTier, version: u32) -> Option<Arc<KeyMaterial>> {
        let state = self.state.read();
        match state.entries.get(&(tier, version)) {
            Some(entry) if entry.expires_at > Instant::now() => Some(Arc::clone(&entry.material)),
            _ => None,
        }
    }

    pub fn put(&self, tier: KeyTier, version: u32, material: Arc<KeyMaterial>, ttl: Duration) {
        if !self.is_enabled() || ttl.is_zero() {
            return;
        }
        let mut state = self.state.write();
        self.insert(&mut state, tier, version, material, ttl);
    }

    /// Current invalidation epoch of a tier
    ///
    /// Read it before loading material from storage and hand it to
    /// `put_if_epoch`: material loaded before an invalidation is then never
    /// cached after it.
    pub fn epoch(&self, tier: KeyTier) -> u64 {
        self.state.read().epochs.get(&tier).copied().unwrap_or(0)
    }

    /// Insert unless the tier was invalidated since `epoch` was read
    pub fn put_if_epoch(
        &self,
        tier: KeyTier,
        version: u32,
        material: Arc<KeyMaterial>,
        ttl: Duration,
        epoch: u64,
    ) -> bool {
        if !self.is_enabled() || ttl.is_zero() {
            return false;
        }
        let mut state = self.state.write();
        if state.epochs.get(&tier).copied().unwrap_or(0) != epoch {
            return false;
        }
        self.insert(&mut state, tier, version, material, ttl);
        true
    }

    fn insert(
        &self,
        state: &mut CacheState,
        tier: KeyTier,
        version: u32,
        material: Arc<KeyMaterial>,
        ttl: Duration,
    ) {
        let now = Instant::now();
        let entries = &mut state.entries;

        if !entries.contains_key(&(tier, version)) && entries.len() >= self.capacity {
            entries.retain(|_, entry| entry.expires_at > now);
        }
        if !entries.contains_key(&(tier, version)) && entries.len() >= self.capacity {
            // Still full: drop whatever would expire first
            let victim = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| *key);
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }

        entries.insert(
            (tier, version),
            CacheEntry {
                material,
                expires_at: now + ttl.min(MAX_TTL),
            },
        );
    }

    /// Remove every entry of a tier
    pub fn invalidate_tier(&self, tier: KeyTier) {
        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|(entry_tier, _), _| *entry_tier != tier);
        *state.epochs.entry(tier).or_insert(0) += 1;
        debug!(tier = %tier, evicted = before - state.entries.len(), "Invalidated cache tier");
    }

    pub fn invalidate(&self, tier: KeyTier, version: u32) {
        let mut state = self.state.write();
        state.entries.remove(&(tier, version));
        *state.epochs.entry(tier).or_insert(0) += 1;
    }

    /// Drop every entry of every tier
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        for tier in KeyTier::ALL {
            *state.epochs.entry(tier).or_insert(0) += 1;
        }
    }

    /// Number of entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
