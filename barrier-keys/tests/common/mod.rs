//! Shared fixtures for barrier integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use barrier_keys::{
    Barrier, BarrierConfig, ChangeSet, KdfParams, KeyError, KeyRecord, KeyRepository, KeyResult,
    KeyTier, MemoryKeyRepository, RetryConfig, StoragePolicy, UnsealSecret,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn secret(byte: u8) -> UnsealSecret {
    UnsealSecret::from_key([byte; 32])
}

/// Fast settings: cheap KDF, short retry delays
pub fn test_config() -> BarrierConfig {
    BarrierConfig {
        storage: StoragePolicy::new(
            Duration::from_secs(2),
            RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0),
        ),
        kdf: KdfParams {
            m_cost: 256,
            t_cost: 1,
            p_cost: 1,
        },
        ..BarrierConfig::default()
    }
}

/// Storage calls give up after 100ms
pub fn impatient_config() -> BarrierConfig {
    let mut config = test_config();
    config.storage = StoragePolicy::new(Duration::from_millis(100), RetryConfig::none());
    config
}

pub fn uncached_config() -> BarrierConfig {
    BarrierConfig {
        cache_capacity: 0,
        ..test_config()
    }
}

pub async fn unsealed_barrier(repo: Arc<dyn KeyRepository>, config: BarrierConfig) -> Barrier {
    let _ = barrier_logging::try_init_test_logging();
    let barrier = Barrier::new(repo, config);
    barrier.unseal(secret(1)).await.unwrap();
    barrier
}

/// Memory repository that fails or stalls on demand
#[derive(Default)]
pub struct FaultyRepository {
    inner: MemoryKeyRepository,
    fail_commits: AtomicBool,
    /// Apply commits, then hang before answering
    stall_commits: AtomicBool,
    /// Number of upcoming reads that fail with `StorageUnavailable`
    failing_reads: AtomicUsize,
    /// Reads to fail once a commit has failed
    reads_failing_after_commit: AtomicUsize,
    read_delay_ms: AtomicU64,
    pub reads: AtomicUsize,
}

impl FaultyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn stall_commits(&self, stall: bool) {
        self.stall_commits.store(stall, Ordering::SeqCst);
    }

    pub fn fail_reads_after_commit(&self, count: usize) {
        self.reads_failing_after_commit.store(count, Ordering::SeqCst);
    }

    pub fn delay_reads(&self, delay: Duration) {
        self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn read(&self) -> KeyResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let take = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match take {
            Ok(_) => Err(KeyError::StorageUnavailable("injected read failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl KeyRepository for FaultyRepository {
    async fn get(&self, tier: KeyTier, version: u32) -> KeyResult<KeyRecord> {
        self.read().await?;
        self.inner.get(tier, version).await
    }

    async fn get_active(&self, tier: KeyTier) -> KeyResult<KeyRecord> {
        self.read().await?;
        self.inner.get_active(tier).await
    }

    async fn list_versions(&self, tier: KeyTier) -> KeyResult<Vec<u32>> {
        self.read().await?;
        self.inner.list_versions(tier).await
    }

    async fn list(&self, tier: KeyTier) -> KeyResult<Vec<KeyRecord>> {
        self.read().await?;
        self.inner.list(tier).await
    }

    async fn commit(&self, changes: ChangeSet) -> KeyResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            let then_fail = self.reads_failing_after_commit.swap(0, Ordering::SeqCst);
            if then_fail > 0 {
                self.failing_reads.store(then_fail, Ordering::SeqCst);
            }
            return Err(KeyError::StorageUnavailable("injected commit failure".to_string()));
        }
        self.inner.commit(changes).await?;
        if self.stall_commits.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "faulty-memory"
    }
}
