//! Concurrent use and storage failure tests

mod common;

use barrier_keys::{
    Barrier, KeyError, KeyRepository, KeyStatus, KeyTier, MemoryKeyRepository, SealStatus,
};
use common::{
    impatient_config, secret, test_config, uncached_config, unsealed_barrier, FaultyRepository,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_encrypts_racing_rotations_all_decrypt() {
    let repo = Arc::new(MemoryKeyRepository::new());
    let barrier = Arc::new(unsealed_barrier(repo, test_config()).await);

    let mut handles = Vec::new();
    for task in 0..16u32 {
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let mut produced = Vec::new();
            for i in 0..10u32 {
                let plaintext = format!("task {} item {}", task, i).into_bytes();
                let (ct, version) = barrier.encrypt_key(&plaintext).await.unwrap();
                produced.push((ct, version, plaintext));
            }
            produced
        }));
    }

    let rotator = {
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            for _ in 0..3 {
                barrier.rotate(KeyTier::Intermediate, "concurrent").await.unwrap();
                barrier.rotate(KeyTier::Root, "concurrent").await.unwrap();
            }
        })
    };

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    rotator.await.unwrap();

    for (ct, version, plaintext) in &all {
        assert_eq!(&barrier.decrypt_key(ct, *version).await.unwrap(), plaintext);
    }
    let status = barrier.status().await.unwrap();
    assert_eq!(status.active_versions.get(&KeyTier::Intermediate), Some(&4));
    assert_eq!(status.active_versions.get(&KeyTier::Root), Some(&4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rotations_of_one_tier_serialise() {
    let repo = Arc::new(MemoryKeyRepository::new());
    let barrier = Arc::new(unsealed_barrier(repo.clone(), test_config()).await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.rotate(KeyTier::Intermediate, "race").await.unwrap()
        }));
    }
    let mut new_versions = Vec::new();
    for handle in handles {
        new_versions.push(handle.await.unwrap().new_version);
    }
    new_versions.sort_unstable();
    assert_eq!(new_versions, (2..=9).collect::<Vec<u32>>());

    let records = repo.list(KeyTier::Intermediate).await.unwrap();
    assert_eq!(records.iter().filter(|r| r.is_active()).count(), 1);
    assert_eq!(repo.get_active(KeyTier::Intermediate).await.unwrap().version, 9);
}

#[tokio::test]
async fn test_failed_rotation_leaves_previous_state() {
    let repo = Arc::new(FaultyRepository::new());
    let barrier = unsealed_barrier(repo.clone(), test_config()).await;
    let (ct, version) = barrier.encrypt_key(b"before failure").await.unwrap();

    repo.fail_commits(true);
    for tier in [KeyTier::Root, KeyTier::Intermediate] {
        assert!(matches!(
            barrier.rotate(tier, "doomed").await,
            Err(KeyError::StorageUnavailable(_))
        ));
    }
    assert!(matches!(
        barrier.rotate_unseal(secret(9), "doomed").await,
        Err(KeyError::StorageUnavailable(_))
    ));

    // Nothing was written and the old keys stay authoritative
    for tier in KeyTier::ALL {
        assert_eq!(repo.list_versions(tier).await.unwrap(), vec![1]);
        assert_eq!(repo.get(tier, 1).await.unwrap().status, KeyStatus::Active);
    }
    let (_, still) = barrier.encrypt_key(b"during failure").await.unwrap();
    assert_eq!(still, 1);

    barrier.seal().await;
    barrier.unseal(secret(1)).await.unwrap();
    assert_eq!(barrier.decrypt_key(&ct, version).await.unwrap(), b"before failure");

    repo.fail_commits(false);
    let outcome = barrier.rotate(KeyTier::Intermediate, "retry").await.unwrap();
    assert_eq!((outcome.previous_version, outcome.new_version), (1, 2));
}

#[tokio::test]
async fn test_reads_are_retried() {
    let repo = Arc::new(FaultyRepository::new());
    let barrier = unsealed_barrier(repo.clone(), uncached_config()).await;
    let (ct, version) = barrier.encrypt_key(b"flaky storage").await.unwrap();

    repo.fail_next_reads(2);
    assert_eq!(barrier.decrypt_key(&ct, version).await.unwrap(), b"flaky storage");
}

#[tokio::test]
async fn test_persistent_read_failure_surfaces() {
    let repo = Arc::new(FaultyRepository::new());
    let barrier = unsealed_barrier(repo.clone(), uncached_config()).await;
    let (ct, version) = barrier.encrypt_key(b"unreachable").await.unwrap();

    repo.fail_next_reads(usize::MAX);
    let before = repo.reads.load(Ordering::SeqCst);
    assert!(matches!(
        barrier.decrypt_key(&ct, version).await,
        Err(KeyError::StorageUnavailable(_))
    ));
    // One attempt plus three retries
    assert_eq!(repo.reads.load(Ordering::SeqCst) - before, 4);
}

#[tokio::test]
async fn test_cached_keys_survive_storage_outage() {
    let repo = Arc::new(FaultyRepository::new());
    let barrier = unsealed_barrier(repo.clone(), test_config()).await;
    let (ct, version) = barrier.encrypt_key(b"cached").await.unwrap();

    repo.fail_next_reads(usize::MAX);
    assert_eq!(barrier.decrypt_key(&ct, version).await.unwrap(), b"cached");
    repo.fail_next_reads(0);
}

#[tokio::test]
async fn test_unseal_fails_cleanly_when_storage_is_down() {
    let repo = Arc::new(FaultyRepository::new());
    {
        let barrier = unsealed_barrier(repo.clone(), test_config()).await;
        barrier.shutdown().await;
    }

    let barrier = Barrier::new(repo.clone(), test_config());
    repo.fail_next_reads(usize::MAX);
    assert!(matches!(
        barrier.unseal(secret(1)).await,
        Err(KeyError::StorageUnavailable(_))
    ));
    assert!(barrier.is_sealed().await);

    repo.fail_next_reads(0);
    barrier.unseal(secret(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_encrypts_across_one_rotation_use_old_or_new_version() {
    let repo = Arc::new(MemoryKeyRepository::new());
    let barrier = Arc::new(unsealed_barrier(repo, test_config()).await);

    let mut handles = Vec::new();
    for task in 0..8u32 {
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let mut produced = Vec::new();
            for i in 0..20u32 {
                let plaintext = format!("task {} item {}", task, i).into_bytes();
                let (ct, version) = barrier.encrypt_key(&plaintext).await.unwrap();
                produced.push((ct, version, plaintext));
                tokio::task::yield_now().await;
            }
            produced
        }));
    }
    let outcome = barrier.rotate(KeyTier::Intermediate, "single").await.unwrap();
    assert_eq!((outcome.previous_version, outcome.new_version), (1, 2));

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let versions: BTreeSet<u32> = all.iter().map(|(_, version, _)| *version).collect();
    assert!(versions.is_subset(&BTreeSet::from([1, 2])), "versions {:?}", versions);
    for (ct, version, plaintext) in &all {
        assert_eq!(&barrier.decrypt_key(ct, *version).await.unwrap(), plaintext);
    }
    assert_eq!(barrier.encrypt_key(b"after").await.unwrap().1, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_decrypts_succeed_during_unseal_rotation() {
    let repo = Arc::new(MemoryKeyRepository::new());
    let barrier = Arc::new(unsealed_barrier(repo, uncached_config()).await);

    let mut ciphertexts = Vec::new();
    for i in 0..4u8 {
        let plaintext = vec![i; 24];
        let (ct, version) = barrier.encrypt_key(&plaintext).await.unwrap();
        ciphertexts.push((ct, version, plaintext));
        barrier.rotate(KeyTier::Intermediate, "spread").await.unwrap();
    }
    let ciphertexts = Arc::new(ciphertexts);
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let barrier = Arc::clone(&barrier);
        let ciphertexts = Arc::clone(&ciphertexts);
        let stop = Arc::clone(&stop);
        readers.push(tokio::spawn(async move {
            let mut decrypted = 0usize;
            loop {
                for (ct, version, plaintext) in ciphertexts.iter() {
                    assert_eq!(&barrier.decrypt_key(ct, *version).await.unwrap(), plaintext);
                    decrypted += 1;
                }
                if stop.load(Ordering::SeqCst) {
                    return decrypted;
                }
            }
        }));
    }

    for (next, byte) in [(2, 2u8), (3, 3u8)] {
        let outcome = barrier.rotate_unseal(secret(byte), "handover").await.unwrap();
        assert_eq!(outcome.new_version, next);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop.store(true, Ordering::SeqCst);

    let mut total = 0;
    for reader in readers {
        total += reader.await.unwrap();
    }
    assert!(total > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cached_encrypt_is_not_blocked_by_unseal_rotation() {
    let repo = Arc::new(FaultyRepository::new());
    let barrier = Arc::new(unsealed_barrier(repo.clone(), test_config()).await);
    barrier.encrypt_key(b"warm").await.unwrap();

    repo.delay_reads(Duration::from_millis(200));
    let rotation = {
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move { barrier.rotate_unseal(secret(2), "slow storage").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let (_, version) = barrier.encrypt_key(b"while rotating").await.unwrap();
    assert_eq!(version, 1);
    assert!(started.elapsed() < Duration::from_millis(150), "took {:?}", started.elapsed());

    let outcome = rotation.await.unwrap().unwrap();
    assert_eq!(outcome.new_version, 2);
    repo.delay_reads(Duration::ZERO);
}

#[tokio::test]
async fn test_timed_out_rotation_commit_is_picked_up() {
    let repo = Arc::new(FaultyRepository::new());
    let barrier = unsealed_barrier(repo.clone(), impatient_config()).await;
    let (ct, version) = barrier.encrypt_key(b"before").await.unwrap();
    assert_eq!(version, 1);

    // The write lands but the answer never arrives in time
    repo.stall_commits(true);
    assert!(matches!(
        barrier.rotate(KeyTier::Intermediate, "stalled").await,
        Err(KeyError::StorageUnavailable(_))
    ));
    repo.stall_commits(false);

    assert_eq!(repo.get_active(KeyTier::Intermediate).await.unwrap().version, 2);
    let (new_ct, new_version) = barrier.encrypt_key(b"after").await.unwrap();
    assert_eq!(new_version, 2);
    assert_eq!(barrier.decrypt_key(&new_ct, new_version).await.unwrap(), b"after");
    assert_eq!(barrier.decrypt_key(&ct, version).await.unwrap(), b"before");
}

#[tokio::test]
async fn test_timed_out_unseal_rotation_commit_adopts_new_key() {
    let repo = Arc::new(FaultyRepository::new());
    let barrier = unsealed_barrier(repo.clone(), impatient_config()).await;
    let (ct, version) = barrier.encrypt_key(b"before").await.unwrap();

    repo.stall_commits(true);
    let outcome = barrier.rotate_unseal(secret(2), "stalled").await.unwrap();
    repo.stall_commits(false);
    assert_eq!((outcome.previous_version, outcome.new_version), (1, 2));
    assert_eq!(repo.get_active(KeyTier::Unseal).await.unwrap().version, 2);

    // Root keys now wrapped under unseal v2 still open
    barrier.rotate(KeyTier::Root, "after handover").await.unwrap();
    assert_eq!(barrier.decrypt_key(&ct, version).await.unwrap(), b"before");

    barrier.seal().await;
    barrier.unseal(secret(2)).await.unwrap();
    assert_eq!(barrier.decrypt_key(&ct, version).await.unwrap(), b"before");
}

#[tokio::test]
async fn test_unknown_unseal_rotation_outcome_seals() {
    let repo = Arc::new(FaultyRepository::new());
    let barrier = unsealed_barrier(repo.clone(), test_config()).await;
    let (ct, version) = barrier.encrypt_key(b"before").await.unwrap();

    repo.fail_commits(true);
    repo.fail_reads_after_commit(usize::MAX);
    assert!(matches!(
        barrier.rotate_unseal(secret(2), "blind").await,
        Err(KeyError::StorageUnavailable(_))
    ));
    assert!(barrier.is_sealed().await);

    repo.fail_commits(false);
    repo.fail_next_reads(0);
    barrier.unseal(secret(1)).await.unwrap();
    assert_eq!(barrier.decrypt_key(&ct, version).await.unwrap(), b"before");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seal_during_unseal_wins() {
    let repo = Arc::new(FaultyRepository::new());
    {
        let barrier = unsealed_barrier(repo.clone(), test_config()).await;
        barrier.shutdown().await;
    }

    let barrier = Arc::new(Barrier::new(repo.clone(), test_config()));
    repo.delay_reads(Duration::from_millis(100));
    let unsealing = {
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move { barrier.unseal(secret(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(barrier.unseal_service().status().await, SealStatus::Unsealing);

    barrier.seal().await;
    assert!(matches!(unsealing.await.unwrap(), Err(KeyError::Sealed)));
    assert!(barrier.is_sealed().await);
    assert!(matches!(barrier.encrypt_key(b"x").await, Err(KeyError::Sealed)));

    repo.delay_reads(Duration::ZERO);
    barrier.unseal(secret(1)).await.unwrap();
    assert_eq!(barrier.encrypt_key(b"x").await.unwrap().1, 1);
}
