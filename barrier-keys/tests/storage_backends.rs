//! Barrier over persistent repositories
//!
//! SQLite runs everywhere. PostgreSQL needs a disposable database named by
//! `BARRIER_TEST_DATABASE_URL`; its tables are emptied by the test.

mod common;

use barrier_keys::{
    init_barrier_with_source, Barrier, ChangeSet, KeyError, KeyRecord, KeyRepository, KeyStatus,
    KeyTier, PostgresKeyRepository, SqliteKeyRepository, StaticSecretSource,
};
use barrier_config::BarrierSettings;
use common::{secret, test_config};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

async fn exercise_reopen<F, Fut>(open: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Arc<dyn KeyRepository>>,
{
    let (ct, version, envelope) = {
        let barrier = Barrier::new(open().await, test_config());
        barrier.unseal(secret(1)).await.unwrap();
        let (ct, version) = barrier.encrypt_key(b"persisted").await.unwrap();
        let envelope = barrier.encrypt_content(b"persisted content").await.unwrap();
        barrier.rotate(KeyTier::Intermediate, "test").await.unwrap();
        barrier.rotate(KeyTier::Root, "test").await.unwrap();
        barrier.rotate_unseal(secret(2), "test").await.unwrap();
        barrier.shutdown().await;
        (ct, version, envelope)
    };

    let barrier = Barrier::new(open().await, test_config());
    assert!(matches!(
        barrier.unseal(secret(1)).await,
        Err(KeyError::IntegrityFailure(_))
    ));
    barrier.unseal(secret(2)).await.unwrap();
    assert_eq!(barrier.decrypt_key(&ct, version).await.unwrap(), b"persisted");
    assert_eq!(barrier.decrypt_content(&envelope).await.unwrap(), b"persisted content");

    let repo = barrier.repository();
    for tier in KeyTier::ALL {
        assert_eq!(repo.get_active(tier).await.unwrap().version, 2);
        assert_eq!(repo.get(tier, 1).await.unwrap().status, KeyStatus::Retired);
    }
}

async fn exercise_atomic_commit(repo: Arc<dyn KeyRepository>) {
    let barrier = Barrier::new(Arc::clone(&repo), test_config());
    barrier.unseal(secret(1)).await.unwrap();
    let active = repo.get_active(KeyTier::Intermediate).await.unwrap();

    // A second active record without demoting the first must be rejected whole
    let extra = KeyRecord::new_active(
        Uuid::new_v4(),
        KeyTier::Intermediate,
        active.version + 1,
        active.algorithm,
        active.wrapped_key.clone(),
        active.wrapping_key_version,
    );
    let changes = ChangeSet::new()
        .set_status(KeyTier::Root, 1, KeyStatus::Active, KeyStatus::Retired)
        .insert(extra);
    assert!(matches!(repo.commit(changes).await, Err(KeyError::Conflict(_))));

    assert_eq!(repo.list_versions(KeyTier::Intermediate).await.unwrap(), vec![active.version]);
    assert_eq!(repo.get(KeyTier::Root, 1).await.unwrap().status, KeyStatus::Active);

    // Inserting an existing version is a conflict too
    assert!(matches!(repo.put(active.clone()).await, Err(KeyError::Conflict(_))));
}

#[tokio::test]
async fn test_sqlite_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("barrier.db");
    exercise_reopen(|| {
        let path = path.clone();
        async move {
            let repo: Arc<dyn KeyRepository> =
                Arc::new(SqliteKeyRepository::open(&path).await.unwrap());
            repo
        }
    })
    .await;
}

#[tokio::test]
async fn test_sqlite_commit_is_atomic() {
    let repo: Arc<dyn KeyRepository> = Arc::new(SqliteKeyRepository::open_in_memory().unwrap());
    exercise_atomic_commit(repo).await;
}

#[tokio::test]
async fn test_init_barrier_from_settings() {
    let dir = tempfile::tempdir().unwrap();
    let storage = format!("sqlite:{}", dir.path().join("service.db").display());
    let vars: HashMap<&str, String> = [
        ("BARRIER_STORAGE", storage),
        ("BARRIER_ALGORITHM", "chacha20-poly1305".to_string()),
    ]
    .into_iter()
    .collect();
    let settings = BarrierSettings::from_lookup(|key| vars.get(key).cloned()).unwrap();

    let source = StaticSecretSource::new(secret(5));
    let barrier = init_barrier_with_source(&settings, &source).await.unwrap();
    let status = barrier.status().await.unwrap();
    assert_eq!(status.backend, "sqlite");
    assert!(!barrier.is_sealed().await);

    let records = barrier.intermediate().records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].algorithm.as_str(), "chacha20-poly1305");
}

async fn postgres_repository(url: &str) -> Arc<dyn KeyRepository> {
    let repo: Arc<dyn KeyRepository> = Arc::new(PostgresKeyRepository::connect(url).await.unwrap());
    repo
}

async fn reset_postgres(url: &str) {
    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls).await.unwrap();
    tokio::spawn(connection);
    for tier in KeyTier::ALL {
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", tier.table_name()))
            .await
            .unwrap();
    }
}

#[tokio::test]
#[ignore] // Requires a PostgreSQL database in BARRIER_TEST_DATABASE_URL
async fn test_postgres_backend() {
    let Ok(url) = std::env::var("BARRIER_TEST_DATABASE_URL") else {
        eprintln!("BARRIER_TEST_DATABASE_URL not set, skipping");
        return;
    };

    reset_postgres(&url).await;
    exercise_reopen(|| postgres_repository(&url)).await;

    reset_postgres(&url).await;
    exercise_atomic_commit(postgres_repository(&url).await).await;
}
