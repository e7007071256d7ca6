//! Backend integration tests
//!
//! The ignored tests need a running PostgreSQL and Redis configured via
//! DATABASE_URL, ENCRYPTION_KEY and REDIS_URL.
//!
//! Run with: cargo test --test integration_test -- --ignored

mod fixtures;

use std::time::Duration;

use carrier_verify::{
    db::{self, queries::PgJobStore},
    models::{
        job::{JobStatus, Transition, VerificationJob},
        subject::Subject,
    },
    services::{
        encryption::EncryptionService,
        rate_limit::{RateDecision, RateLimitPolicy, RateLimiter, RedisRateLimiter},
        store::{JobStore, StoreError},
    },
};
use uuid::Uuid;

use fixtures::*;

fn env(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} must be set"))
}

async fn pg_store() -> PgJobStore {
    db::connect_job_store(&env("DATABASE_URL"), &env("ENCRYPTION_KEY"))
        .await
        .expect("Failed to initialize job store")
}

/// A subject whose NPN is unique to this run, so reruns never collide with
/// rows left behind by earlier ones.
fn unique_subject() -> Subject {
    let npn = Uuid::new_v4().as_u128() % 1_000_000_000;
    Subject {
        npn: format!("{npn:09}"),
        ..subject_a()
    }
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_pg_job_lifecycle() {
    let store = pg_store().await;
    store.health_check().await.expect("Database health check failed");
    assert_eq!(store.backend(), "postgres");

    let subject = unique_subject();
    let job = VerificationJob::new(subject.clone());
    store.insert(&job).await.expect("Failed to insert job");

    // Subject survives encryption at rest.
    let loaded = store.get(job.id).await.unwrap().expect("job exists");
    assert_eq!(loaded.subject, subject);
    assert_eq!(loaded.status, JobStatus::Pending);

    let active = store.find_active(&job.subject_key).await.unwrap();
    assert_eq!(active.map(|j| j.id), Some(job.id));
    assert!(store
        .list_active()
        .await
        .unwrap()
        .iter()
        .any(|j| j.id == job.id));

    store
        .apply(job.id, Transition::Reposition { position: 2 })
        .await
        .unwrap();
    store.apply(job.id, Transition::Start).await.unwrap();
    store
        .apply(
            job.id,
            Transition::Progress {
                percent: 80,
                message: "matching appointments".into(),
            },
        )
        .await
        .unwrap();

    // Progress never regresses, even when stale updates arrive late.
    let job_after = store
        .apply(
            job.id,
            Transition::Progress {
                percent: 35,
                message: "late update".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(job_after.progress, 80);

    let done = store
        .apply(
            job.id,
            Transition::Complete {
                carriers: EXPECTED_CARRIERS.iter().map(|c| c.to_string()).collect(),
                files: vec!["appointments/aetna.pdf".into()],
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.completed_at.is_some());

    let reloaded = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.result_carriers, EXPECTED_CARRIERS);

    // Terminal jobs refuse further transitions.
    let err = store.apply(job.id, Transition::Start).await.unwrap_err();
    assert!(matches!(err, StoreError::Transition(_)));
    assert!(store.find_active(&job.subject_key).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_pg_rejects_second_active_job_for_subject() {
    let store = pg_store().await;
    let subject = unique_subject();

    let first = VerificationJob::new(subject.clone());
    store.insert(&first).await.unwrap();

    let second = VerificationJob::new(subject.clone());
    let err = store.insert(&second).await.unwrap_err();
    assert!(matches!(err, StoreError::ActiveJobExists(_)));

    // Once the first job finishes the subject may be verified again.
    store.apply(first.id, Transition::Start).await.unwrap();
    store
        .apply(
            first.id,
            Transition::Fail {
                message: "carrier portal unavailable".into(),
            },
        )
        .await
        .unwrap();
    store.insert(&second).await.expect("subject is free again");
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_pg_unknown_job() {
    let store = pg_store().await;
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    let err = store
        .apply(Uuid::new_v4(), Transition::Start)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_pg_worker_lease_is_exclusive_across_connections() {
    let first = pg_store().await;
    let second = pg_store().await;

    let lease = first
        .try_acquire_worker_lease()
        .await
        .unwrap()
        .expect("no other worker holds the lease");
    assert!(second.try_acquire_worker_lease().await.unwrap().is_none());

    // Dropping the lease closes its session and frees the advisory lock.
    drop(lease);
    let mut reacquired = None;
    for _ in 0..50 {
        reacquired = second.try_acquire_worker_lease().await.unwrap();
        if reacquired.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reacquired.is_some());
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_rate_limiter_window() {
    let limiter = RedisRateLimiter::new(
        &env("REDIS_URL"),
        RateLimitPolicy {
            max_submissions: 2,
            window: Duration::from_secs(60),
        },
    )
    .expect("Failed to initialize Redis limiter");
    limiter.health_check().await.expect("Redis health check failed");

    let key = unique_subject().key();
    assert_eq!(limiter.check(&key).await.unwrap(), RateDecision::Allowed);
    assert_eq!(limiter.check(&key).await.unwrap(), RateDecision::Allowed);

    let decision = limiter.check(&key).await.unwrap();
    let retry = decision.retry_after_seconds().expect("third attempt is limited");
    assert!((1..=60).contains(&retry), "retry after {retry}s");

    // Other subjects are unaffected.
    let other = unique_subject().key();
    assert_eq!(limiter.check(&other).await.unwrap(), RateDecision::Allowed);
}

/// Subjects are sealed at rest and open back to the same value.
#[test]
fn test_subject_encryption_roundtrip() {
    let key = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [7u8; 32]);
    let encryption = EncryptionService::new(&key).expect("Failed to create encryption service");

    let subject = subject_a();
    let sealed = encryption.seal(&subject).expect("Encryption failed");
    assert!(!String::from_utf8_lossy(&sealed).contains(&subject.npn));

    let opened: Subject = encryption.open(&sealed).expect("Decryption failed");
    assert_eq!(opened, subject);
}
