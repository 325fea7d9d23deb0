mod common;

use std::sync::{Arc, Barrier};

use anyhow::Result;
use common::{acquire_db_lock, TestApp};
use serde_json::json;
use uuid::Uuid;

use studydesk::cache::{self, CacheLookup, SizingHints};
use studydesk::quota;
use studydesk::registry;
use studydesk::selection::{GenerationKey, GenerationMode};

fn sample_key(content_hash: &str, unit: i32) -> GenerationKey {
    GenerationKey::page(content_hash, unit, "v3", "en", GenerationMode::Explain)
}

fn sample_hash(tag: &str) -> String {
    studydesk::selection::content_hash(tag.as_bytes())
}

#[tokio::test]
async fn lookup_misses_then_hits_after_completion() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = sample_hash("lookup-doc");
    let key = sample_key(&hash, 1);
    let user = Uuid::new_v4();

    let (outcome, before, after) = app
        .with_conn(move |conn| {
            registry::upsert_document(conn, &key.content_hash, Some(10), None)?;
            let before = cache::lookup(conn, &key)?;
            let outcome =
                cache::try_start_generation(conn, &key, user, 1, SizingHints::default())?;
            cache::complete_generation(conn, outcome.job.id, json!({ "content": "done" }))?;
            let after = cache::lookup(conn, &key)?;
            Ok((outcome, before, after))
        })
        .await?;

    assert!(matches!(before, CacheLookup::NotFound));
    assert!(outcome.started);
    match after {
        CacheLookup::Ready(payload) => assert_eq!(payload["content"], "done"),
        other => panic!("expected ready, got {other:?}"),
    }

    app.cleanup().await
}

#[tokio::test]
async fn losing_requester_observes_the_same_job() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = sample_hash("loser-doc");
    let key = sample_key(&hash, 2);

    let (first, second) = app
        .with_conn(move |conn| {
            let first =
                cache::try_start_generation(conn, &key, Uuid::new_v4(), 1, SizingHints::default())?;
            let second =
                cache::try_start_generation(conn, &key, Uuid::new_v4(), 1, SizingHints::default())?;
            Ok((first, second))
        })
        .await?;

    assert!(first.started);
    assert!(!second.started);
    assert_eq!(first.job.id, second.job.id);

    // Only the winner is charged.
    let job_id = first.job.id;
    let charges = app
        .with_conn(move |conn| Ok(quota::charges_for_job(conn, job_id)?))
        .await?;
    assert_eq!(charges.len(), 1);

    app.cleanup().await
}

#[tokio::test]
async fn concurrent_inserts_elect_exactly_one_generator() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = sample_hash("race-doc");
    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let pool = app.state.pool.clone();
        let barrier = barrier.clone();
        let key = sample_key(&hash, 3);
        handles.push(tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().expect("pooled connection");
            barrier.wait();
            cache::try_start_generation(&mut conn, &key, Uuid::new_v4(), 1, SizingHints::default())
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.expect("join")?);
    }

    let winners = outcomes.iter().filter(|outcome| outcome.started).count();
    assert_eq!(winners, 1);
    assert_eq!(outcomes[0].job.id, outcomes[1].job.id);

    app.cleanup().await
}

#[tokio::test]
async fn failed_jobs_are_revived_in_place() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = sample_hash("revive-doc");
    let key = sample_key(&hash, 4);
    let user = Uuid::new_v4();

    let (first_id, revived) = app
        .with_conn(move |conn| {
            let first =
                cache::try_start_generation(conn, &key, user, 1, SizingHints::default())?;
            cache::fail_generation(conn, first.job.id, "model exploded", true)?;
            let revived =
                cache::try_start_generation(conn, &key, user, 1, SizingHints::default())?;
            Ok((first.job.id, revived))
        })
        .await?;

    assert!(revived.started, "failed row should be revived");
    assert_eq!(revived.job.id, first_id, "revival reuses the row");
    assert_eq!(revived.job.attempts, 0);
    assert_eq!(revived.job.status, cache::STATUS_GENERATING);
    assert!(revived.job.last_error.is_none());

    app.cleanup().await
}

#[tokio::test]
async fn refunds_are_recorded_exactly_once() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = sample_hash("refund-doc");
    let key = sample_key(&hash, 5);
    let user = Uuid::new_v4();

    let job_id = app
        .with_conn(move |conn| {
            let outcome =
                cache::try_start_generation(conn, &key, user, 1, SizingHints::default())?;
            // Double invocation must not double-refund.
            cache::fail_generation(conn, outcome.job.id, "boom", true)?;
            cache::fail_generation(conn, outcome.job.id, "boom again", true)?;
            Ok(outcome.job.id)
        })
        .await?;

    let (charges, refunded) = app
        .with_conn(move |conn| {
            let charges = quota::charges_for_job(conn, job_id)?;
            let refunded = quota::refunded_count_for_job(conn, job_id)?;
            Ok((charges, refunded))
        })
        .await?;
    assert_eq!(charges.len(), 1);
    assert_eq!(refunded, 1);
    assert!(charges[0].refunded_at.is_some());

    app.cleanup().await
}

#[tokio::test]
async fn restart_replaces_ready_results() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = sample_hash("restart-doc");
    let key = sample_key(&hash, 6);
    let user = Uuid::new_v4();

    let (plain, forced) = app
        .with_conn(move |conn| {
            let first =
                cache::try_start_generation(conn, &key, user, 1, SizingHints::default())?;
            cache::complete_generation(conn, first.job.id, json!({ "content": "v1" }))?;

            // A plain start shares the cached result; a forced restart does not.
            let plain = cache::try_start_generation(conn, &key, user, 1, SizingHints::default())?;
            let forced = cache::restart_generation(conn, &key, user, 1, SizingHints::default())?;
            Ok((plain, forced))
        })
        .await?;

    assert!(!plain.started);
    assert_eq!(plain.job.status, cache::STATUS_READY);
    assert!(forced.started);
    assert_eq!(forced.job.status, cache::STATUS_GENERATING);
    assert!(forced.job.result_payload.is_none());

    app.cleanup().await
}

#[tokio::test]
async fn reference_counting_is_idempotent() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = sample_hash("ref-doc");
    let file_a = Uuid::new_v4();
    let file_b = Uuid::new_v4();

    let counts = app
        .with_conn(move |conn| {
            registry::upsert_document(conn, &hash, Some(12), None)?;
            registry::add_reference(conn, registry::REF_TYPE_FILE, file_a, &hash)?;
            registry::add_reference(conn, registry::REF_TYPE_FILE, file_a, &hash)?;
            registry::add_reference(conn, registry::REF_TYPE_FILE, file_b, &hash)?;
            let after_adds = registry::get_document(conn, &hash)?.expect("document");

            registry::remove_reference(conn, registry::REF_TYPE_FILE, file_a)?;
            registry::remove_reference(conn, registry::REF_TYPE_FILE, file_a)?;
            let after_removes = registry::get_document(conn, &hash)?.expect("document");

            registry::remove_reference(conn, registry::REF_TYPE_FILE, file_b)?;
            registry::remove_reference(conn, registry::REF_TYPE_FILE, file_b)?;
            let drained = registry::get_document(conn, &hash)?.expect("document");
            Ok((
                after_adds.reference_count,
                after_removes.reference_count,
                drained.reference_count,
            ))
        })
        .await?;

    assert_eq!(counts, (2, 1, 0));

    app.cleanup().await
}
