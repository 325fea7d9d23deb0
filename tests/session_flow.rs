mod common;

use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_vec, TestApp};
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use uuid::Uuid;

use studydesk::selection::content_hash;
use studydesk::session::{self, StartSession};
use studydesk::selection::GenerationMode;

#[derive(Debug, Deserialize)]
struct SessionSnapshot {
    id: Uuid,
    state: String,
    window_start: i32,
    window_end: i32,
    current_unit: i32,
    units_completed: Vec<i32>,
    units_in_progress: Vec<i32>,
    units_failed: Vec<i32>,
}

async fn register_document(app: &TestApp, hash: &str, total_units: i32) -> Result<()> {
    let response = app
        .post_json(
            "/api/documents",
            &json!({ "content_hash": hash, "total_units": total_units }),
        )
        .await?;
    anyhow::ensure!(response.status() == StatusCode::CREATED, "register failed");
    Ok(())
}

async fn start_session(
    app: &TestApp,
    user_id: Uuid,
    file_id: Uuid,
    hash: &str,
    start_unit: i32,
) -> Result<SessionSnapshot> {
    let response = app
        .post_json(
            "/api/sessions",
            &json!({
                "user_id": user_id,
                "file_id": file_id,
                "content_hash": hash,
                "start_unit": start_unit,
            }),
        )
        .await?;
    anyhow::ensure!(
        response.status() == StatusCode::CREATED,
        "session start failed with {}",
        response.status()
    );
    let body = body_to_vec(response.into_body()).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn poll_until<F>(app: &TestApp, session_id: Uuid, predicate: F) -> Result<SessionSnapshot>
where
    F: Fn(&SessionSnapshot) -> bool,
{
    for _ in 0..200 {
        let response = app.get(&format!("/api/sessions/{session_id}")).await?;
        anyhow::ensure!(response.status() == StatusCode::OK, "poll failed");
        let body = body_to_vec(response.into_body()).await?;
        let snapshot: SessionSnapshot = serde_json::from_slice(&body)?;
        if predicate(&snapshot) {
            return Ok(snapshot);
        }
        sleep(Duration::from_millis(50)).await;
    }
    Err(anyhow!("session {session_id} did not reach expected state"))
}

#[tokio::test]
async fn window_session_generates_every_page_and_completes() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = content_hash(b"session-doc");
    register_document(&app, &hash, 30).await?;

    let user_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    let snapshot = start_session(&app, user_id, file_id, &hash, 10).await?;
    assert_eq!(snapshot.state, "active");
    assert_eq!((snapshot.window_start, snapshot.window_end), (8, 15));
    assert_eq!(snapshot.current_unit, 10);

    let done = poll_until(&app, snapshot.id, |s| s.state == "completed").await?;
    assert_eq!(done.units_completed, (8..=15).collect::<Vec<i32>>());
    assert!(done.units_in_progress.is_empty());
    assert!(done.units_failed.is_empty());

    // One sticker per window unit, all carrying generated content.
    let response = app.get(&format!("/api/files/{file_id}/stickers")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_vec(response.into_body()).await?;
    let stickers: Vec<serde_json::Value> = serde_json::from_slice(&body)?;
    assert_eq!(stickers.len(), 8);
    for sticker in &stickers {
        assert_eq!(sticker["origin"], "generated");
        assert!(sticker["current_content"].as_str().is_some());
    }

    app.cleanup().await
}

#[tokio::test]
async fn second_active_session_for_the_same_file_is_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = content_hash(b"duplicate-session-doc");
    register_document(&app, &hash, 50).await?;

    let user_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    start_session(&app, user_id, file_id, &hash, 1).await?;

    let duplicate = app
        .post_json(
            "/api/sessions",
            &json!({
                "user_id": user_id,
                "file_id": file_id,
                "content_hash": hash,
                "start_unit": 2,
            }),
        )
        .await?;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    app.cleanup().await
}

#[tokio::test]
async fn canceled_sessions_stop_and_stay_canceled() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = content_hash(b"cancel-session-doc");
    register_document(&app, &hash, 40).await?;

    let session = start_session(&app, Uuid::new_v4(), Uuid::new_v4(), &hash, 20).await?;
    let response = app.delete(&format!("/api/sessions/{}", session.id)).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let snapshot = poll_until(&app, session.id, |s| s.state == "canceled").await?;
    assert_eq!(snapshot.state, "canceled");

    // Terminal states do not transition further.
    let navigate = app
        .patch_json(
            &format!("/api/sessions/{}/window", session.id),
            &json!({ "current_unit": 25 }),
        )
        .await?;
    assert_eq!(navigate.status(), StatusCode::CONFLICT);

    app.cleanup().await
}

#[tokio::test]
async fn session_input_errors_are_rejected_up_front() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = content_hash(b"input-session-doc");
    register_document(&app, &hash, 10).await?;

    let bad_unit = app
        .post_json(
            "/api/sessions",
            &json!({
                "user_id": Uuid::new_v4(),
                "file_id": Uuid::new_v4(),
                "content_hash": hash,
                "start_unit": 0,
            }),
        )
        .await?;
    assert_eq!(bad_unit.status(), StatusCode::BAD_REQUEST);

    let unknown_hash = app
        .post_json(
            "/api/sessions",
            &json!({
                "user_id": Uuid::new_v4(),
                "file_id": Uuid::new_v4(),
                "content_hash": content_hash(b"never registered"),
                "start_unit": 1,
            }),
        )
        .await?;
    assert_eq!(unknown_hash.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await
}

#[tokio::test]
async fn navigation_slides_and_jumps_rework_the_window() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    // Service-level, without a runner, so the unit sets are fully
    // deterministic.
    let user_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    let hash = content_hash(b"navigate-doc");

    let session_id = app
        .with_conn(move |conn| {
            studydesk::registry::upsert_document(conn, &hash, Some(100), None)?;
            let session = session::start_session(
                conn,
                StartSession {
                    user_id,
                    file_id,
                    content_hash: hash.clone(),
                    locale: "en".to_string(),
                    mode: GenerationMode::Explain,
                    start_unit: 10,
                    total_units: 100,
                },
            )?;
            assert_eq!((session.window_start, session.window_end), (8, 15));

            session::mark_unit_in_progress(conn, session.id, 8)?;
            session::mark_unit_in_progress(conn, session.id, 12)?;
            session::mark_unit_completed(conn, session.id, 10)?;
            Ok(session.id)
        })
        .await?;

    // A short move slides the window and cancels only what fell out.
    let navigation = app
        .with_conn(move |conn| Ok(session::navigate(conn, session_id, 14, None)?))
        .await?;
    assert_eq!(
        (navigation.session.window_start, navigation.session.window_end),
        (12, 19)
    );
    assert_eq!(navigation.canceled_units, vec![8]);
    // Extend slides without discarding progress; only the canceled unit
    // leaves the in-progress set.
    let completed = session::unit_set(&navigation.session.units_completed);
    let in_progress = session::unit_set(&navigation.session.units_in_progress);
    assert!(completed.contains(&10));
    assert_eq!(in_progress.into_iter().collect::<Vec<i32>>(), vec![12]);

    // A jump rebuilds the window and discards out-of-window progress.
    let navigation = app
        .with_conn(move |conn| Ok(session::navigate(conn, session_id, 60, None)?))
        .await?;
    assert_eq!(
        (navigation.session.window_start, navigation.session.window_end),
        (58, 65)
    );
    assert!(session::unit_set(&navigation.session.units_completed).is_empty());
    assert!(session::unit_set(&navigation.session.units_in_progress).is_empty());
    assert_eq!(navigation.canceled_units, vec![12]);

    // Invariant: the current unit sits inside the window while active.
    let session = app
        .with_conn(move |conn| Ok(session::get_session(conn, session_id)?))
        .await?;
    assert!(session.window_start <= session.current_unit);
    assert!(session.current_unit <= session.window_end);

    app.cleanup().await
}

#[tokio::test]
async fn pause_and_resume_round_trip() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let hash = content_hash(b"pause-doc");
    register_document(&app, &hash, 60).await?;
    let session = start_session(&app, Uuid::new_v4(), Uuid::new_v4(), &hash, 30).await?;

    let paused = app
        .patch_json(
            &format!("/api/sessions/{}/state", session.id),
            &json!({ "action": "pause" }),
        )
        .await?;
    assert_eq!(paused.status(), StatusCode::OK);
    let body = body_to_vec(paused.into_body()).await?;
    let snapshot: SessionSnapshot = serde_json::from_slice(&body)?;
    assert_eq!(snapshot.state, "paused");

    let resumed = app
        .patch_json(
            &format!("/api/sessions/{}/state", session.id),
            &json!({ "action": "resume" }),
        )
        .await?;
    assert_eq!(resumed.status(), StatusCode::OK);
    let body = body_to_vec(resumed.into_body()).await?;
    let snapshot: SessionSnapshot = serde_json::from_slice(&body)?;
    assert_eq!(snapshot.state, "active");

    app.cleanup().await
}
