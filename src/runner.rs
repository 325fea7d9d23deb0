//! Per-session generation driver.
//!
//! Spawned when a session starts and lives until the session leaves the
//! `active` state. Each pass it re-reads the session row (navigation is
//! applied to the row by the HTTP layer), cancels in-flight units that left
//! the window, and admits pending units through the session's limiter in
//! priority order. Admitted units go through the shared cache: winners of
//! the insert race execute the generation inline between cancellation
//! checkpoints; losers poll the existing job until it reaches a terminal
//! state. One unit's failure never touches its siblings.

use std::sync::Arc;
use std::time::Duration;

use diesel::pg::PgConnection;
use serde_json::{json, Value};
use tokio::task;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{self, CacheError, CacheLookup, SizingHints};
use crate::extract::ExtractError;
use crate::limiter::{CancelToken, SessionLimiter};
use crate::llm::{build_prompt, classify_error, FailureKind};
use crate::quota::UNITS_PER_GENERATION;
use crate::selection::{GenerationKey, GenerationMode};
use crate::session::{
    self, session_window, unit_set, SessionError, STATE_ACTIVE, STATE_PAUSED,
};
use crate::session::window::pages_to_generate;
use crate::state::AppState;

/// Result of driving one unit to its end, from this session's perspective.
enum UnitOutcome {
    Completed(String),
    Failed(String),
    Canceled,
}

#[derive(Clone)]
struct UnitJob {
    session_id: Uuid,
    user_id: Uuid,
    file_id: Uuid,
    content_hash: String,
    locale: String,
    mode: GenerationMode,
    unit: i32,
}

pub fn spawn_runner(state: Arc<AppState>, session_id: Uuid) {
    tokio::spawn(run_session(state, session_id));
}

async fn run_session(state: Arc<AppState>, session_id: Uuid) {
    let limiter = state.limiter_for(session_id);
    let poll_interval = Duration::from_millis(state.config.session_poll_interval_ms);
    info!(session_id = %session_id, "session runner started");

    loop {
        let session = match with_conn(&state, move |conn| {
            session::get_session(conn, session_id).map_err(session_to_cache_error)
        })
        .await
        {
            Ok(session) => session,
            Err(CacheError::Database(diesel::result::Error::NotFound)) => break,
            Err(err) => {
                error!(session_id = %session_id, error = %err, "runner failed to load session");
                state.clock.sleep(poll_interval).await;
                continue;
            }
        };

        match session.state.as_str() {
            STATE_ACTIVE => {}
            STATE_PAUSED => {
                state.clock.sleep(poll_interval).await;
                continue;
            }
            _ => break,
        }

        let Some(mode) = GenerationMode::parse(&session.mode) else {
            error!(session_id = %session_id, mode = %session.mode, "session has unknown mode");
            break;
        };

        // Units that fell outside the window lose this session's interest;
        // their cache jobs are left for other waiters or the worker.
        let outside = limiter.cancel_outside_window(session.window_start, session.window_end);
        if !outside.is_empty() {
            debug!(session_id = %session_id, units = ?outside, "canceled out-of-window units");
            let canceled = outside.clone();
            let _ = with_conn(&state, move |conn| {
                session::clear_in_progress(conn, session_id, &canceled)
                    .map_err(session_to_cache_error)
            })
            .await;
        }

        // Failed units count as settled: they are reported, not retried,
        // for the life of the window.
        let mut settled = unit_set(&session.units_completed);
        settled.extend(unit_set(&session.units_failed));
        let in_progress = unit_set(&session.units_in_progress);
        let window = session_window(&session);
        let pages = pages_to_generate(window, &settled, &in_progress, session.current_unit);

        if pages.is_empty() && in_progress.is_empty() {
            let _ = with_conn(&state, move |conn| {
                session::complete_if_exhausted(conn, session_id).map_err(session_to_cache_error)
            })
            .await;
            state.clock.sleep(poll_interval).await;
            continue;
        }

        for unit in pages {
            if !limiter.can_start() {
                break;
            }
            let Some(token) = limiter.start(unit) else {
                continue;
            };
            let marked = with_conn(&state, move |conn| {
                session::mark_unit_in_progress(conn, session_id, unit)
                    .map_err(session_to_cache_error)
            })
            .await;
            if let Err(err) = marked {
                warn!(session_id = %session_id, unit, error = %err, "could not mark unit in progress");
                limiter.complete(unit);
                continue;
            }

            let job = UnitJob {
                session_id,
                user_id: session.user_id,
                file_id: session.file_id,
                content_hash: session.content_hash.clone(),
                locale: session.locale.clone(),
                mode,
                unit,
            };
            tokio::spawn(run_unit(state.clone(), limiter.clone(), job, token));
        }

        state.clock.sleep(poll_interval).await;
    }

    limiter.cancel_all();
    state.drop_limiter(session_id);
    info!(session_id = %session_id, "session runner stopped");
}

async fn run_unit(
    state: Arc<AppState>,
    limiter: Arc<SessionLimiter>,
    job: UnitJob,
    token: CancelToken,
) {
    let outcome = drive_unit(&state, &job, &token).await;
    let session_id = job.session_id;
    let unit = job.unit;

    // A canceled unit frees its slot and drops out of the session's
    // bookkeeping; results that still arrived were written to the cache for
    // other waiters and are simply not recorded against this session.
    let discard = token.is_canceled();
    match outcome {
        UnitOutcome::Completed(content) if !discard => {
            let file_id = job.file_id;
            let store = with_conn(&state, move |conn| {
                crate::versions::record_generated_content(conn, file_id, unit, &content)
                    .map_err(|err| CacheError::Pool(err.to_string()))?;
                session::mark_unit_completed(conn, session_id, unit)
                    .map_err(session_to_cache_error)
            })
            .await;
            if let Err(err) = store {
                error!(session_id = %session_id, unit, error = %err, "failed to record completed unit");
            }
        }
        UnitOutcome::Failed(reason) if !discard => {
            warn!(session_id = %session_id, unit, %reason, "unit generation failed");
            let _ = with_conn(&state, move |conn| {
                session::mark_unit_failed(conn, session_id, unit).map_err(session_to_cache_error)
            })
            .await;
        }
        _ => {
            let _ = with_conn(&state, move |conn| {
                session::clear_in_progress(conn, session_id, &[unit])
                    .map_err(session_to_cache_error)
            })
            .await;
        }
    }
    limiter.complete(unit);
}

async fn drive_unit(state: &Arc<AppState>, job: &UnitJob, token: &CancelToken) -> UnitOutcome {
    if token.is_canceled() {
        return UnitOutcome::Canceled;
    }

    let key = GenerationKey::page(
        job.content_hash.clone(),
        job.unit,
        state.config.prompt_version.clone(),
        job.locale.clone(),
        job.mode,
    );

    let looked_up = {
        let key = key.clone();
        with_conn(state, move |conn| cache::lookup(conn, &key)).await
    };
    match looked_up {
        Ok(CacheLookup::Ready(payload)) => {
            return match payload_content(&payload) {
                Some(content) => UnitOutcome::Completed(content),
                None => UnitOutcome::Failed("cached payload is unreadable".to_string()),
            }
        }
        Ok(CacheLookup::Generating { job_id }) => {
            return await_terminal(state, job_id, token).await;
        }
        // Failed and missing entries both mean we should try to become the
        // generator; a failed row is revived by the insert path below.
        Ok(CacheLookup::Failed { .. }) | Ok(CacheLookup::NotFound) => {}
        Err(err) => return UnitOutcome::Failed(err.to_string()),
    }

    let start = {
        let key = key.clone();
        let user_id = job.user_id;
        with_conn(state, move |conn| {
            cache::try_start_generation(conn, &key, user_id, UNITS_PER_GENERATION, SizingHints::default())
        })
        .await
    };
    let outcome = match start {
        Ok(outcome) => outcome,
        Err(err) => return UnitOutcome::Failed(err.to_string()),
    };

    if !outcome.started {
        return await_terminal(state, outcome.job.id, token).await;
    }

    let claimed = {
        let job_id = outcome.job.id;
        let owner = format!("session:{}", job.session_id);
        let lock_timeout =
            chrono::Duration::seconds(state.config.generation_lock_timeout_seconds);
        with_conn(state, move |conn| {
            cache::claim_for_inline(conn, job_id, &owner, lock_timeout)
        })
        .await
    };
    match claimed {
        Ok(true) => execute_inline(state, job, outcome.job.id, outcome.job.attempts + 1, token).await,
        Ok(false) => await_terminal(state, outcome.job.id, token).await,
        Err(err) => UnitOutcome::Failed(err.to_string()),
    }
}

/// Execute a generation this session owns, checking the cancellation token
/// before and after the opaque model call. Cancellation never abandons the
/// job row: the result (or failure) is written regardless so other waiters
/// and the availability invariant are unaffected.
async fn execute_inline(
    state: &Arc<AppState>,
    job: &UnitJob,
    cache_job_id: Uuid,
    attempts: i32,
    token: &CancelToken,
) -> UnitOutcome {
    let text = match state
        .extractor
        .extract_text(&job.content_hash, job.unit)
        .await
    {
        Ok(text) => text,
        Err(ExtractError::UnitNotFound(unit)) => {
            let reason = format!("unit {unit} not found in document");
            let fail_reason = reason.clone();
            let _ = with_conn(state, move |conn| {
                cache::fail_generation(conn, cache_job_id, &fail_reason, true)
            })
            .await;
            return UnitOutcome::Failed(reason);
        }
        Err(err) => {
            return retry_or_fail(state, cache_job_id, attempts, FailureKind::Transient, &err.to_string(), token)
                .await;
        }
    };

    if token.is_canceled() {
        // Slot is already freed; hand the claimed job back for the worker.
        let _ = with_conn(state, move |conn| {
            cache::retry_generation_after(
                conn,
                cache_job_id,
                chrono::Duration::zero(),
                "released by canceled session",
            )
        })
        .await;
        return UnitOutcome::Canceled;
    }

    let prompt = build_prompt(job.mode, &job.locale, job.unit, &text);
    match state.generator.generate(&prompt).await {
        Ok(content) => {
            let payload = json!({ "content": content });
            let completed = with_conn(state, move |conn| {
                cache::complete_generation(conn, cache_job_id, payload)
            })
            .await;
            if let Err(err) = completed {
                return UnitOutcome::Failed(err.to_string());
            }
            if token.is_canceled() {
                UnitOutcome::Canceled
            } else {
                UnitOutcome::Completed(content)
            }
        }
        Err(err) => {
            let kind = classify_error(&err);
            retry_or_fail(state, cache_job_id, attempts, kind, &err.to_string(), token).await
        }
    }
}

async fn retry_or_fail(
    state: &Arc<AppState>,
    cache_job_id: Uuid,
    attempts: i32,
    kind: FailureKind,
    message: &str,
    token: &CancelToken,
) -> UnitOutcome {
    if kind == FailureKind::Permanent || attempts >= state.config.generation_max_attempts {
        let reason = message.to_string();
        let _ = with_conn(state, move |conn| {
            cache::fail_generation(conn, cache_job_id, &reason, true)
        })
        .await;
        return UnitOutcome::Failed(message.to_string());
    }

    let delay = crate::worker::backoff_with_jitter(attempts);
    let error_message = message.to_string();
    let _ = with_conn(state, move |conn| {
        cache::retry_generation_after(conn, cache_job_id, delay, &error_message)
    })
    .await;
    // The worker owns the retry from here; keep this session's interest
    // alive by waiting for the terminal state.
    await_terminal(state, cache_job_id, token).await
}

/// Poll an existing job until it goes terminal, the wait times out, or the
/// session loses interest. Losing the single-flight race always lands here;
/// generating the result ourselves is never an option while another job for
/// the key is non-terminal.
async fn await_terminal(state: &Arc<AppState>, job_id: Uuid, token: &CancelToken) -> UnitOutcome {
    let poll_interval = Duration::from_millis(state.config.cache_poll_interval_ms);
    let timeout = Duration::from_secs(state.config.cache_wait_timeout_seconds);
    let mut waited = Duration::ZERO;

    loop {
        if token.is_canceled() {
            return UnitOutcome::Canceled;
        }
        let job = match with_conn(state, move |conn| cache::get_job(conn, job_id)).await {
            Ok(Some(job)) => job,
            Ok(None) => return UnitOutcome::Failed("generation job disappeared".to_string()),
            Err(err) => return UnitOutcome::Failed(err.to_string()),
        };
        match job.status.as_str() {
            cache::STATUS_READY => {
                return match job.result_payload.as_ref().and_then(|p| payload_content(p)) {
                    Some(content) => UnitOutcome::Completed(content),
                    None => UnitOutcome::Failed("cached payload is unreadable".to_string()),
                };
            }
            cache::STATUS_FAILED => {
                let reason = job
                    .last_error
                    .unwrap_or_else(|| "generation failed".to_string());
                return UnitOutcome::Failed(reason);
            }
            _ => {}
        }

        if waited >= timeout {
            return UnitOutcome::Failed("timed out waiting for generation".to_string());
        }
        state.clock.sleep(poll_interval).await;
        waited += poll_interval;
    }
}

fn payload_content(payload: &Value) -> Option<String> {
    payload
        .get("content")
        .and_then(|value| value.as_str())
        .map(|content| content.to_string())
}

fn session_to_cache_error(err: SessionError) -> CacheError {
    match err {
        SessionError::Database(inner) => CacheError::Database(inner),
        SessionError::NotFound => CacheError::Database(diesel::result::Error::NotFound),
        other => CacheError::Pool(other.to_string()),
    }
}

async fn with_conn<T, F>(state: &Arc<AppState>, f: F) -> Result<T, CacheError>
where
    F: FnOnce(&mut PgConnection) -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    task::spawn_blocking(move || {
        let mut conn = state.blocking_db()?;
        f(&mut conn)
    })
    .await
    .expect("database task panicked")
}
