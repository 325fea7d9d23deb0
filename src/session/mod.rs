//! Sliding-window generation sessions.
//!
//! One row per (user, file) reading context while generation is running.
//! The window math lives in [`window`]; this module owns the state machine
//! and its persistence. The partial unique index on active sessions makes
//! the one-session-per-context rule race-free without read-then-write.

use std::collections::BTreeSet;

use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{GenerationSession, NewGenerationSession};
use crate::schema::generation_sessions;
use crate::selection::GenerationMode;

pub mod window;

use window::{calculate_window, classify_navigation, pages_to_cancel, NavigationAction, Window};

pub const STATE_ACTIVE: &str = "active";
pub const STATE_PAUSED: &str = "paused";
pub const STATE_COMPLETED: &str = "completed";
pub const STATE_CANCELED: &str = "canceled";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("an active session already exists for this file")]
    AlreadyActive,
    #[error("session not found")]
    NotFound,
    #[error("session is not active")]
    NotActive,
    #[error("unit {0} is out of range")]
    UnitOutOfRange(i32),
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Clone)]
pub struct StartSession {
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub content_hash: String,
    pub locale: String,
    pub mode: GenerationMode,
    pub start_unit: i32,
    pub total_units: i32,
}

pub fn unit_set(value: &Value) -> BTreeSet<i32> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_i64())
                .map(|unit| unit as i32)
                .collect()
        })
        .unwrap_or_default()
}

pub fn unit_set_value(units: &BTreeSet<i32>) -> Value {
    Value::Array(units.iter().map(|unit| Value::from(*unit)).collect())
}

pub fn session_window(session: &GenerationSession) -> Window {
    Window {
        start: session.window_start,
        end: session.window_end,
    }
}

pub fn start_session(conn: &mut PgConnection, params: StartSession) -> SessionResult<GenerationSession> {
    if params.total_units < 1 || params.start_unit < 1 || params.start_unit > params.total_units {
        return Err(SessionError::UnitOutOfRange(params.start_unit));
    }

    let window = calculate_window(params.start_unit, params.total_units);
    let new_session = NewGenerationSession {
        id: Uuid::new_v4(),
        user_id: params.user_id,
        file_id: params.file_id,
        content_hash: params.content_hash,
        locale: params.locale,
        mode: params.mode.as_str().to_string(),
        total_units: params.total_units,
        window_start: window.start,
        window_end: window.end,
        current_unit: params.start_unit,
        state: STATE_ACTIVE.to_string(),
    };

    match diesel::insert_into(generation_sessions::table)
        .values(&new_session)
        .execute(conn)
    {
        Ok(_) => {}
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(SessionError::AlreadyActive);
        }
        Err(err) => return Err(err.into()),
    }

    let session = generation_sessions::table
        .find(new_session.id)
        .first(conn)?;
    Ok(session)
}

pub fn get_session(conn: &mut PgConnection, session_id: Uuid) -> SessionResult<GenerationSession> {
    generation_sessions::table
        .find(session_id)
        .first::<GenerationSession>(conn)
        .optional()?
        .ok_or(SessionError::NotFound)
}

fn locked_session(conn: &mut PgConnection, session_id: Uuid) -> SessionResult<GenerationSession> {
    generation_sessions::table
        .find(session_id)
        .for_update()
        .first::<GenerationSession>(conn)
        .optional()?
        .ok_or(SessionError::NotFound)
}

/// Outcome of a navigation event: the refreshed session plus the
/// in-progress units that fell outside the new window and should be
/// canceled by the session's limiter.
#[derive(Debug)]
pub struct Navigation {
    pub session: GenerationSession,
    pub action: NavigationAction,
    pub canceled_units: Vec<i32>,
}

/// Apply a navigation event. The action is normally classified from the
/// distance moved; callers that already classified it may pass an override.
pub fn navigate(
    conn: &mut PgConnection,
    session_id: Uuid,
    to_unit: i32,
    action_override: Option<NavigationAction>,
) -> SessionResult<Navigation> {
    conn.transaction(|conn| {
        let session = locked_session(conn, session_id)?;
        if session.state != STATE_ACTIVE {
            return Err(SessionError::NotActive);
        }
        if to_unit < 1 || to_unit > session.total_units {
            return Err(SessionError::UnitOutOfRange(to_unit));
        }

        let action =
            action_override.unwrap_or_else(|| classify_navigation(session.current_unit, to_unit));
        let new_window = calculate_window(to_unit, session.total_units);

        let mut completed = unit_set(&session.units_completed);
        let mut in_progress = unit_set(&session.units_in_progress);
        let mut failed = unit_set(&session.units_failed);

        let canceled_units = pages_to_cancel(new_window, &in_progress);
        in_progress.retain(|unit| new_window.contains(*unit));
        if action == NavigationAction::Jump {
            // A jump rebuilds the window from scratch; progress outside it
            // is no longer meaningful.
            completed.retain(|unit| new_window.contains(*unit));
            failed.retain(|unit| new_window.contains(*unit));
        }

        diesel::update(generation_sessions::table.find(session.id))
            .set((
                generation_sessions::current_unit.eq(to_unit),
                generation_sessions::window_start.eq(new_window.start),
                generation_sessions::window_end.eq(new_window.end),
                generation_sessions::units_completed.eq(unit_set_value(&completed)),
                generation_sessions::units_in_progress.eq(unit_set_value(&in_progress)),
                generation_sessions::units_failed.eq(unit_set_value(&failed)),
                generation_sessions::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        let session = generation_sessions::table.find(session.id).first(conn)?;
        Ok(Navigation {
            session,
            action,
            canceled_units,
        })
    })
}

pub fn cancel_session(conn: &mut PgConnection, session_id: Uuid) -> SessionResult<GenerationSession> {
    transition_state(conn, session_id, &[STATE_ACTIVE, STATE_PAUSED], STATE_CANCELED)
}

pub fn pause_session(conn: &mut PgConnection, session_id: Uuid) -> SessionResult<GenerationSession> {
    transition_state(conn, session_id, &[STATE_ACTIVE], STATE_PAUSED)
}

pub fn resume_session(conn: &mut PgConnection, session_id: Uuid) -> SessionResult<GenerationSession> {
    transition_state(conn, session_id, &[STATE_PAUSED], STATE_ACTIVE)
}

fn transition_state(
    conn: &mut PgConnection,
    session_id: Uuid,
    from: &[&str],
    to: &str,
) -> SessionResult<GenerationSession> {
    conn.transaction(|conn| {
        let session = locked_session(conn, session_id)?;
        if !from.contains(&session.state.as_str()) {
            return Err(SessionError::NotActive);
        }
        diesel::update(generation_sessions::table.find(session.id))
            .set((
                generation_sessions::state.eq(to),
                generation_sessions::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        let session = generation_sessions::table.find(session.id).first(conn)?;
        Ok(session)
    })
}

pub fn mark_unit_in_progress(
    conn: &mut PgConnection,
    session_id: Uuid,
    unit: i32,
) -> SessionResult<()> {
    mutate_unit_sets(conn, session_id, |completed, in_progress, failed| {
        if !completed.contains(&unit) {
            failed.remove(&unit);
            in_progress.insert(unit);
        }
    })
}

pub fn mark_unit_completed(
    conn: &mut PgConnection,
    session_id: Uuid,
    unit: i32,
) -> SessionResult<()> {
    mutate_unit_sets(conn, session_id, |completed, in_progress, failed| {
        in_progress.remove(&unit);
        failed.remove(&unit);
        completed.insert(unit);
    })?;
    complete_if_exhausted(conn, session_id)
}

pub fn mark_unit_failed(
    conn: &mut PgConnection,
    session_id: Uuid,
    unit: i32,
) -> SessionResult<()> {
    mutate_unit_sets(conn, session_id, |completed, in_progress, failed| {
        in_progress.remove(&unit);
        if !completed.contains(&unit) {
            failed.insert(unit);
        }
    })?;
    complete_if_exhausted(conn, session_id)
}

pub fn clear_in_progress(
    conn: &mut PgConnection,
    session_id: Uuid,
    units: &[i32],
) -> SessionResult<()> {
    mutate_unit_sets(conn, session_id, |_, in_progress, _| {
        for unit in units {
            in_progress.remove(unit);
        }
    })
}

fn mutate_unit_sets<F>(conn: &mut PgConnection, session_id: Uuid, mutate: F) -> SessionResult<()>
where
    F: FnOnce(&mut BTreeSet<i32>, &mut BTreeSet<i32>, &mut BTreeSet<i32>),
{
    conn.transaction(|conn| {
        let session = locked_session(conn, session_id)?;
        let mut completed = unit_set(&session.units_completed);
        let mut in_progress = unit_set(&session.units_in_progress);
        let mut failed = unit_set(&session.units_failed);

        mutate(&mut completed, &mut in_progress, &mut failed);

        diesel::update(generation_sessions::table.find(session.id))
            .set((
                generation_sessions::units_completed.eq(unit_set_value(&completed)),
                generation_sessions::units_in_progress.eq(unit_set_value(&in_progress)),
                generation_sessions::units_failed.eq(unit_set_value(&failed)),
                generation_sessions::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    })
}

/// An active session whose window has no pending or in-progress units left
/// has nothing more to do and completes on its own.
pub fn complete_if_exhausted(conn: &mut PgConnection, session_id: Uuid) -> SessionResult<()> {
    conn.transaction(|conn| {
        let session = locked_session(conn, session_id)?;
        if session.state != STATE_ACTIVE {
            return Ok(());
        }

        let completed = unit_set(&session.units_completed);
        let in_progress = unit_set(&session.units_in_progress);
        let failed = unit_set(&session.units_failed);
        if !in_progress.is_empty() {
            return Ok(());
        }

        let window = session_window(&session);
        let exhausted = (window.start..=window.end)
            .all(|unit| completed.contains(&unit) || failed.contains(&unit));
        if exhausted {
            diesel::update(generation_sessions::table.find(session.id))
                .set((
                    generation_sessions::state.eq(STATE_COMPLETED),
                    generation_sessions::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
        }
        Ok(())
    })
}
