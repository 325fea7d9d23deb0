use std::sync::Arc;

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::GenerationSession;
use crate::registry;
use crate::runner::spawn_runner;
use crate::selection::GenerationMode;
use crate::session::window::NavigationAction;
use crate::session::{self, unit_set, SessionError, StartSession};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct StartSessionRequest {
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub content_hash: String,
    pub start_unit: i32,
    pub total_units: Option<i32>,
    pub locale: Option<String>,
    pub mode: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateWindowRequest {
    pub current_unit: i32,
    pub action: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateStateRequest {
    pub action: String,
}

#[derive(Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub content_hash: String,
    pub locale: String,
    pub mode: String,
    pub state: String,
    pub total_units: i32,
    pub window_start: i32,
    pub window_end: i32,
    pub current_unit: i32,
    pub units_completed: Vec<i32>,
    pub units_in_progress: Vec<i32>,
    pub units_failed: Vec<i32>,
    pub updated_at: String,
}

impl From<GenerationSession> for SessionSnapshot {
    fn from(session: GenerationSession) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id,
            file_id: session.file_id,
            content_hash: session.content_hash.clone(),
            locale: session.locale.clone(),
            mode: session.mode.clone(),
            state: session.state.clone(),
            total_units: session.total_units,
            window_start: session.window_start,
            window_end: session.window_end,
            current_unit: session.current_unit,
            units_completed: unit_set(&session.units_completed).into_iter().collect(),
            units_in_progress: unit_set(&session.units_in_progress).into_iter().collect(),
            units_failed: unit_set(&session.units_failed).into_iter().collect(),
            updated_at: session.updated_at.and_utc().to_rfc3339(),
        }
    }
}

fn map_session_error(err: SessionError) -> AppError {
    match err {
        SessionError::AlreadyActive => {
            AppError::conflict("an active session already exists for this file")
        }
        SessionError::NotFound => AppError::not_found(),
        SessionError::NotActive => AppError::conflict("session is not in a usable state"),
        SessionError::UnitOutOfRange(unit) => {
            AppError::bad_request(format!("unit {unit} is out of range"))
        }
        SessionError::Database(err) => AppError::from(err),
    }
}

pub async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionRequest>,
) -> AppResult<impl IntoResponse> {
    let mode = match payload.mode.as_deref() {
        None => GenerationMode::Explain,
        Some(raw) => GenerationMode::parse(raw)
            .ok_or_else(|| AppError::bad_request(format!("unknown mode '{raw}'")))?,
    };
    if mode.requires_selection() {
        return Err(AppError::bad_request(
            "selection mode is not available for window sessions",
        ));
    }

    let mut conn = state.db()?;
    let document = registry::get_document(&mut conn, &payload.content_hash)?
        .ok_or_else(|| AppError::bad_request("unknown content hash"))?;
    let total_units = payload
        .total_units
        .filter(|units| *units > 0)
        .unwrap_or(document.total_units);

    let session = session::start_session(
        &mut conn,
        StartSession {
            user_id: payload.user_id,
            file_id: payload.file_id,
            content_hash: payload.content_hash,
            locale: payload.locale.unwrap_or_else(|| "en".to_string()),
            mode,
            start_unit: payload.start_unit,
            total_units,
        },
    )
    .map_err(map_session_error)?;
    drop(conn);

    spawn_runner(Arc::new(state.clone()), session.id);
    Ok((StatusCode::CREATED, Json(SessionSnapshot::from(session))))
}

/// Pure read; no side effects.
pub async fn poll_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SessionSnapshot>> {
    let mut conn = state.db()?;
    let session = session::get_session(&mut conn, id).map_err(map_session_error)?;
    Ok(Json(SessionSnapshot::from(session)))
}

pub async fn update_window(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateWindowRequest>,
) -> AppResult<Json<SessionSnapshot>> {
    let action = match payload.action.as_deref() {
        None => None,
        Some("extend") => Some(NavigationAction::Extend),
        Some("jump") => Some(NavigationAction::Jump),
        Some(other) => {
            return Err(AppError::bad_request(format!(
                "unknown action '{other}', expected 'extend' or 'jump'"
            )))
        }
    };

    let mut conn = state.db()?;
    let navigation = session::navigate(&mut conn, id, payload.current_unit, action)
        .map_err(map_session_error)?;
    drop(conn);

    // The runner also sweeps on its next pass; canceling here just gets the
    // slots back sooner.
    let limiter = state.limiter_for(id);
    for unit in &navigation.canceled_units {
        limiter.cancel(*unit);
    }

    Ok(Json(SessionSnapshot::from(navigation.session)))
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SessionSnapshot>> {
    let mut conn = state.db()?;
    let session = session::cancel_session(&mut conn, id).map_err(map_session_error)?;
    drop(conn);

    state.limiter_for(id).cancel_all();
    Ok(Json(SessionSnapshot::from(session)))
}

pub async fn update_state(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStateRequest>,
) -> AppResult<Json<SessionSnapshot>> {
    let mut conn = state.db()?;
    let session = match payload.action.as_str() {
        "pause" => session::pause_session(&mut conn, id).map_err(map_session_error)?,
        "resume" => session::resume_session(&mut conn, id).map_err(map_session_error)?,
        other => {
            return Err(AppError::bad_request(format!(
                "unknown action '{other}', expected 'pause' or 'resume'"
            )))
        }
    };
    Ok(Json(SessionSnapshot::from(session)))
}
