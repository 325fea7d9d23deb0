use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::{self, SizingHints};
use crate::error::{AppError, AppResult};
use crate::models::GenerationJob;
use crate::quota::UNITS_PER_GENERATION;
use crate::registry;
use crate::selection::{compute_selection_digest, GenerationKey, GenerationMode, Region};
use crate::state::AppState;

/// Fire-and-forget generation request: the row is left unlocked for the
/// background worker, and the caller polls `GET /api/generations/:id`.
#[derive(Deserialize)]
pub struct GenerationRequest {
    pub user_id: Uuid,
    pub content_hash: String,
    pub unit_index: i32,
    pub mode: String,
    pub locale: Option<String>,
    pub regions: Option<Vec<Region>>,
}

#[derive(Serialize)]
pub struct StartGenerationResponse {
    pub job_id: Uuid,
    pub started: bool,
    pub status: String,
}

#[derive(Serialize)]
pub struct GenerationJobResponse {
    pub id: Uuid,
    pub unit_index: i32,
    pub mode: String,
    pub status: String,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<GenerationJob> for GenerationJobResponse {
    fn from(job: GenerationJob) -> Self {
        let payload = if job.status == cache::STATUS_READY {
            job.result_payload
        } else {
            None
        };
        Self {
            id: job.id,
            unit_index: job.unit_index,
            mode: job.mode,
            status: job.status,
            attempts: job.attempts,
            payload,
            last_error: job.last_error,
        }
    }
}

fn region_is_sane(region: &Region) -> bool {
    let rect = &region.rect;
    region.unit >= 1
        && (0.0..=1.0).contains(&rect.x)
        && (0.0..=1.0).contains(&rect.y)
        && rect.width > 0.0
        && rect.height > 0.0
        && rect.width <= 1.0
        && rect.height <= 1.0
}

pub async fn request_generation(
    State(state): State<AppState>,
    Json(payload): Json<GenerationRequest>,
) -> AppResult<impl IntoResponse> {
    // Input errors are rejected here; they never reach the job table.
    let mode = GenerationMode::parse(&payload.mode)
        .ok_or_else(|| AppError::bad_request(format!("unknown mode '{}'", payload.mode)))?;
    let locale = payload.locale.unwrap_or_else(|| "en".to_string());

    let mut conn = state.db()?;
    let document = registry::get_document(&mut conn, &payload.content_hash)?
        .ok_or_else(|| AppError::bad_request("unknown content hash"))?;
    if payload.unit_index < 1
        || (document.total_units > 0 && payload.unit_index > document.total_units)
    {
        return Err(AppError::bad_request(format!(
            "unit {} is out of range",
            payload.unit_index
        )));
    }

    let selection_digest = if mode.requires_selection() {
        let regions = payload
            .regions
            .as_deref()
            .filter(|regions| !regions.is_empty())
            .ok_or_else(|| AppError::bad_request("selection mode requires regions"))?;
        if !regions.iter().all(region_is_sane) {
            return Err(AppError::bad_request("malformed selection regions"));
        }
        Some(compute_selection_digest(
            regions,
            &state.config.prompt_version,
            &locale,
            mode,
        ))
    } else {
        if payload.regions.as_deref().is_some_and(|r| !r.is_empty()) {
            return Err(AppError::bad_request(
                "regions are only accepted in selection mode",
            ));
        }
        None
    };

    let region_count = payload.regions.as_deref().map(|r| r.len()).unwrap_or(0) as i32;
    let hints = SizingHints {
        estimated_chunks: 1,
        image_count: region_count,
    };

    let key = GenerationKey {
        content_hash: payload.content_hash,
        unit_index: payload.unit_index,
        prompt_version: state.config.prompt_version.clone(),
        locale,
        mode,
        selection_digest,
    };

    let outcome = cache::try_start_generation(
        &mut conn,
        &key,
        payload.user_id,
        UNITS_PER_GENERATION,
        hints,
    )?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartGenerationResponse {
            job_id: outcome.job.id,
            started: outcome.started,
            status: outcome.job.status,
        }),
    ))
}

pub async fn get_generation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<GenerationJobResponse>> {
    let mut conn = state.db()?;
    let job = cache::get_job(&mut conn, id)?.ok_or_else(AppError::not_found)?;
    Ok(Json(GenerationJobResponse::from(job)))
}
