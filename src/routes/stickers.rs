use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::cache::{self, SizingHints};
use crate::error::{AppError, AppResult};
use crate::llm::{build_prompt, classify_error, FailureKind};
use crate::models::{Sticker, StickerVersion};
use crate::quota::UNITS_PER_GENERATION;
use crate::registry;
use crate::selection::{GenerationKey, GenerationMode};
use crate::state::AppState;
use crate::versions::{self, VersionError};

#[derive(Serialize)]
pub struct StickerVersionResponse {
    pub version_number: i32,
    pub content: String,
    pub created_at: String,
    pub current: bool,
}

#[derive(Serialize)]
pub struct StickerResponse {
    pub id: Uuid,
    pub file_id: Uuid,
    pub unit_index: i32,
    pub origin: String,
    pub current_version_number: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_content: Option<String>,
    pub versions: Vec<StickerVersionResponse>,
}

fn sticker_response(sticker: Sticker, versions: Vec<StickerVersion>) -> StickerResponse {
    let current_content = versions
        .iter()
        .find(|version| version.version_number == sticker.current_version_number)
        .map(|version| version.content.clone());
    let versions = versions
        .into_iter()
        .map(|version| StickerVersionResponse {
            current: version.version_number == sticker.current_version_number,
            version_number: version.version_number,
            created_at: version.created_at.and_utc().to_rfc3339(),
            content: version.content,
        })
        .collect();
    StickerResponse {
        id: sticker.id,
        file_id: sticker.file_id,
        unit_index: sticker.unit_index,
        origin: sticker.origin,
        current_version_number: sticker.current_version_number,
        current_content,
        versions,
    }
}

fn map_version_error(err: VersionError) -> AppError {
    match err {
        VersionError::NotFound => AppError::not_found(),
        VersionError::NotEligible => {
            AppError::conflict("user-authored stickers cannot be regenerated")
        }
        VersionError::NoSuchVersion(version) => {
            AppError::bad_request(format!("no stored version {version}"))
        }
        VersionError::Database(err) => AppError::from(err),
    }
}

pub async fn list_for_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> AppResult<Json<Vec<StickerResponse>>> {
    let mut conn = state.db()?;
    let stickers = versions::stickers_for_file(&mut conn, file_id).map_err(map_version_error)?;
    Ok(Json(
        stickers
            .into_iter()
            .map(|(sticker, versions)| sticker_response(sticker, versions))
            .collect(),
    ))
}

pub async fn get_sticker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StickerResponse>> {
    let mut conn = state.db()?;
    let sticker = versions::get_sticker(&mut conn, id).map_err(map_version_error)?;
    let stored = versions::stored_versions(&mut conn, id).map_err(map_version_error)?;
    Ok(Json(sticker_response(sticker, stored)))
}

#[derive(Deserialize)]
pub struct RefreshStickerRequest {
    pub user_id: Uuid,
    pub locale: Option<String>,
}

/// Regenerate a sticker's content. The new result replaces the archived
/// version slot per the circular rule, keeping at most two stored versions.
pub async fn refresh_sticker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RefreshStickerRequest>,
) -> AppResult<impl IntoResponse> {
    let locale = payload.locale.unwrap_or_else(|| "en".to_string());

    let mut conn = state.db()?;
    let sticker = versions::get_sticker(&mut conn, id).map_err(map_version_error)?;
    if sticker.origin != versions::ORIGIN_GENERATED {
        return Err(AppError::conflict(
            "user-authored stickers cannot be regenerated",
        ));
    }

    let content_hash = registry::content_hash_for_reference(
        &mut conn,
        registry::REF_TYPE_FILE,
        sticker.file_id,
    )?
    .ok_or_else(|| AppError::bad_request("file has no registered content"))?;

    let key = GenerationKey::page(
        content_hash.clone(),
        sticker.unit_index,
        state.config.prompt_version.clone(),
        locale.clone(),
        GenerationMode::Explain,
    );
    let outcome = cache::restart_generation(
        &mut conn,
        &key,
        payload.user_id,
        UNITS_PER_GENERATION,
        SizingHints::default(),
    )?;
    if !outcome.started {
        // Another requester's generation is in flight; share it.
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": outcome.job.id, "status": outcome.job.status })),
        )
            .into_response());
    }

    let owner = format!("refresh:{id}");
    let lock_timeout = chrono::Duration::seconds(state.config.generation_lock_timeout_seconds);
    let claimed = cache::claim_for_inline(&mut conn, outcome.job.id, &owner, lock_timeout)?;
    if !claimed {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": outcome.job.id, "status": cache::STATUS_GENERATING })),
        )
            .into_response());
    }
    drop(conn);

    let text = match state
        .extractor
        .extract_text(&content_hash, sticker.unit_index)
        .await
    {
        Ok(text) => text,
        Err(err) => {
            let mut conn = state.db()?;
            cache::fail_generation(&mut conn, outcome.job.id, &err.to_string(), true)?;
            return Err(AppError::new(
                StatusCode::BAD_GATEWAY,
                format!("extraction failed: {err}"),
            ));
        }
    };

    let prompt = build_prompt(GenerationMode::Explain, &locale, sticker.unit_index, &text);
    match state.generator.generate(&prompt).await {
        Ok(content) => {
            let mut conn = state.db()?;
            cache::complete_generation(&mut conn, outcome.job.id, json!({ "content": content }))?;
            let sticker =
                versions::create_version(&mut conn, id, &content).map_err(map_version_error)?;
            let stored = versions::stored_versions(&mut conn, id).map_err(map_version_error)?;
            Ok(Json(sticker_response(sticker, stored)).into_response())
        }
        Err(err) => {
            let mut conn = state.db()?;
            match classify_error(&err) {
                FailureKind::Permanent => {
                    cache::fail_generation(&mut conn, outcome.job.id, &err.to_string(), true)?;
                    Err(AppError::new(
                        StatusCode::BAD_GATEWAY,
                        format!("generation failed: {err}"),
                    ))
                }
                FailureKind::Transient => {
                    // Hand the retry to the worker and let the client poll.
                    cache::retry_generation_after(
                        &mut conn,
                        outcome.job.id,
                        crate::worker::backoff_with_jitter(1),
                        &err.to_string(),
                    )?;
                    Ok((
                        StatusCode::ACCEPTED,
                        Json(json!({
                            "job_id": outcome.job.id,
                            "status": cache::STATUS_GENERATING,
                        })),
                    )
                        .into_response())
                }
            }
        }
    }
}

#[derive(Deserialize)]
pub struct SwitchVersionRequest {
    pub version: i32,
}

/// Swap which stored slot is current; no content is created or destroyed.
pub async fn switch_version(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SwitchVersionRequest>,
) -> AppResult<Json<StickerResponse>> {
    let mut conn = state.db()?;
    let sticker =
        versions::switch_version(&mut conn, id, payload.version).map_err(map_version_error)?;
    let stored = versions::stored_versions(&mut conn, id).map_err(map_version_error)?;
    Ok(Json(sticker_response(sticker, stored)))
}
