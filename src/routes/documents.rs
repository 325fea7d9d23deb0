use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::ContentDocument;
use crate::registry;
use crate::state::AppState;

fn is_valid_content_hash(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|ch| ch.is_ascii_hexdigit())
}

#[derive(Deserialize)]
pub struct RegisterDocumentRequest {
    pub content_hash: String,
    pub total_units: Option<i32>,
    pub metadata: Option<Value>,
}

#[derive(Deserialize)]
pub struct ReferenceQuery {
    pub ref_type: Option<String>,
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub content_hash: String,
    pub total_units: i32,
    pub reference_count: i32,
    pub metadata: Value,
    pub last_accessed_at: String,
}

impl From<ContentDocument> for DocumentResponse {
    fn from(document: ContentDocument) -> Self {
        Self {
            content_hash: document.content_hash,
            total_units: document.total_units,
            reference_count: document.reference_count,
            metadata: document.metadata,
            last_accessed_at: document.last_accessed_at.and_utc().to_rfc3339(),
        }
    }
}

pub async fn register_document(
    State(state): State<AppState>,
    Json(payload): Json<RegisterDocumentRequest>,
) -> AppResult<impl IntoResponse> {
    if !is_valid_content_hash(&payload.content_hash) {
        return Err(AppError::bad_request("content_hash must be a hex sha-256"));
    }
    if let Some(units) = payload.total_units {
        if units < 0 {
            return Err(AppError::bad_request("total_units must not be negative"));
        }
    }

    let mut conn = state.db()?;
    let document = registry::upsert_document(
        &mut conn,
        &payload.content_hash,
        payload.total_units,
        payload.metadata,
    )?;
    Ok((StatusCode::CREATED, Json(DocumentResponse::from(document))))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(content_hash): Path<String>,
) -> AppResult<Json<DocumentResponse>> {
    let mut conn = state.db()?;
    let document =
        registry::get_document(&mut conn, &content_hash)?.ok_or_else(AppError::not_found)?;
    Ok(Json(DocumentResponse::from(document)))
}

#[derive(Serialize)]
pub struct ReferenceResponse {
    pub changed: bool,
    pub reference_count: i32,
}

pub async fn add_reference(
    State(state): State<AppState>,
    Path((content_hash, ref_id)): Path<(String, Uuid)>,
    Query(query): Query<ReferenceQuery>,
) -> AppResult<Json<ReferenceResponse>> {
    let ref_type = query.ref_type.unwrap_or_else(|| registry::REF_TYPE_FILE.to_string());
    let mut conn = state.db()?;
    registry::get_document(&mut conn, &content_hash)?.ok_or_else(AppError::not_found)?;

    let changed = registry::add_reference(&mut conn, &ref_type, ref_id, &content_hash)?;
    let document =
        registry::get_document(&mut conn, &content_hash)?.ok_or_else(AppError::not_found)?;
    Ok(Json(ReferenceResponse {
        changed,
        reference_count: document.reference_count,
    }))
}

pub async fn remove_reference(
    State(state): State<AppState>,
    Path((content_hash, ref_id)): Path<(String, Uuid)>,
    Query(query): Query<ReferenceQuery>,
) -> AppResult<Json<ReferenceResponse>> {
    let ref_type = query.ref_type.unwrap_or_else(|| registry::REF_TYPE_FILE.to_string());
    let mut conn = state.db()?;
    let changed = registry::remove_reference(&mut conn, &ref_type, ref_id)?;
    let document =
        registry::get_document(&mut conn, &content_hash)?.ok_or_else(AppError::not_found)?;
    Ok(Json(ReferenceResponse {
        changed,
        reference_count: document.reference_count,
    }))
}
