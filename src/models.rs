use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = content_documents)]
#[diesel(primary_key(content_hash))]
pub struct ContentDocument {
    pub content_hash: String,
    pub total_units: i32,
    pub reference_count: i32,
    pub metadata: serde_json::Value,
    pub last_accessed_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = content_documents)]
pub struct NewContentDocument {
    pub content_hash: String,
    pub total_units: i32,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = content_references)]
#[diesel(primary_key(ref_type, ref_id))]
pub struct ContentReference {
    pub ref_type: String,
    pub ref_id: Uuid,
    pub content_hash: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = content_references)]
pub struct NewContentReference {
    pub ref_type: String,
    pub ref_id: Uuid,
    pub content_hash: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = generation_jobs)]
pub struct GenerationJob {
    pub id: Uuid,
    pub content_hash: String,
    pub unit_index: i32,
    pub prompt_version: String,
    pub locale: String,
    pub mode: String,
    pub selection_digest: String,
    pub status: String,
    pub result_payload: Option<serde_json::Value>,
    pub attempts: i32,
    pub expires_at: NaiveDateTime,
    pub run_after: NaiveDateTime,
    pub locked_at: Option<NaiveDateTime>,
    pub lock_owner: Option<String>,
    pub last_error: Option<String>,
    pub requested_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = generation_jobs)]
pub struct NewGenerationJob {
    pub id: Uuid,
    pub content_hash: String,
    pub unit_index: i32,
    pub prompt_version: String,
    pub locale: String,
    pub mode: String,
    pub selection_digest: String,
    pub status: String,
    pub expires_at: NaiveDateTime,
    pub run_after: NaiveDateTime,
    pub requested_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = generation_sessions)]
pub struct GenerationSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub content_hash: String,
    pub locale: String,
    pub mode: String,
    pub total_units: i32,
    pub window_start: i32,
    pub window_end: i32,
    pub current_unit: i32,
    pub units_completed: serde_json::Value,
    pub units_in_progress: serde_json::Value,
    pub units_failed: serde_json::Value,
    pub state: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = generation_sessions)]
pub struct NewGenerationSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_id: Uuid,
    pub content_hash: String,
    pub locale: String,
    pub mode: String,
    pub total_units: i32,
    pub window_start: i32,
    pub window_end: i32,
    pub current_unit: i32,
    pub state: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = quota_charges)]
pub struct QuotaCharge {
    pub id: Uuid,
    pub job_id: Uuid,
    pub user_id: Uuid,
    pub bucket: String,
    pub units: i32,
    pub created_at: NaiveDateTime,
    pub refunded_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = quota_charges)]
pub struct NewQuotaCharge {
    pub id: Uuid,
    pub job_id: Uuid,
    pub user_id: Uuid,
    pub bucket: String,
    pub units: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = stickers)]
pub struct Sticker {
    pub id: Uuid,
    pub file_id: Uuid,
    pub unit_index: i32,
    pub origin: String,
    pub current_version_number: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = stickers)]
pub struct NewSticker {
    pub id: Uuid,
    pub file_id: Uuid,
    pub unit_index: i32,
    pub origin: String,
    pub current_version_number: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sticker_versions)]
#[diesel(belongs_to(Sticker))]
#[diesel(primary_key(sticker_id, version_number))]
pub struct StickerVersion {
    pub sticker_id: Uuid,
    pub version_number: i32,
    pub content: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sticker_versions)]
pub struct NewStickerVersion {
    pub sticker_id: Uuid,
    pub version_number: i32,
    pub content: String,
}
