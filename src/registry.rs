//! Canonical registry of document content.
//!
//! Identity is the content hash, never a per-user file id, which is what
//! lets generations be shared across users. Reference counts are guarded by
//! the `(ref_type, ref_id)` primary key: a duplicate add or remove cannot
//! move the count twice no matter how the calls interleave.

use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ContentDocument, NewContentDocument, NewContentReference};
use crate::schema::{content_documents, content_references};

pub const REF_TYPE_FILE: &str = "file";

pub fn upsert_document(
    conn: &mut PgConnection,
    content_hash: &str,
    total_units: Option<i32>,
    metadata: Option<Value>,
) -> QueryResult<ContentDocument> {
    let now = Utc::now().naive_utc();
    let new_document = NewContentDocument {
        content_hash: content_hash.to_string(),
        total_units: total_units.unwrap_or(0),
        metadata: metadata.clone().unwrap_or_else(|| Value::Object(Default::default())),
    };

    diesel::insert_into(content_documents::table)
        .values(&new_document)
        .on_conflict(content_documents::content_hash)
        .do_update()
        .set((
            content_documents::last_accessed_at.eq(now),
            content_documents::updated_at.eq(now),
        ))
        .execute(conn)?;

    if let Some(units) = total_units {
        diesel::update(content_documents::table.find(content_hash))
            .set(content_documents::total_units.eq(units))
            .execute(conn)?;
    }
    if let Some(metadata) = metadata {
        diesel::update(content_documents::table.find(content_hash))
            .set(content_documents::metadata.eq(metadata))
            .execute(conn)?;
    }

    content_documents::table.find(content_hash).first(conn)
}

pub fn get_document(
    conn: &mut PgConnection,
    content_hash: &str,
) -> QueryResult<Option<ContentDocument>> {
    content_documents::table
        .find(content_hash)
        .first(conn)
        .optional()
}

/// Read-through access bump; not correctness-critical.
pub fn touch_document(conn: &mut PgConnection, content_hash: &str) -> QueryResult<()> {
    diesel::update(content_documents::table.find(content_hash))
        .set(content_documents::last_accessed_at.eq(Utc::now().naive_utc()))
        .execute(conn)?;
    Ok(())
}

/// Register an external pointer at this content. Returns true when the
/// reference was newly added; repeated calls with the same id are no-ops
/// and bump the count exactly once.
pub fn add_reference(
    conn: &mut PgConnection,
    ref_type: &str,
    ref_id: Uuid,
    content_hash: &str,
) -> QueryResult<bool> {
    let new_reference = NewContentReference {
        ref_type: ref_type.to_string(),
        ref_id,
        content_hash: content_hash.to_string(),
    };

    let inserted = diesel::insert_into(content_references::table)
        .values(&new_reference)
        .on_conflict_do_nothing()
        .execute(conn)?;

    if inserted > 0 {
        diesel::update(content_documents::table.find(content_hash))
            .set((
                content_documents::reference_count
                    .eq(content_documents::reference_count + 1),
                content_documents::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
    }
    Ok(inserted > 0)
}

/// Resolve the content a file points at.
pub fn content_hash_for_reference(
    conn: &mut PgConnection,
    ref_type: &str,
    ref_id: Uuid,
) -> QueryResult<Option<String>> {
    content_references::table
        .find((ref_type.to_string(), ref_id))
        .select(content_references::content_hash)
        .first(conn)
        .optional()
}

/// Drop an external pointer. Returns true when a reference was actually
/// removed; the count never goes below zero.
pub fn remove_reference(
    conn: &mut PgConnection,
    ref_type: &str,
    ref_id: Uuid,
) -> QueryResult<bool> {
    let removed: Option<String> = diesel::delete(
        content_references::table.find((ref_type.to_string(), ref_id)),
    )
    .returning(content_references::content_hash)
    .get_result(conn)
    .optional()?;

    if let Some(content_hash) = removed {
        diesel::update(
            content_documents::table
                .find(content_hash)
                .filter(content_documents::reference_count.gt(0)),
        )
        .set((
            content_documents::reference_count.eq(content_documents::reference_count - 1),
            content_documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
        return Ok(true);
    }
    Ok(false)
}
