//! Sticker content versioning.
//!
//! A sticker holds the generated note for one document unit. History is
//! bounded to two stored versions by circular replacement over two fixed
//! slots: each new generation is written into the slot that is not current,
//! then that slot becomes current. The archived slot therefore always holds
//! exactly the immediately-preceding content. Only stickers that originated
//! from automatic generation are eligible for re-versioning.

use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{NewSticker, NewStickerVersion, Sticker, StickerVersion};
use crate::schema::{sticker_versions, stickers};

pub const ORIGIN_GENERATED: &str = "generated";
pub const ORIGIN_USER: &str = "user";

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("sticker not found")]
    NotFound,
    #[error("sticker is user-authored and cannot be regenerated")]
    NotEligible,
    #[error("no stored version {0} for this sticker")]
    NoSuchVersion(i32),
}

pub type VersionResult<T> = Result<T, VersionError>;

/// The slot the next generation is written into.
pub fn replacement_slot(current_version_number: i32) -> i32 {
    if current_version_number == 2 {
        1
    } else {
        2
    }
}

/// Write generated content for a unit: creates the sticker on first
/// generation, applies circular replacement on refresh. A user-authored
/// sticker for the same unit is left untouched and returned as-is.
pub fn record_generated_content(
    conn: &mut PgConnection,
    file_id: Uuid,
    unit_index: i32,
    content: &str,
) -> VersionResult<Sticker> {
    conn.transaction(|conn| {
        let existing: Option<Sticker> = stickers::table
            .filter(stickers::file_id.eq(file_id))
            .filter(stickers::unit_index.eq(unit_index))
            .for_update()
            .first(conn)
            .optional()?;

        match existing {
            None => {
                let new_sticker = NewSticker {
                    id: Uuid::new_v4(),
                    file_id,
                    unit_index,
                    origin: ORIGIN_GENERATED.to_string(),
                    current_version_number: 1,
                };
                diesel::insert_into(stickers::table)
                    .values(&new_sticker)
                    .execute(conn)?;
                diesel::insert_into(sticker_versions::table)
                    .values(&NewStickerVersion {
                        sticker_id: new_sticker.id,
                        version_number: 1,
                        content: content.to_string(),
                    })
                    .execute(conn)?;
                Ok(stickers::table.find(new_sticker.id).first(conn)?)
            }
            Some(sticker) if sticker.origin == ORIGIN_GENERATED => {
                apply_replacement(conn, &sticker, content)
            }
            Some(sticker) => Ok(sticker),
        }
    })
}

/// Replace the archived slot with new content and make it current.
pub fn create_version(
    conn: &mut PgConnection,
    sticker_id: Uuid,
    content: &str,
) -> VersionResult<Sticker> {
    conn.transaction(|conn| {
        let sticker: Sticker = stickers::table
            .find(sticker_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(VersionError::NotFound)?;
        if sticker.origin != ORIGIN_GENERATED {
            return Err(VersionError::NotEligible);
        }
        apply_replacement(conn, &sticker, content)
    })
}

fn apply_replacement(
    conn: &mut PgConnection,
    sticker: &Sticker,
    content: &str,
) -> VersionResult<Sticker> {
    let now = Utc::now().naive_utc();
    let target_slot = replacement_slot(sticker.current_version_number);

    diesel::insert_into(sticker_versions::table)
        .values(&NewStickerVersion {
            sticker_id: sticker.id,
            version_number: target_slot,
            content: content.to_string(),
        })
        .on_conflict((
            sticker_versions::sticker_id,
            sticker_versions::version_number,
        ))
        .do_update()
        .set((
            sticker_versions::content.eq(content),
            sticker_versions::created_at.eq(now),
        ))
        .execute(conn)?;

    diesel::update(stickers::table.find(sticker.id))
        .set((
            stickers::current_version_number.eq(target_slot),
            stickers::updated_at.eq(now),
        ))
        .execute(conn)?;

    Ok(stickers::table.find(sticker.id).first(conn)?)
}

/// Repoint the current marker between the two slots; no content moves.
pub fn switch_version(
    conn: &mut PgConnection,
    sticker_id: Uuid,
    target: i32,
) -> VersionResult<Sticker> {
    if target != 1 && target != 2 {
        return Err(VersionError::NoSuchVersion(target));
    }
    conn.transaction(|conn| {
        let sticker: Sticker = stickers::table
            .find(sticker_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(VersionError::NotFound)?;

        let exists: Option<StickerVersion> = sticker_versions::table
            .find((sticker.id, target))
            .first(conn)
            .optional()?;
        if exists.is_none() {
            return Err(VersionError::NoSuchVersion(target));
        }

        diesel::update(stickers::table.find(sticker.id))
            .set((
                stickers::current_version_number.eq(target),
                stickers::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(stickers::table.find(sticker.id).first(conn)?)
    })
}

pub fn get_sticker(conn: &mut PgConnection, sticker_id: Uuid) -> VersionResult<Sticker> {
    stickers::table
        .find(sticker_id)
        .first::<Sticker>(conn)
        .optional()?
        .ok_or(VersionError::NotFound)
}

pub fn stored_versions(
    conn: &mut PgConnection,
    sticker_id: Uuid,
) -> VersionResult<Vec<StickerVersion>> {
    Ok(sticker_versions::table
        .filter(sticker_versions::sticker_id.eq(sticker_id))
        .order(sticker_versions::version_number.asc())
        .load(conn)?)
}

pub fn current_content(conn: &mut PgConnection, sticker_id: Uuid) -> VersionResult<String> {
    let sticker = get_sticker(conn, sticker_id)?;
    let version: StickerVersion = sticker_versions::table
        .find((sticker.id, sticker.current_version_number))
        .first(conn)
        .optional()?
        .ok_or(VersionError::NoSuchVersion(sticker.current_version_number))?;
    Ok(version.content)
}

pub fn stickers_for_file(
    conn: &mut PgConnection,
    file_id: Uuid,
) -> VersionResult<Vec<(Sticker, Vec<StickerVersion>)>> {
    let all: Vec<Sticker> = stickers::table
        .filter(stickers::file_id.eq(file_id))
        .order(stickers::unit_index.asc())
        .load(conn)?;
    let versions: Vec<StickerVersion> = StickerVersion::belonging_to(&all).load(conn)?;
    let grouped = versions.grouped_by(&all);
    Ok(all.into_iter().zip(grouped).collect())
}
