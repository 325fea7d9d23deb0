//! Shared generation cache over the `generation_jobs` table.
//!
//! One row per generation key across every status; the unique index over
//! the key columns is what decides "who gets to generate" when writers
//! race. Everything here is written against a shared Postgres with many
//! application and worker processes; no in-process state is assumed.
//!
//! Lifecycle: the first requester to win the insert becomes `generating`;
//! an executor (session runner inline, or the background worker) moves the
//! row to `ready` or `failed`; transient failures push `run_after` forward
//! and keep the row `generating`. Terminal rows are revived in place so the
//! unique index stays total.

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{GenerationJob, NewGenerationJob};
use crate::quota;
use crate::registry;
use crate::schema::generation_jobs;
use crate::selection::GenerationKey;

pub const STATUS_GENERATING: &str = "generating";
pub const STATUS_READY: &str = "ready";
pub const STATUS_FAILED: &str = "failed";

const MIN_EXPIRY_SECONDS: i64 = 120;
const MAX_EXPIRY_SECONDS: i64 = 900;
const SECONDS_PER_CHUNK: i64 = 30;
const SECONDS_PER_IMAGE: i64 = 20;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// What a requester sees for a key.
#[derive(Debug)]
pub enum CacheLookup {
    Ready(Value),
    Generating { job_id: Uuid },
    Failed { job_id: Uuid, reason: Option<String> },
    NotFound,
}

/// Rough cost signals for a pending generation, used to size its deadline:
/// cheap jobs get reclaimed quickly, expensive ones are not killed early.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizingHints {
    pub estimated_chunks: i32,
    pub image_count: i32,
}

pub fn expiry_for(hints: SizingHints) -> ChronoDuration {
    let seconds = MIN_EXPIRY_SECONDS
        + i64::from(hints.estimated_chunks.max(0)) * SECONDS_PER_CHUNK
        + i64::from(hints.image_count.max(0)) * SECONDS_PER_IMAGE;
    ChronoDuration::seconds(seconds.clamp(MIN_EXPIRY_SECONDS, MAX_EXPIRY_SECONDS))
}

#[derive(Debug)]
pub struct StartOutcome {
    pub started: bool,
    pub job: GenerationJob,
}

fn by_key(
    key: &GenerationKey,
) -> generation_jobs::BoxedQuery<'_, diesel::pg::Pg> {
    generation_jobs::table
        .filter(generation_jobs::content_hash.eq(&key.content_hash))
        .filter(generation_jobs::unit_index.eq(key.unit_index))
        .filter(generation_jobs::prompt_version.eq(&key.prompt_version))
        .filter(generation_jobs::locale.eq(&key.locale))
        .filter(generation_jobs::mode.eq(key.mode.as_str()))
        .filter(generation_jobs::selection_digest.eq(key.digest_column()))
        .into_boxed()
}

pub fn find_job_by_key(
    conn: &mut PgConnection,
    key: &GenerationKey,
) -> CacheResult<Option<GenerationJob>> {
    Ok(by_key(key).first::<GenerationJob>(conn).optional()?)
}

pub fn get_job(conn: &mut PgConnection, job_id: Uuid) -> CacheResult<Option<GenerationJob>> {
    Ok(generation_jobs::table
        .find(job_id)
        .first::<GenerationJob>(conn)
        .optional()?)
}

pub fn lookup(conn: &mut PgConnection, key: &GenerationKey) -> CacheResult<CacheLookup> {
    let job = match find_job_by_key(conn, key)? {
        Some(job) => job,
        None => return Ok(CacheLookup::NotFound),
    };
    Ok(lookup_from_job(conn, &job)?)
}

fn lookup_from_job(conn: &mut PgConnection, job: &GenerationJob) -> QueryResult<CacheLookup> {
    match job.status.as_str() {
        STATUS_READY => {
            registry::touch_document(conn, &job.content_hash)?;
            Ok(CacheLookup::Ready(
                job.result_payload.clone().unwrap_or(Value::Null),
            ))
        }
        STATUS_FAILED => Ok(CacheLookup::Failed {
            job_id: job.id,
            reason: job.last_error.clone(),
        }),
        _ => Ok(CacheLookup::Generating { job_id: job.id }),
    }
}

/// Attempt to become the single generator for `key`.
///
/// Insert-first: the unique index, not application logic, resolves races.
/// Losing the insert returns the existing job with `started = false`; a
/// terminal `failed` row is revived in place (single winner via the
/// conditional update). Winners are charged quota against the job id.
pub fn try_start_generation(
    conn: &mut PgConnection,
    key: &GenerationKey,
    requested_by: Uuid,
    quota_units: i32,
    hints: SizingHints,
) -> CacheResult<StartOutcome> {
    let now = Utc::now().naive_utc();
    let new_job = NewGenerationJob {
        id: Uuid::new_v4(),
        content_hash: key.content_hash.clone(),
        unit_index: key.unit_index,
        prompt_version: key.prompt_version.clone(),
        locale: key.locale.clone(),
        mode: key.mode.as_str().to_string(),
        selection_digest: key.digest_column().to_string(),
        status: STATUS_GENERATING.to_string(),
        expires_at: now + expiry_for(hints),
        run_after: now,
        requested_by: Some(requested_by),
    };

    match diesel::insert_into(generation_jobs::table)
        .values(&new_job)
        .execute(conn)
    {
        Ok(_) => {
            quota::charge(
                conn,
                new_job.id,
                requested_by,
                quota::BUCKET_GENERATION,
                quota_units,
            )?;
            let job = generation_jobs::table.find(new_job.id).first(conn)?;
            Ok(StartOutcome { started: true, job })
        }
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            let existing: GenerationJob = by_key(key).first(conn)?;
            if existing.status == STATUS_FAILED {
                return revive_job(conn, &existing, requested_by, quota_units, hints, false);
            }
            Ok(StartOutcome {
                started: false,
                job: existing,
            })
        }
        Err(err) => Err(err.into()),
    }
}

/// Force a fresh generation for a key that may already be `ready`; used by
/// sticker refresh. Still loses to a concurrent non-terminal job.
pub fn restart_generation(
    conn: &mut PgConnection,
    key: &GenerationKey,
    requested_by: Uuid,
    quota_units: i32,
    hints: SizingHints,
) -> CacheResult<StartOutcome> {
    match find_job_by_key(conn, key)? {
        None => try_start_generation(conn, key, requested_by, quota_units, hints),
        Some(existing) if existing.status == STATUS_GENERATING => Ok(StartOutcome {
            started: false,
            job: existing,
        }),
        Some(existing) => revive_job(conn, &existing, requested_by, quota_units, hints, true),
    }
}

fn revive_job(
    conn: &mut PgConnection,
    existing: &GenerationJob,
    requested_by: Uuid,
    quota_units: i32,
    hints: SizingHints,
    include_ready: bool,
) -> CacheResult<StartOutcome> {
    let now = Utc::now().naive_utc();
    let revivable: Vec<&str> = if include_ready {
        vec![STATUS_FAILED, STATUS_READY]
    } else {
        vec![STATUS_FAILED]
    };

    let revived = diesel::update(
        generation_jobs::table
            .find(existing.id)
            .filter(generation_jobs::status.eq_any(revivable)),
    )
    .set((
        generation_jobs::status.eq(STATUS_GENERATING),
        generation_jobs::result_payload.eq::<Option<Value>>(None),
        generation_jobs::attempts.eq(0),
        generation_jobs::expires_at.eq(now + expiry_for(hints)),
        generation_jobs::run_after.eq(now),
        generation_jobs::locked_at.eq::<Option<NaiveDateTime>>(None),
        generation_jobs::lock_owner.eq::<Option<String>>(None),
        generation_jobs::last_error.eq::<Option<String>>(None),
        generation_jobs::requested_by.eq(Some(requested_by)),
        generation_jobs::updated_at.eq(now),
    ))
    .execute(conn)?;

    if revived > 0 {
        quota::charge(
            conn,
            existing.id,
            requested_by,
            quota::BUCKET_GENERATION,
            quota_units,
        )?;
    }
    let job = generation_jobs::table.find(existing.id).first(conn)?;
    Ok(StartOutcome {
        started: revived > 0,
        job,
    })
}

pub fn complete_generation(
    conn: &mut PgConnection,
    job_id: Uuid,
    payload: Value,
) -> CacheResult<()> {
    diesel::update(generation_jobs::table.find(job_id))
        .set((
            generation_jobs::status.eq(STATUS_READY),
            generation_jobs::result_payload.eq(Some(payload)),
            generation_jobs::locked_at.eq::<Option<NaiveDateTime>>(None),
            generation_jobs::lock_owner.eq::<Option<String>>(None),
            generation_jobs::last_error.eq::<Option<String>>(None),
            generation_jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Terminal failure. When `refund` is set the job's outstanding quota
/// charges are refunded; the ledger predicate makes a double invocation
/// harmless.
pub fn fail_generation(
    conn: &mut PgConnection,
    job_id: Uuid,
    reason: &str,
    refund: bool,
) -> CacheResult<()> {
    diesel::update(generation_jobs::table.find(job_id))
        .set((
            generation_jobs::status.eq(STATUS_FAILED),
            generation_jobs::locked_at.eq::<Option<NaiveDateTime>>(None),
            generation_jobs::lock_owner.eq::<Option<String>>(None),
            generation_jobs::last_error.eq(Some(reason.to_string())),
            generation_jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    if refund {
        quota::refund_job_charges(conn, job_id)?;
    }
    Ok(())
}

/// Transient failure: keep the row `generating`, push `run_after` out, and
/// release the lock so any worker can pick it up after the delay.
pub fn retry_generation_after(
    conn: &mut PgConnection,
    job_id: Uuid,
    delay: ChronoDuration,
    error_message: &str,
) -> CacheResult<()> {
    let now = Utc::now().naive_utc();
    diesel::update(generation_jobs::table.find(job_id))
        .set((
            generation_jobs::run_after.eq(now + delay),
            generation_jobs::locked_at.eq::<Option<NaiveDateTime>>(None),
            generation_jobs::lock_owner.eq::<Option<String>>(None),
            generation_jobs::last_error.eq(Some(error_message.to_string())),
            generation_jobs::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

/// Claim up to `batch_size` runnable jobs for `worker_id`. `FOR UPDATE SKIP
/// LOCKED` keeps concurrent workers off each other's rows; stale locks older
/// than `lock_timeout` are treated as abandoned and reclaimed. Claiming
/// counts as an attempt.
pub fn claim_batch(
    conn: &mut PgConnection,
    worker_id: &str,
    batch_size: i64,
    lock_timeout: ChronoDuration,
) -> CacheResult<Vec<GenerationJob>> {
    let now = Utc::now().naive_utc();
    let stale_cutoff = now - lock_timeout;

    conn.transaction(|conn| {
        let candidates: Vec<GenerationJob> = generation_jobs::table
            .filter(generation_jobs::status.eq(STATUS_GENERATING))
            .filter(generation_jobs::run_after.le(now))
            .filter(
                generation_jobs::locked_at
                    .is_null()
                    .or(generation_jobs::locked_at.lt(stale_cutoff)),
            )
            .order(generation_jobs::run_after.asc())
            .limit(batch_size)
            .for_update()
            .skip_locked()
            .load(conn)?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for job in candidates {
            diesel::update(generation_jobs::table.find(job.id))
                .set((
                    generation_jobs::locked_at.eq(Some(now)),
                    generation_jobs::lock_owner.eq(Some(worker_id.to_string())),
                    generation_jobs::attempts.eq(job.attempts + 1),
                    generation_jobs::updated_at.eq(now),
                ))
                .execute(conn)?;
            let refreshed = generation_jobs::table.find(job.id).first(conn)?;
            claimed.push(refreshed);
        }
        Ok::<Vec<GenerationJob>, diesel::result::Error>(claimed)
    })
    .map_err(CacheError::from)
}

/// Claim one specific job for inline execution by the requester that just
/// created it. Fails when another executor already holds a fresh lock.
pub fn claim_for_inline(
    conn: &mut PgConnection,
    job_id: Uuid,
    owner: &str,
    lock_timeout: ChronoDuration,
) -> CacheResult<bool> {
    let now = Utc::now().naive_utc();
    let stale_cutoff = now - lock_timeout;
    let claimed = diesel::update(
        generation_jobs::table
            .find(job_id)
            .filter(generation_jobs::status.eq(STATUS_GENERATING))
            .filter(
                generation_jobs::locked_at
                    .is_null()
                    .or(generation_jobs::locked_at.lt(stale_cutoff)),
            ),
    )
    .set((
        generation_jobs::locked_at.eq(Some(now)),
        generation_jobs::lock_owner.eq(Some(owner.to_string())),
        generation_jobs::attempts.eq(generation_jobs::attempts + 1),
        generation_jobs::updated_at.eq(now),
    ))
    .execute(conn)?;
    Ok(claimed > 0)
}

/// Jobs whose deadline passed without reaching a terminal state. The worker
/// fails each with a refund; this sweep is the only timeout authority.
pub fn expired_jobs(
    conn: &mut PgConnection,
    limit: i64,
) -> CacheResult<Vec<GenerationJob>> {
    let now = Utc::now().naive_utc();
    Ok(generation_jobs::table
        .filter(generation_jobs::status.eq(STATUS_GENERATING))
        .filter(generation_jobs::expires_at.lt(now))
        .order(generation_jobs::expires_at.asc())
        .limit(limit)
        .load(conn)?)
}

/// Maintenance: delete terminal jobs older than the retention window.
pub fn purge_terminal_jobs(
    conn: &mut PgConnection,
    older_than: ChronoDuration,
) -> CacheResult<usize> {
    let cutoff = Utc::now().naive_utc() - older_than;
    Ok(diesel::delete(
        generation_jobs::table
            .filter(generation_jobs::status.eq_any([STATUS_READY, STATUS_FAILED]))
            .filter(generation_jobs::updated_at.lt(cutoff)),
    )
    .execute(conn)?)
}
