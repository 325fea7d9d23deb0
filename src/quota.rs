//! Quota ledger tied to generation jobs.
//!
//! A charge is recorded when a requester wins the right to generate; a
//! terminal failure refunds it. Refunds flip `refunded_at` under a
//! `refunded_at IS NULL` predicate, so invoking the refund twice cannot
//! credit the user twice.

use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use uuid::Uuid;

use crate::models::{NewQuotaCharge, QuotaCharge};
use crate::schema::quota_charges;

pub const BUCKET_GENERATION: &str = "generation";

/// Quota units charged per unit generation.
pub const UNITS_PER_GENERATION: i32 = 1;

pub fn charge(
    conn: &mut PgConnection,
    job_id: Uuid,
    user_id: Uuid,
    bucket: &str,
    units: i32,
) -> QueryResult<QuotaCharge> {
    let new_charge = NewQuotaCharge {
        id: Uuid::new_v4(),
        job_id,
        user_id,
        bucket: bucket.to_string(),
        units,
    };
    diesel::insert_into(quota_charges::table)
        .values(&new_charge)
        .execute(conn)?;
    quota_charges::table.find(new_charge.id).first(conn)
}

/// Refund every outstanding charge for a job. Idempotent: already-refunded
/// rows are excluded by the predicate, so the returned count is the number
/// of charges refunded by this call specifically.
pub fn refund_job_charges(conn: &mut PgConnection, job_id: Uuid) -> QueryResult<usize> {
    diesel::update(
        quota_charges::table
            .filter(quota_charges::job_id.eq(job_id))
            .filter(quota_charges::refunded_at.is_null()),
    )
    .set(quota_charges::refunded_at.eq(Some(Utc::now().naive_utc())))
    .execute(conn)
}

pub fn charges_for_job(conn: &mut PgConnection, job_id: Uuid) -> QueryResult<Vec<QuotaCharge>> {
    quota_charges::table
        .filter(quota_charges::job_id.eq(job_id))
        .order(quota_charges::created_at.asc())
        .load(conn)
}

pub fn refunded_count_for_job(conn: &mut PgConnection, job_id: Uuid) -> QueryResult<i64> {
    quota_charges::table
        .filter(quota_charges::job_id.eq(job_id))
        .filter(quota_charges::refunded_at.is_not_null())
        .count()
        .get_result(conn)
}
