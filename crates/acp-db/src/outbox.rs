//! Transactional outbox storage.
//!
//! Rows are appended inside the business transaction and claimed by
//! dispatchers using a `FOR UPDATE SKIP LOCKED` CTE, so N nodes cooperate
//! without blocking or double-claiming. `locked_at_utc` / `locked_by` are
//! diagnostic: correctness comes from the row lock at claim time plus the
//! ownership-safe predicates on every completion update, and stale claims
//! are reclaimed purely by TTL.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: Uuid,
    pub org_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: String,
    pub occurred_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutboxEventRow {
    pub event_id: Uuid,
    /// Global insertion order; what the dispatcher sorts on.
    pub seq: i64,
    pub org_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: String,
    pub status: String, // PENDING | PUBLISHED | FAILED
    pub attempts: i32,
    pub occurred_at_utc: DateTime<Utc>,
    pub created_at_utc: DateTime<Utc>,
    pub published_at_utc: Option<DateTime<Utc>>,
    pub next_attempt_at_utc: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub last_error_http_status: Option<i32>,
    pub last_error_at_utc: Option<DateTime<Utc>>,
    pub locked_at_utc: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

/// Error metadata recorded on retry/failure completion.
#[derive(Debug, Clone)]
pub struct LastError {
    pub code: Option<String>,
    pub message: String,
    pub http_status: Option<i32>,
}

const OUTBOX_COLUMNS: &str = r#"
    event_id, seq, org_id, event_type, aggregate_type, aggregate_id, payload,
    status, attempts, occurred_at_utc, created_at_utc, published_at_utc,
    next_attempt_at_utc, last_error_code, last_error_message,
    last_error_http_status, last_error_at_utc, locked_at_utc, locked_by
"#;

fn map_row(row: &PgRow) -> Result<OutboxEventRow> {
    Ok(OutboxEventRow {
        event_id: row.try_get("event_id")?,
        seq: row.try_get("seq")?,
        org_id: row.try_get("org_id")?,
        event_type: row.try_get("event_type")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        payload: row.try_get("payload")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        occurred_at_utc: row.try_get("occurred_at_utc")?,
        created_at_utc: row.try_get("created_at_utc")?,
        published_at_utc: row.try_get("published_at_utc")?,
        next_attempt_at_utc: row.try_get("next_attempt_at_utc")?,
        last_error_code: row.try_get("last_error_code")?,
        last_error_message: row.try_get("last_error_message")?,
        last_error_http_status: row.try_get("last_error_http_status")?,
        last_error_at_utc: row.try_get("last_error_at_utc")?,
        locked_at_utc: row.try_get("locked_at_utc")?,
        locked_by: row.try_get("locked_by")?,
    })
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

/// Append a PENDING row. Runs on the business transaction's executor:
/// failure here must abort the caller's transaction.
pub async fn outbox_enqueue(ex: impl PgExecutor<'_>, ev: &NewOutboxEvent) -> Result<()> {
    sqlx::query(
        r#"
        insert into outbox_event (
          event_id, org_id, event_type, aggregate_type, aggregate_id,
          payload, status, occurred_at_utc
        ) values ($1,$2,$3,$4,$5,$6,'PENDING',$7)
        "#,
    )
    .bind(ev.event_id)
    .bind(ev.org_id)
    .bind(&ev.event_type)
    .bind(&ev.aggregate_type)
    .bind(&ev.aggregate_id)
    .bind(&ev.payload)
    .bind(ev.occurred_at_utc)
    .execute(ex)
    .await
    .context("outbox_enqueue failed")?;
    Ok(())
}

/// Atomically claim up to `batch_size` dispatchable rows.
///
/// A row is dispatchable when it is PENDING, due
/// (`next_attempt_at_utc` null or past), and not held by a live claim
/// (`locked_at_utc` null or older than the TTL). `SKIP LOCKED` means
/// concurrent dispatchers never block on, nor double-claim, a row.
pub async fn outbox_claim_batch(
    pool: &PgPool,
    batch_size: i64,
    lock_ttl: Duration,
    instance_id: &str,
) -> Result<Vec<OutboxEventRow>> {
    let sql = format!(
        r#"
        with to_claim as (
            select event_id
            from outbox_event
            where status = 'PENDING'
              and (next_attempt_at_utc is null or next_attempt_at_utc <= now())
              and (locked_at_utc is null
                   or locked_at_utc <= now() - ($2 * interval '1 second'))
            order by seq asc
            limit $1
            for update skip locked
        )
        update outbox_event
           set locked_at_utc = now(),
               locked_by     = $3
         where event_id in (select event_id from to_claim)
        returning {OUTBOX_COLUMNS}
        "#
    );
    let rows = sqlx::query(&sql)
    .bind(batch_size)
    .bind(ttl_secs(lock_ttl))
    .bind(instance_id)
    .fetch_all(pool)
    .await
    .context("outbox_claim_batch failed")?;

    // RETURNING order is unspecified; restore issue order for dispatch.
    let mut out: Vec<OutboxEventRow> = rows.iter().map(map_row).collect::<Result<_>>()?;
    out.sort_by_key(|r| r.seq);
    Ok(out)
}

// Ownership-safe completion predicate: the updating dispatcher must still
// own the claim, or the claim must have gone stale. A claim lost to TTL
// reclaim makes the update a no-op and the caller skips the row.
const OWNERSHIP_GUARD: &str = r#"
         where event_id = $1
           and status = 'PENDING'
           and (locked_by = $2
                or locked_at_utc is null
                or locked_at_utc <= now() - ($3 * interval '1 second'))
"#;

/// Terminal success: PENDING → PUBLISHED. Returns `false` when the claim
/// was lost.
pub async fn outbox_mark_published(
    pool: &PgPool,
    event_id: Uuid,
    instance_id: &str,
    lock_ttl: Duration,
) -> Result<bool> {
    let sql = format!(
        r#"
        update outbox_event
           set status = 'PUBLISHED',
               published_at_utc = now(),
               locked_at_utc = null,
               locked_by = null
        {OWNERSHIP_GUARD}
        returning event_id
        "#
    );
    let row: Option<(Uuid,)> = sqlx::query_as(&sql)
    .bind(event_id)
    .bind(instance_id)
    .bind(ttl_secs(lock_ttl))
    .fetch_optional(pool)
    .await
    .context("outbox_mark_published failed")?;

    Ok(row.is_some())
}

/// Retryable failure: stay PENDING, bump attempts, record error metadata,
/// schedule the next attempt, release the lock.
pub async fn outbox_mark_retry(
    pool: &PgPool,
    event_id: Uuid,
    instance_id: &str,
    lock_ttl: Duration,
    error: &LastError,
    next_attempt_at_utc: DateTime<Utc>,
) -> Result<bool> {
    let sql = format!(
        r#"
        update outbox_event
           set attempts = attempts + 1,
               last_error_code = $4,
               last_error_message = $5,
               last_error_http_status = $6,
               last_error_at_utc = now(),
               next_attempt_at_utc = $7,
               locked_at_utc = null,
               locked_by = null
        {OWNERSHIP_GUARD}
        returning event_id
        "#
    );
    let row: Option<(Uuid,)> = sqlx::query_as(&sql)
    .bind(event_id)
    .bind(instance_id)
    .bind(ttl_secs(lock_ttl))
    .bind(&error.code)
    .bind(&error.message)
    .bind(error.http_status)
    .bind(next_attempt_at_utc)
    .fetch_optional(pool)
    .await
    .context("outbox_mark_retry failed")?;

    Ok(row.is_some())
}

/// Terminal failure: PENDING → FAILED (attempts exhausted or
/// non-retryable). FAILED rows stay put until an operator rehydrates them.
pub async fn outbox_mark_failed(
    pool: &PgPool,
    event_id: Uuid,
    instance_id: &str,
    lock_ttl: Duration,
    error: &LastError,
) -> Result<bool> {
    let sql = format!(
        r#"
        update outbox_event
           set status = 'FAILED',
               attempts = attempts + 1,
               last_error_code = $4,
               last_error_message = $5,
               last_error_http_status = $6,
               last_error_at_utc = now(),
               locked_at_utc = null,
               locked_by = null
        {OWNERSHIP_GUARD}
        returning event_id
        "#
    );
    let row: Option<(Uuid,)> = sqlx::query_as(&sql)
    .bind(event_id)
    .bind(instance_id)
    .bind(ttl_secs(lock_ttl))
    .bind(&error.code)
    .bind(&error.message)
    .bind(error.http_status)
    .fetch_optional(pool)
    .await
    .context("outbox_mark_failed failed")?;

    Ok(row.is_some())
}

/// Safety-net janitor: clear locks that outlived the TTL on rows still
/// PENDING. Returns how many locks were released.
pub async fn outbox_release_expired_locks(pool: &PgPool, lock_ttl: Duration) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update outbox_event
           set locked_at_utc = null,
               locked_by = null
         where status = 'PENDING'
           and locked_at_utc is not null
           and locked_at_utc <= now() - ($1 * interval '1 second')
        "#,
    )
    .bind(ttl_secs(lock_ttl))
    .execute(pool)
    .await
    .context("outbox_release_expired_locks failed")?;

    Ok(res.rows_affected())
}

/// Operator action: put FAILED rows back into rotation. Resets attempts
/// and error metadata so the retry schedule starts fresh.
pub async fn outbox_rehydrate_failed(pool: &PgPool, org_id: Option<Uuid>) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update outbox_event
           set status = 'PENDING',
               attempts = 0,
               next_attempt_at_utc = null,
               locked_at_utc = null,
               locked_by = null
         where status = 'FAILED'
           and ($1::uuid is null or org_id = $1)
        "#,
    )
    .bind(org_id)
    .execute(pool)
    .await
    .context("outbox_rehydrate_failed failed")?;

    Ok(res.rows_affected())
}

pub async fn outbox_fetch(pool: &PgPool, event_id: Uuid) -> Result<Option<OutboxEventRow>> {
    let sql = format!("select {OUTBOX_COLUMNS} from outbox_event where event_id = $1");
    let row = sqlx::query(&sql)
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .context("outbox_fetch failed")?;

    row.as_ref().map(map_row).transpose()
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Aggregate snapshot the dispatcher publishes as gauges each tick.
#[derive(Debug, Clone, Default)]
pub struct OutboxStats {
    pub pending: i64,
    /// PENDING rows currently held by a live claim.
    pub inflight: i64,
    /// PENDING rows dispatchable right now.
    pub ready: i64,
    pub failed: i64,
    pub oldest_pending_age_secs: Option<i64>,
    pub oldest_ready_age_secs: Option<i64>,
    pub oldest_inflight_age_secs: Option<i64>,
}

pub async fn outbox_stats(pool: &PgPool, lock_ttl: Duration) -> Result<OutboxStats> {
    let row = sqlx::query(
        r#"
        select
          count(*) filter (where status = 'PENDING')                  as pending,
          count(*) filter (where status = 'FAILED')                   as failed,
          count(*) filter (where status = 'PENDING'
            and locked_at_utc is not null
            and locked_at_utc >  now() - ($1 * interval '1 second'))  as inflight,
          count(*) filter (where status = 'PENDING'
            and (next_attempt_at_utc is null or next_attempt_at_utc <= now())
            and (locked_at_utc is null
                 or locked_at_utc <= now() - ($1 * interval '1 second'))) as ready,
          extract(epoch from now() - min(created_at_utc)
            filter (where status = 'PENDING'))::bigint                as oldest_pending_age,
          extract(epoch from now() - min(created_at_utc)
            filter (where status = 'PENDING'
              and (next_attempt_at_utc is null or next_attempt_at_utc <= now())
              and (locked_at_utc is null
                   or locked_at_utc <= now() - ($1 * interval '1 second'))))::bigint
                                                                      as oldest_ready_age,
          extract(epoch from now() - min(locked_at_utc)
            filter (where status = 'PENDING'
              and locked_at_utc is not null
              and locked_at_utc > now() - ($1 * interval '1 second')))::bigint
                                                                      as oldest_inflight_age
        from outbox_event
        "#,
    )
    .bind(ttl_secs(lock_ttl))
    .fetch_one(pool)
    .await
    .context("outbox_stats failed")?;

    Ok(OutboxStats {
        pending: row.try_get("pending")?,
        failed: row.try_get("failed")?,
        inflight: row.try_get("inflight")?,
        ready: row.try_get("ready")?,
        oldest_pending_age_secs: row.try_get("oldest_pending_age")?,
        oldest_ready_age_secs: row.try_get("oldest_ready_age")?,
        oldest_inflight_age_secs: row.try_get("oldest_inflight_age")?,
    })
}
