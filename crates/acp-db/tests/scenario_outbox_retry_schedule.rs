//! Scenario: retry bookkeeping on the outbox row.
//!
//! A retried row stays PENDING with attempts bumped, error metadata
//! recorded, and a future `next_attempt_at_utc` that keeps it out of the
//! claimable set until due. FAILED is terminal until rehydrated.
//!
//! All tests skip gracefully when `ACP_DATABASE_URL` is not set.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use acp_db::outbox::{
    outbox_claim_batch, outbox_enqueue, outbox_fetch, outbox_mark_failed, outbox_mark_retry,
    outbox_rehydrate_failed, LastError, NewOutboxEvent,
};

const TTL: Duration = Duration::from_secs(120);

async fn make_pool() -> anyhow::Result<Option<sqlx::PgPool>> {
    if std::env::var(acp_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: ACP_DATABASE_URL not set");
        return Ok(None);
    }
    Ok(Some(acp_db::testkit_db_pool().await?))
}

fn event(org: Uuid) -> NewOutboxEvent {
    NewOutboxEvent {
        event_id: Uuid::new_v4(),
        org_id: org,
        event_type: "access.command.executed".to_string(),
        aggregate_type: "command".to_string(),
        aggregate_id: Uuid::new_v4().to_string(),
        payload: "{}".to_string(),
        occurred_at_utc: Utc::now(),
    }
}

fn http_503() -> LastError {
    LastError {
        code: Some("HTTP".to_string()),
        message: "webhook returned 503".to_string(),
        http_status: Some(503),
    }
}

#[tokio::test]
#[ignore = "claims interfere across parallel tests; run: ACP_DATABASE_URL=... cargo test -p acp-db -- --include-ignored --test-threads=1"]
async fn retry_keeps_row_pending_with_schedule_and_error_metadata() -> anyhow::Result<()> {
    let Some(pool) = make_pool().await? else {
        return Ok(());
    };

    let ev = event(Uuid::new_v4());
    outbox_enqueue(&pool, &ev).await?;
    let claimed = outbox_claim_batch(&pool, 500, TTL, "dispatcher-A").await?;
    assert!(claimed.iter().any(|r| r.event_id == ev.event_id));

    let next = Utc::now() + ChronoDuration::seconds(60);
    let owned =
        outbox_mark_retry(&pool, ev.event_id, "dispatcher-A", TTL, &http_503(), next).await?;
    assert!(owned);

    let row = outbox_fetch(&pool, ev.event_id).await?.expect("row exists");
    assert_eq!(row.status, "PENDING", "retryable failure stays PENDING");
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_error_code.as_deref(), Some("HTTP"));
    assert_eq!(row.last_error_http_status, Some(503));
    assert!(row.last_error_at_utc.is_some());
    assert!(row.next_attempt_at_utc.expect("scheduled") > Utc::now());
    assert!(row.locked_by.is_none(), "lock released for the wait");

    // Not due yet: no dispatcher can claim it.
    let reclaim = outbox_claim_batch(&pool, 500, TTL, "dispatcher-B").await?;
    assert!(!reclaim.iter().any(|r| r.event_id == ev.event_id));

    // Force the schedule into the past; the row becomes claimable again.
    sqlx::query("update outbox_event set next_attempt_at_utc = now() - interval '1 second' where event_id = $1")
        .bind(ev.event_id)
        .execute(&pool)
        .await?;
    let reclaim = outbox_claim_batch(&pool, 500, TTL, "dispatcher-B").await?;
    assert!(reclaim.iter().any(|r| r.event_id == ev.event_id));
    Ok(())
}

#[tokio::test]
#[ignore = "claims interfere across parallel tests; run: ACP_DATABASE_URL=... cargo test -p acp-db -- --include-ignored --test-threads=1"]
async fn failed_is_terminal_until_rehydrated() -> anyhow::Result<()> {
    let Some(pool) = make_pool().await? else {
        return Ok(());
    };

    let org = Uuid::new_v4();
    let ev = event(org);
    outbox_enqueue(&pool, &ev).await?;
    let claimed = outbox_claim_batch(&pool, 500, TTL, "dispatcher-A").await?;
    assert!(claimed.iter().any(|r| r.event_id == ev.event_id));

    let owned = outbox_mark_failed(&pool, ev.event_id, "dispatcher-A", TTL, &http_503()).await?;
    assert!(owned);

    let row = outbox_fetch(&pool, ev.event_id).await?.expect("row exists");
    assert_eq!(row.status, "FAILED");
    assert!(row.locked_by.is_none());

    // FAILED rows are not claimable, even with a stale-everything TTL.
    let reclaim = outbox_claim_batch(&pool, 500, Duration::ZERO, "dispatcher-B").await?;
    assert!(!reclaim.iter().any(|r| r.event_id == ev.event_id));

    // Operator rehydration puts the tenant's rows back into rotation.
    let n = outbox_rehydrate_failed(&pool, Some(org)).await?;
    assert!(n >= 1);

    let row = outbox_fetch(&pool, ev.event_id).await?.expect("row exists");
    assert_eq!(row.status, "PENDING");
    assert_eq!(row.attempts, 0, "rehydration resets the retry budget");
    assert!(row.next_attempt_at_utc.is_none());
    Ok(())
}
