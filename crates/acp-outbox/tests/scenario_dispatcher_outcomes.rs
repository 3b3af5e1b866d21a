//! Scenario: the dispatcher completes rows per the failure taxonomy.
//!
//! Success publishes; HTTP 503 schedules a retry with backoff; a
//! non-retryable 4xx and an exhausted retry budget both demote to FAILED.
//!
//! The transport is scripted per event id and answers Ok for anything
//! else, so leftover rows in a shared database drain harmlessly.
//!
//! Skips gracefully when `ACP_DATABASE_URL` is not set.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use acp_db::outbox::{outbox_enqueue, outbox_fetch, NewOutboxEvent};
use acp_outbox::{Dispatcher, DispatcherConfig, EventTransport, TransportError};
use acp_schemas::EventEnvelope;

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

/// Per-event scripts: pops the next failure for the event, succeeds once
/// the script is exhausted. Unknown events always succeed.
struct ScriptedTransport {
    scripts: Mutex<HashMap<Uuid, VecDeque<TransportError>>>,
}

impl ScriptedTransport {
    fn new(scripts: HashMap<Uuid, VecDeque<TransportError>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
        }
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        let mut scripts = self.scripts.lock().expect("script lock");
        match scripts.get_mut(&envelope.id_event).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn make_pool() -> anyhow::Result<Option<sqlx::PgPool>> {
    if std::env::var(acp_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: ACP_DATABASE_URL not set");
        return Ok(None);
    }
    Ok(Some(acp_db::testkit_db_pool().await?))
}

fn config(max_attempts: i32) -> DispatcherConfig {
    DispatcherConfig {
        batch_size: 500,
        interval: Duration::from_millis(50),
        lock_ttl: Duration::from_secs(120),
        max_attempts,
        base_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(60),
        instance_id: "dispatcher-test".to_string(),
    }
}

async fn enqueue_event(pool: &sqlx::PgPool) -> anyhow::Result<Uuid> {
    let ev = NewOutboxEvent {
        event_id: Uuid::new_v4(),
        org_id: Uuid::new_v4(),
        event_type: "access.decision.made".to_string(),
        aggregate_type: "attempt".to_string(),
        aggregate_id: Uuid::new_v4().to_string(),
        payload: "{}".to_string(),
        occurred_at_utc: Utc::now(),
    };
    outbox_enqueue(pool, &ev).await?;
    Ok(ev.event_id)
}

async fn force_due(pool: &sqlx::PgPool, event_id: Uuid) -> anyhow::Result<()> {
    sqlx::query(
        "update outbox_event set next_attempt_at_utc = now() - interval '1 second' where event_id = $1",
    )
    .bind(event_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "claims interfere across parallel tests; run: ACP_DATABASE_URL=... cargo test -p acp-outbox -- --include-ignored --test-threads=1"]
async fn successful_delivery_is_published_exactly_once() -> anyhow::Result<()> {
    let Some(pool) = make_pool().await? else {
        return Ok(());
    };
    let event_id = enqueue_event(&pool).await?;

    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::new(ScriptedTransport::new(HashMap::new())),
        config(8),
    );
    dispatcher.tick().await?;

    let row = outbox_fetch(&pool, event_id).await?.expect("row exists");
    assert_eq!(row.status, "PUBLISHED");
    assert!(row.published_at_utc.is_some());
    assert!(row.locked_by.is_none());

    // A second tick finds nothing to do for this row.
    dispatcher.tick().await?;
    let row = outbox_fetch(&pool, event_id).await?.expect("row exists");
    assert_eq!(row.attempts, 0, "published rows are never re-attempted");
    Ok(())
}

#[tokio::test]
#[ignore = "claims interfere across parallel tests; run: ACP_DATABASE_URL=... cargo test -p acp-outbox -- --include-ignored --test-threads=1"]
async fn http_503_retries_then_succeeds() -> anyhow::Result<()> {
    let Some(pool) = make_pool().await? else {
        return Ok(());
    };
    let event_id = enqueue_event(&pool).await?;

    let scripts = HashMap::from([(
        event_id,
        VecDeque::from([TransportError::http(503, "service unavailable", None)]),
    )]);
    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::new(ScriptedTransport::new(scripts)),
        config(8),
    );

    // First pass: 503 → PENDING with schedule and error metadata.
    dispatcher.tick().await?;
    let row = outbox_fetch(&pool, event_id).await?.expect("row exists");
    assert_eq!(row.status, "PENDING");
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_error_code.as_deref(), Some("HTTP"));
    assert_eq!(row.last_error_http_status, Some(503));
    assert!(row.next_attempt_at_utc.expect("scheduled") > Utc::now());

    // Not due: a tick in between must not touch it.
    dispatcher.tick().await?;
    let row = outbox_fetch(&pool, event_id).await?.expect("row exists");
    assert_eq!(row.attempts, 1);

    // Due again: script exhausted → publish.
    force_due(&pool, event_id).await?;
    dispatcher.tick().await?;
    let row = outbox_fetch(&pool, event_id).await?.expect("row exists");
    assert_eq!(row.status, "PUBLISHED");
    Ok(())
}

#[tokio::test]
#[ignore = "claims interfere across parallel tests; run: ACP_DATABASE_URL=... cargo test -p acp-outbox -- --include-ignored --test-threads=1"]
async fn non_retryable_4xx_fails_immediately() -> anyhow::Result<()> {
    let Some(pool) = make_pool().await? else {
        return Ok(());
    };
    let event_id = enqueue_event(&pool).await?;

    let scripts = HashMap::from([(
        event_id,
        VecDeque::from([TransportError::http(422, "rejected by consumer", None)]),
    )]);
    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::new(ScriptedTransport::new(scripts)),
        config(8),
    );

    dispatcher.tick().await?;
    let row = outbox_fetch(&pool, event_id).await?.expect("row exists");
    assert_eq!(row.status, "FAILED", "4xx must not burn the retry budget");
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_error_http_status, Some(422));
    Ok(())
}

#[tokio::test]
#[ignore = "claims interfere across parallel tests; run: ACP_DATABASE_URL=... cargo test -p acp-outbox -- --include-ignored --test-threads=1"]
async fn retry_budget_exhaustion_demotes_to_failed() -> anyhow::Result<()> {
    let Some(pool) = make_pool().await? else {
        return Ok(());
    };
    let event_id = enqueue_event(&pool).await?;

    // Endless 503s, but only two attempts allowed.
    let scripts = HashMap::from([(
        event_id,
        VecDeque::from(vec![
            TransportError::http(503, "down", None),
            TransportError::http(503, "still down", None),
            TransportError::http(503, "forever down", None),
        ]),
    )]);
    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::new(ScriptedTransport::new(scripts)),
        config(2),
    );

    dispatcher.tick().await?;
    force_due(&pool, event_id).await?;
    dispatcher.tick().await?;

    let row = outbox_fetch(&pool, event_id).await?.expect("row exists");
    assert_eq!(row.status, "FAILED");
    assert_eq!(row.attempts, 2, "cap reached on the second attempt");
    Ok(())
}
