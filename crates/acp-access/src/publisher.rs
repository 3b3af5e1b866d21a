//! Composite event publisher.
//!
//! Two sinks with different contracts:
//!
//! - **Outbox** ([`EventPublisher::append_tx`]): runs on the caller's
//!   open transaction. Failure propagates and aborts the business
//!   transaction — business state and event state commit or roll back
//!   together.
//! - **In-process** ([`EventPublisher::fan_out`] + audit): best-effort,
//!   called after commit. Failures are logged and swallowed; they must
//!   never unwind into the request path.

use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use acp_db::outbox::{outbox_enqueue, NewOutboxEvent};
use acp_schemas::DomainEvent;

#[derive(Clone)]
pub struct EventPublisher {
    bus: broadcast::Sender<DomainEvent>,
}

impl EventPublisher {
    pub fn new(bus_capacity: usize) -> Self {
        let (bus, _rx) = broadcast::channel(bus_capacity);
        Self { bus }
    }

    /// Subscribe to the in-process fan-out (cache invalidator, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.bus.subscribe()
    }

    /// Append one event to the outbox on the caller's transaction.
    /// Returns the outbox event id.
    pub async fn append_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &DomainEvent,
    ) -> anyhow::Result<Uuid> {
        let event_id = Uuid::new_v4();
        let row = NewOutboxEvent {
            event_id,
            org_id: event.org_id(),
            event_type: event.event_type().to_string(),
            aggregate_type: event.aggregate_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            payload: event.payload_json().to_string(),
            occurred_at_utc: event.occurred_at(),
        };
        outbox_enqueue(&mut **tx, &row).await?;
        Ok(event_id)
    }

    /// Best-effort in-process broadcast. A send error only means there are
    /// no live subscribers, which is fine.
    pub fn fan_out(&self, events: &[DomainEvent]) {
        for event in events {
            if self.bus.send(event.clone()).is_err() {
                debug!(event_type = event.event_type(), "no in-process subscribers");
            }
        }
    }

    /// Best-effort audit sink: one deduplicated row per event. Failures
    /// are logged, never propagated.
    pub async fn audit(&self, pool: &PgPool, events: &[DomainEvent]) {
        for event in events {
            let res = acp_db::audit_insert_deduped(
                pool,
                event.org_id(),
                &event.audit_key(),
                event.event_type(),
                event.aggregate_type(),
                &event.aggregate_id().to_string(),
                event.payload_json(),
                event.occurred_at(),
            )
            .await;
            if let Err(err) = res {
                warn!(
                    event_type = event.event_type(),
                    error = %err,
                    "audit sink write failed"
                );
            }
        }
    }
}
