//! Terminal diagnostic sinks: DLQ and parking lot.
//!
//! Both handlers receive messages the *external* transport failed to
//! process and hands back. They record diagnostics and always
//! acknowledge — nothing is ever recirculated from here. A message that
//! cannot even be parsed still gets logged and acked; the payload is
//! preserved verbatim in the wrapper for the operator.

use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, warn};

use acp_schemas::{limits, truncate_chars, DlqMessage, EventEnvelope};

// ---------------------------------------------------------------------------
// DLQ
// ---------------------------------------------------------------------------

pub struct DlqHandler {
    pool: PgPool,
}

impl DlqHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Wrap a failed message with diagnostics and record it.
    ///
    /// Never fails: the returned wrapper is the acknowledgement. The
    /// original envelope is recovered when the payload parses, which
    /// gives the operator tenant and aggregate correlation.
    pub async fn handle(
        &self,
        source: &str,
        original_payload: &str,
        error_type: &str,
        error_message: &str,
    ) -> DlqMessage {
        let original_envelope: Option<EventEnvelope> =
            serde_json::from_str(original_payload).ok();

        let wrapped = DlqMessage {
            source: source.to_string(),
            original_payload: original_payload.to_string(),
            original_envelope: original_envelope.clone(),
            dlq_message: None,
            error_type: error_type.to_string(),
            error_message: truncate_chars(error_message, limits::DLQ_ERROR_MESSAGE).to_string(),
            failed_at_utc: Utc::now(),
        };

        metrics::counter!("dlq_received_total").increment(1);
        warn!(
            source,
            error_type,
            event_id = ?original_envelope.as_ref().map(|e| e.id_event),
            event_type = ?original_envelope.as_ref().map(|e| e.event_type.clone()),
            "message arrived on DLQ"
        );

        // Best-effort audit trail, only when the envelope gives us a
        // tenant to file it under.
        if let Some(envelope) = &original_envelope {
            let key = format!(
                "{}|dlq|{}|{}",
                envelope.org_id,
                envelope.id_event,
                wrapped.failed_at_utc.timestamp_micros()
            );
            let payload = serde_json::to_value(&wrapped).unwrap_or(serde_json::Value::Null);
            if let Err(err) = acp_db::audit_insert_deduped(
                &self.pool,
                envelope.org_id,
                &key,
                "outbox.delivery.dead_lettered",
                &envelope.aggregate_type,
                &envelope.aggregate_id,
                payload,
                wrapped.failed_at_utc,
            )
            .await
            {
                warn!(error = %err, "DLQ audit write failed");
            }
        }

        wrapped
    }
}

// ---------------------------------------------------------------------------
// Parking lot
// ---------------------------------------------------------------------------

/// End of the line: messages that failed even DLQ processing.
pub struct ParkingLotHandler;

impl ParkingLotHandler {
    /// Log whatever diagnostics survive; always acknowledge.
    pub fn handle(&self, raw: &str) {
        metrics::counter!("parking_lot_received_total").increment(1);

        match serde_json::from_str::<DlqMessage>(raw) {
            Ok(dlq) => {
                error!(
                    source = %dlq.source,
                    error_type = %dlq.error_type,
                    error_message = %dlq.error_message,
                    failed_at = %dlq.failed_at_utc,
                    event_id = ?dlq.original_envelope.as_ref().map(|e| e.id_event),
                    "message parked; manual intervention required"
                );
            }
            Err(_) => {
                error!(
                    payload = truncate_chars(raw, limits::DLQ_ERROR_MESSAGE),
                    "unparseable message parked; manual intervention required"
                );
            }
        }
    }
}
