//! Command-outcome callback.
//!
//! Devices report execution results asynchronously and retry freely; the
//! final-state guard makes the whole operation idempotent. The guard is
//! enforced twice: a read in the service for logging, and the
//! `state = 'SENT'` predicate on the update for race safety — of two
//! concurrent callbacks exactly one performs the transition.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use acp_db::{fetch_command, finalize_command};
use acp_schemas::{
    events::CommandExecuted, limits, normalize, truncate_chars, CommandState, DomainEvent,
};

use crate::{CoreError, EventPublisher};

/// Device-reported execution outcome.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub state: CommandState,
    pub error_code: Option<String>,
    pub detail: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub external_execution_id: Option<String>,
}

/// What the callback did, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// This call performed the SENT → terminal transition.
    Applied,
    /// Command already carried the same terminal state; no-op.
    AlreadyFinal,
    /// Command already carried a different terminal state; absorbed.
    LateOutcome,
}

pub struct CallbackService {
    pool: PgPool,
    publisher: EventPublisher,
}

impl CallbackService {
    pub fn new(pool: PgPool, publisher: EventPublisher) -> Self {
        Self { pool, publisher }
    }

    /// Apply a device outcome to a command.
    pub async fn apply_outcome(
        &self,
        org_id: Uuid,
        command_id: Uuid,
        outcome: CommandOutcome,
    ) -> Result<CallbackOutcome, CoreError> {
        if !outcome.state.is_terminal() {
            return Err(CoreError::Validation(format!(
                "outcome state must be terminal, got {}",
                outcome.state.as_str()
            )));
        }
        let error_code = normalize(outcome.error_code.as_deref())
            .map(|c| truncate_chars(&c, limits::ERROR_CODE).to_string());
        let detail = normalize(outcome.detail.as_deref())
            .map(|d| truncate_chars(&d, limits::ERROR_DETAIL).to_string());
        if outcome.state == CommandState::ExecutedError && error_code.is_none() && detail.is_none()
        {
            return Err(CoreError::Validation(
                "EXECUTED_ERROR requires an error code or detail".to_string(),
            ));
        }
        let external_id = normalize(outcome.external_execution_id.as_deref())
            .map(|x| truncate_chars(&x, limits::EXTERNAL_EXECUTION_ID).to_string());

        let command = fetch_command(&self.pool, org_id, command_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("command {command_id} in org {org_id}"))
            })?;

        // Final-state guard: terminal commands absorb retries and late
        // outcomes without a second transition or a second event.
        if command.state.is_terminal() {
            return if command.state == outcome.state {
                debug!(%org_id, %command_id, state = command.state.as_str(),
                       "duplicate outcome; already final");
                Ok(CallbackOutcome::AlreadyFinal)
            } else {
                warn!(%org_id, %command_id,
                      current = command.state.as_str(),
                      incoming = outcome.state.as_str(),
                      "late outcome after terminal state; ignored");
                Ok(CallbackOutcome::LateOutcome)
            };
        }

        let confirmed_at = outcome.occurred_at.unwrap_or_else(Utc::now);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::Unavailable(format!("begin transaction: {e}")))?;

        let transitioned = finalize_command(
            &mut *tx,
            org_id,
            command_id,
            outcome.state,
            confirmed_at,
            error_code.as_deref(),
            detail.as_deref(),
            external_id.as_deref(),
        )
        .await?;

        if !transitioned {
            // Lost the race between our read and our update.
            let _ = tx.rollback().await;
            warn!(%org_id, %command_id, incoming = outcome.state.as_str(),
                  "concurrent callback won the transition; ignored");
            return Ok(CallbackOutcome::LateOutcome);
        }

        let event = DomainEvent::CommandExecuted(CommandExecuted {
            event_id: Uuid::new_v4(),
            org_id,
            command_id,
            attempt_id: command.attempt_id,
            device_id: command.device_id,
            final_state: outcome.state,
            at: confirmed_at,
            error_code,
            detail,
            external_id,
        });
        self.publisher.append_tx(&mut tx, &event).await?;

        tx.commit()
            .await
            .map_err(|e| CoreError::Unavailable(format!("commit failed: {e}")))?;

        let events = [event];
        self.publisher.fan_out(&events);
        self.publisher.audit(&self.pool, &events).await;

        metrics::counter!("command_outcomes_total", "state" => outcome.state.as_str())
            .increment(1);
        info!(%org_id, %command_id, state = outcome.state.as_str(), "command finalized");

        Ok(CallbackOutcome::Applied)
    }
}
