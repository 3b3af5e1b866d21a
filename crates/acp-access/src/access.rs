//! Access pipeline: idempotent attempt registration.
//!
//! One call, one database transaction. The candidate snapshot is read
//! before the transaction opens; the engine is pure; everything that
//! mutates state (attempt, decision, command, outbox rows) commits
//! atomically. Replays of the same `(org, idempotency_key)` reconstruct
//! the original result and write nothing.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use acp_db::{
    fetch_attempt_by_idempotency_key, fetch_decision_by_attempt, fetch_device,
    fetch_first_command_for_attempt, insert_attempt, insert_command, insert_decision,
    is_unique_violation, reason_code_exists, AttemptRow, NewAttempt, NewCommand, NewDecision,
};
use acp_engine::{evaluate, DecisionContext, DecisionOutput, TenantZoneProvider};
use acp_schemas::{
    events::{AttemptRegistered, CommandEmitted, DecisionMade},
    limits, normalize, reason, truncate_chars, CommandState, CommandType, DecisionResult,
    Direction, DomainEvent, SubjectType,
};

use crate::{CandidateProvider, CoreError, EventPublisher};

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// Validated gateway request for one access attempt.
#[derive(Debug, Clone)]
pub struct RegisterAttempt {
    pub device_id: Uuid,
    pub area_id: Uuid,
    pub direction: Direction,
    pub auth_method: Option<String>,
    pub credential_ref: Option<String>,
    pub raw_payload: Option<Value>,
    pub idempotency_key: String,
    pub gateway_request_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

/// What the gateway gets back, for first-time and replayed requests alike.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResult {
    pub attempt_id: Uuid,
    pub decision_result: DecisionResult,
    pub decision_id: Option<Uuid>,
    pub command_id: Option<Uuid>,
    pub command_type: Option<CommandType>,
    pub command_state: Option<CommandState>,
}

/// Derive the command idempotency key from the attempt key.
pub fn command_idempotency_key(attempt_key: &str, command_type: CommandType) -> String {
    format!("CMD:{attempt_key}:{}", command_type.as_str())
}

// ---------------------------------------------------------------------------
// AccessService
// ---------------------------------------------------------------------------

pub struct AccessService {
    pool: PgPool,
    candidates: CandidateProvider,
    zones: Arc<dyn TenantZoneProvider>,
    publisher: EventPublisher,
}

impl AccessService {
    pub fn new(
        pool: PgPool,
        candidates: CandidateProvider,
        zones: Arc<dyn TenantZoneProvider>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            pool,
            candidates,
            zones,
            publisher,
        }
    }

    /// Register an access attempt and return the decision outcome.
    pub async fn register(
        &self,
        org_id: Uuid,
        req: RegisterAttempt,
    ) -> Result<AttemptResult, CoreError> {
        let started = Instant::now();

        let idempotency_key = normalize(Some(req.idempotency_key.as_str())).ok_or_else(|| {
            CoreError::Validation("idempotency key must not be blank".to_string())
        })?;

        // 1. Idempotency short-circuit: replay reconstructs, writes nothing.
        if let Some(attempt) =
            fetch_attempt_by_idempotency_key(&self.pool, org_id, &idempotency_key).await?
        {
            return self.replay_hit(org_id, attempt).await;
        }

        // 2. Device scoping — the (id, org) predicate is the tenant wall.
        let device = fetch_device(&self.pool, org_id, req.device_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("device {} in org {org_id}", req.device_id))
            })?;

        // 3. Candidate snapshot, read outside the business transaction.
        let subject = SubjectType::Unknown;
        let candidates = self
            .candidates
            .candidates(org_id, req.area_id, subject)
            .await?;

        let now = Utc::now();
        let occurred_at = req.occurred_at.unwrap_or(now);
        let attempt_id = Uuid::new_v4();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::Unavailable(format!("begin transaction: {e}")))?;

        // 4. Attempt persistence. A concurrent duplicate key aborts the
        // transaction; recover it as a replay hit.
        let new_attempt = NewAttempt {
            attempt_id,
            org_id,
            device_id: device.device_id,
            area_id: req.area_id,
            direction: req.direction,
            auth_method: normalize(req.auth_method.as_deref()),
            subject_type: subject,
            credential_ref: normalize(req.credential_ref.as_deref()),
            raw_payload: req.raw_payload.clone(),
            idempotency_key: idempotency_key.clone(),
            gateway_request_id: normalize(req.gateway_request_id.as_deref()),
            occurred_at_utc: occurred_at,
        };
        if let Err(err) = insert_attempt(&mut *tx, &new_attempt).await {
            if is_unique_violation(&err) {
                let _ = tx.rollback().await;
                warn!(%org_id, key = %idempotency_key, "idempotency race lost; replaying winner");
                return match fetch_attempt_by_idempotency_key(&self.pool, org_id, &idempotency_key)
                    .await?
                {
                    Some(attempt) => self.replay_hit(org_id, attempt).await,
                    None => Err(CoreError::Conflict(format!(
                        "duplicate idempotency key {idempotency_key}"
                    ))),
                };
            }
            return Err(err.into());
        }

        // 5. Decision evaluation: pure, cache-fed, no I/O.
        let ctx = DecisionContext {
            org_id,
            attempt_id,
            device_id: device.device_id,
            area_id: req.area_id,
            direction: req.direction,
            auth_method: new_attempt.auth_method.clone(),
            subject,
        };
        let engine_started = Instant::now();
        let output = evaluate(&ctx, &candidates, now, self.zones.as_ref());
        metrics::histogram!("engine_evaluate_seconds")
            .record(engine_started.elapsed().as_secs_f64());

        // 6. Decision persistence with catalog-resolved reason.
        let reason_code = resolve_reason(&mut tx, &output.reason_code).await?;
        let decision_id = Uuid::new_v4();
        insert_decision(
            &mut *tx,
            &NewDecision {
                decision_id,
                org_id,
                attempt_id,
                result: output.result,
                reason_code: reason_code.clone(),
                detail: output
                    .detail
                    .as_deref()
                    .map(|d| truncate_chars(d, limits::DECISION_DETAIL).to_string()),
                decided_at_utc: output.decided_at,
                expires_at_utc: output.expires_at,
                policy_version: Some(output.policy_version.to_string()),
            },
        )
        .await?;

        // 7. Command emission: at most one, keyed off the attempt key.
        let command = match output.command_hint {
            Some(command_type) => {
                let command_id = Uuid::new_v4();
                let message = output
                    .message
                    .as_deref()
                    .map(|m| truncate_chars(m, limits::COMMAND_MESSAGE).to_string());
                if let Err(err) = insert_command(
                    &mut *tx,
                    &NewCommand {
                        command_id,
                        org_id,
                        attempt_id,
                        device_id: device.device_id,
                        command_type,
                        message: message.clone(),
                        idempotency_key: command_idempotency_key(&idempotency_key, command_type),
                        sent_at_utc: now,
                    },
                )
                .await
                {
                    // A decision with a command hint that cannot be
                    // persisted is a visible consistency gap.
                    metrics::counter!("command_emit_gap_total").increment(1);
                    return Err(err.into());
                }
                Some((command_id, command_type, message))
            }
            None => None,
        };

        // 8. Events, in issue order, on the same transaction.
        let mut events = vec![
            DomainEvent::AttemptRegistered(AttemptRegistered {
                attempt_id,
                org_id,
                device_id: device.device_id,
                area_id: req.area_id,
                direction: req.direction,
                auth_method: ctx.auth_method.clone(),
                subject_type: subject,
                occurred_at,
            }),
            DomainEvent::DecisionMade(DecisionMade {
                decision_id,
                attempt_id,
                org_id,
                result: output.result,
                reason_code: reason_code.clone(),
                detail: output.detail.clone(),
                decided_at: output.decided_at,
                expires_at: output.expires_at,
                policy_version: Some(output.policy_version.to_string()),
            }),
        ];
        if let Some((command_id, command_type, ref message)) = command {
            events.push(DomainEvent::CommandEmitted(CommandEmitted {
                command_id,
                attempt_id,
                org_id,
                device_id: device.device_id,
                command_type,
                message: message.clone(),
                sent_at: now,
            }));
        }
        for event in &events {
            self.publisher.append_tx(&mut tx, event).await?;
        }

        tx.commit()
            .await
            .map_err(|e| CoreError::Unavailable(format!("commit failed: {e}")))?;

        // Post-commit: best-effort sinks, then metrics.
        self.publisher.fan_out(&events);
        self.publisher.audit(&self.pool, &events).await;

        metrics::counter!("attempts_total", "result" => output.result.metric_tag()).increment(1);
        metrics::histogram!("attempt_register_seconds").record(started.elapsed().as_secs_f64());
        info!(
            %org_id,
            %attempt_id,
            result = output.result.as_str(),
            reason = %reason_code,
            "attempt registered"
        );

        Ok(build_result(attempt_id, output, decision_id, command))
    }

    /// Reconstruct the original result for a replayed idempotency key.
    async fn replay_hit(
        &self,
        org_id: Uuid,
        attempt: AttemptRow,
    ) -> Result<AttemptResult, CoreError> {
        let decision =
            fetch_decision_by_attempt(&self.pool, org_id, attempt.attempt_id).await?;
        let command =
            fetch_first_command_for_attempt(&self.pool, org_id, attempt.attempt_id).await?;

        metrics::counter!("attempts_total", "result" => "idempotent_hit").increment(1);
        info!(%org_id, attempt_id = %attempt.attempt_id, "idempotent replay");

        Ok(AttemptResult {
            attempt_id: attempt.attempt_id,
            // An attempt without a decision row cannot be produced by this
            // pipeline; report ERROR defensively rather than failing the
            // replay.
            decision_result: decision
                .as_ref()
                .map(|d| d.result)
                .unwrap_or(DecisionResult::Error),
            decision_id: decision.map(|d| d.decision_id),
            command_id: command.as_ref().map(|c| c.command_id),
            command_type: command.as_ref().map(|c| c.command_type),
            command_state: command.as_ref().map(|c| c.state),
        })
    }
}

fn build_result(
    attempt_id: Uuid,
    output: DecisionOutput,
    decision_id: Uuid,
    command: Option<(Uuid, CommandType, Option<String>)>,
) -> AttemptResult {
    AttemptResult {
        attempt_id,
        decision_result: output.result,
        decision_id: Some(decision_id),
        command_id: command.as_ref().map(|(id, _, _)| *id),
        command_type: command.as_ref().map(|(_, t, _)| *t),
        command_state: command.as_ref().map(|_| CommandState::Sent),
    }
}

/// Resolve a reason code through the catalog.
///
/// Unknown codes fall back to POLICY_ERROR (metered). A catalog without
/// POLICY_ERROR is unusable — that is a fatal configuration error, not a
/// decision outcome.
async fn resolve_reason(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    code: &str,
) -> Result<String, CoreError> {
    if reason_code_exists(&mut **tx, code).await? {
        return Ok(code.to_string());
    }

    metrics::counter!("reason_fallback_total").increment(1);
    warn!(code, "reason code missing from catalog; using POLICY_ERROR");

    if reason_code_exists(&mut **tx, reason::POLICY_ERROR).await? {
        Ok(reason::POLICY_ERROR.to_string())
    } else {
        Err(CoreError::FatalConfig(
            "reason catalog is missing POLICY_ERROR".to_string(),
        ))
    }
}
