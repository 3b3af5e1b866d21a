//! Request/response DTOs. All JSON bodies are camelCase on the wire.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use acp_access::AttemptResult;
use acp_schemas::{
    CommandState, CommandType, DecisionResult, Direction, RuleAction, RuleState, SubjectType,
};

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAttemptRequest {
    pub device_id: Uuid,
    pub area_id: Uuid,
    pub direction: Direction,
    pub auth_method: Option<String>,
    pub credential_ref: Option<String>,
    pub raw_payload: Value,
    pub idempotency_key: String,
    pub gateway_request_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptResultResponse {
    pub attempt_id: Uuid,
    pub decision_result: DecisionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_type: Option<CommandType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_state: Option<CommandState>,
}

impl From<AttemptResult> for AttemptResultResponse {
    fn from(r: AttemptResult) -> Self {
        Self {
            attempt_id: r.attempt_id,
            decision_result: r.decision_result,
            decision_id: r.decision_id,
            command_id: r.command_id,
            command_type: r.command_type,
            command_state: r.command_state,
        }
    }
}

// ---------------------------------------------------------------------------
// Command outcome callback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRequest {
    pub state: CommandState,
    pub error_code: Option<String>,
    pub detail: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub external_execution_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Rules (policy-change entry point)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpsertRequest {
    pub area_id: Uuid,
    pub device_id: Option<Uuid>,
    pub subject_type: SubjectType,
    pub direction: Option<Direction>,
    pub auth_method: Option<String>,
    pub action: RuleAction,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_rule_state")]
    pub state: RuleState,
    pub message: Option<String>,
    pub valid_from_utc: Option<DateTime<Utc>>,
    pub valid_to_utc: Option<DateTime<Utc>>,
    pub daily_from_local: Option<NaiveTime>,
    pub daily_to_local: Option<NaiveTime>,
}

fn default_priority() -> i32 {
    100
}

fn default_rule_state() -> RuleState {
    RuleState::Active
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpsertResponse {
    pub rule_id: Uuid,
    pub change_type: acp_schemas::PolicyChangeType,
}

// ---------------------------------------------------------------------------
// DLQ ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqIngressRequest {
    pub source: Option<String>,
    pub original_payload: String,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Health / status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStatsBody {
    pub pending: i64,
    pub ready: i64,
    pub inflight: i64,
    pub failed: i64,
    pub oldest_pending_age_secs: Option<i64>,
    pub oldest_ready_age_secs: Option<i64>,
    pub oldest_inflight_age_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub instance_id: String,
    pub uptime_secs: u64,
    pub cached_candidate_sets: usize,
    /// Absent when the stats query fails (daemon still reports liveness).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox: Option<OutboxStatsBody>,
}

// ---------------------------------------------------------------------------
// Error body
// ---------------------------------------------------------------------------

/// Structured error reply: `{code, message, status, path, timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub path: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
