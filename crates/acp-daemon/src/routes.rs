//! Axum router and all HTTP handlers for acp-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers are `pub(crate)` so the scenario
//! tests in `tests/` can compose the router directly.
//!
//! Bodies are parsed from `Json<Value>` by hand so every validation
//! failure produces the structured 400 error body instead of a framework
//! rejection.

use std::sync::Arc;

use axum::{
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use acp_access::{apply_policy_envelope, CommandOutcome, CoreError, RegisterAttempt};
use acp_db::outbox::outbox_stats;
use acp_db::rules::RuleUpsert;
use acp_schemas::EventEnvelope;
use acp_outbox::ParkingLotHandler;

use crate::api_types::{
    AttemptResultResponse, DlqIngressRequest, ErrorBody, HealthResponse, OutboxStatsBody,
    OutcomeRequest, RegisterAttemptRequest, RuleUpsertRequest, RuleUpsertResponse, StatusResponse,
};
use crate::state::{uptime_secs, AppState};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/organizations/:org_id/attempts", post(register_attempt))
        .route(
            "/v1/organizations/:org_id/commands/:command_id/outcome",
            post(command_outcome),
        )
        .route("/v1/organizations/:org_id/rules/:rule_id", put(upsert_rule))
        .route(
            "/v1/organizations/:org_id/rules/invalidate-all",
            post(invalidate_all),
        )
        .route("/v1/events/policy", post(policy_event))
        .route("/v1/dlq", post(dlq_ingress))
        .route("/v1/parking-lot", post(parking_lot))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(err: &CoreError, path: &str) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        code: err.code().to_string(),
        message: err.to_string(),
        status: err.http_status(),
        path: path.to_string(),
        timestamp: Utc::now(),
        details: None,
    };
    (status, Json(body)).into_response()
}

fn parse_body<T: DeserializeOwned>(value: Value) -> Result<T, CoreError> {
    serde_json::from_value(value).map_err(|e| CoreError::Validation(e.to_string()))
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    // Outbox stats are best-effort: a failing stats query must not take
    // the liveness surface down with it.
    let outbox = outbox_stats(&st.pool, st.cfg.lock_ttl)
        .await
        .ok()
        .map(|s| OutboxStatsBody {
            pending: s.pending,
            ready: s.ready,
            inflight: s.inflight,
            failed: s.failed,
            oldest_pending_age_secs: s.oldest_pending_age_secs,
            oldest_ready_age_secs: s.oldest_ready_age_secs,
            oldest_inflight_age_secs: s.oldest_inflight_age_secs,
        });

    (
        StatusCode::OK,
        Json(StatusResponse {
            service: st.build.service,
            version: st.build.version,
            instance_id: st.cfg.instance_id.clone(),
            uptime_secs: uptime_secs(),
            cached_candidate_sets: st.cache.len().await,
            outbox,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/organizations/{org}/attempts
// ---------------------------------------------------------------------------

pub(crate) async fn register_attempt(
    State(st): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    let req: RegisterAttemptRequest = match parse_body(body) {
        Ok(req) => req,
        Err(err) => return error_response(&err, uri.path()),
    };

    let register = RegisterAttempt {
        device_id: req.device_id,
        area_id: req.area_id,
        direction: req.direction,
        auth_method: req.auth_method,
        credential_ref: req.credential_ref,
        raw_payload: Some(req.raw_payload),
        idempotency_key: req.idempotency_key,
        gateway_request_id: req.gateway_request_id,
        occurred_at: req.occurred_at,
    };

    match st.access.register(org_id, register).await {
        Ok(result) => (
            StatusCode::OK,
            Json(AttemptResultResponse::from(result)),
        )
            .into_response(),
        Err(err) => error_response(&err, uri.path()),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/organizations/{org}/commands/{id}/outcome
// ---------------------------------------------------------------------------

pub(crate) async fn command_outcome(
    State(st): State<Arc<AppState>>,
    Path((org_id, command_id)): Path<(Uuid, Uuid)>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(request_id) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        debug!(request_id, %command_id, "outcome callback correlation id");
    }

    let req: OutcomeRequest = match parse_body(body) {
        Ok(req) => req,
        Err(err) => return error_response(&err, uri.path()),
    };

    let outcome = CommandOutcome {
        state: req.state,
        error_code: req.error_code,
        detail: req.detail,
        occurred_at: req.occurred_at,
        external_execution_id: req.external_execution_id,
    };

    match st.callback.apply_outcome(org_id, command_id, outcome).await {
        // Success and idempotent no-ops alike: 204.
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err, uri.path()),
    }
}

// ---------------------------------------------------------------------------
// PUT /v1/organizations/{org}/rules/{id}
// ---------------------------------------------------------------------------

pub(crate) async fn upsert_rule(
    State(st): State<Arc<AppState>>,
    Path((org_id, rule_id)): Path<(Uuid, Uuid)>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    let req: RuleUpsertRequest = match parse_body(body) {
        Ok(req) => req,
        Err(err) => return error_response(&err, uri.path()),
    };

    let upsert = RuleUpsert {
        rule_id,
        org_id,
        area_id: req.area_id,
        device_id: req.device_id,
        subject_type: req.subject_type,
        direction: req.direction,
        auth_method: req.auth_method,
        action: req.action,
        priority: req.priority,
        state: req.state,
        message: req.message,
        valid_from_utc: req.valid_from_utc,
        valid_to_utc: req.valid_to_utc,
        daily_from_local: req.daily_from_local,
        daily_to_local: req.daily_to_local,
    };

    match st.policy.upsert_rule(upsert).await {
        Ok(change_type) => (
            StatusCode::OK,
            Json(RuleUpsertResponse {
                rule_id,
                change_type,
            }),
        )
            .into_response(),
        Err(err) => error_response(&err, uri.path()),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/organizations/{org}/rules/invalidate-all
// ---------------------------------------------------------------------------

pub(crate) async fn invalidate_all(
    State(st): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    match st.policy.invalidate_all(org_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(&err, uri.path()),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/events/policy — cluster invalidation delivery
// ---------------------------------------------------------------------------

pub(crate) async fn policy_event(
    State(st): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    let envelope: EventEnvelope = match parse_body(body) {
        Ok(env) => env,
        Err(err) => return error_response(&err, uri.path()),
    };

    match apply_policy_envelope(&st.cache, &envelope).await {
        Ok(applied) => {
            debug!(
                event_type = %envelope.event_type,
                applied,
                "policy envelope received"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => error_response(&err, uri.path()),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/dlq — terminal diagnostic sink
// ---------------------------------------------------------------------------

/// Always acknowledges (204): a DLQ sink that rejects its input would
/// just create a second DLQ. Unparseable bodies are wrapped verbatim.
pub(crate) async fn dlq_ingress(State(st): State<Arc<AppState>>, body: String) -> StatusCode {
    let req = serde_json::from_str::<DlqIngressRequest>(&body).unwrap_or(DlqIngressRequest {
        source: None,
        original_payload: body,
        error_type: None,
        error_message: None,
    });

    st.dlq
        .handle(
            req.source.as_deref().unwrap_or("external-transport"),
            &req.original_payload,
            req.error_type.as_deref().unwrap_or("Unknown"),
            req.error_message.as_deref().unwrap_or(""),
        )
        .await;

    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// POST /v1/parking-lot — end of the line
// ---------------------------------------------------------------------------

pub(crate) async fn parking_lot(body: String) -> StatusCode {
    ParkingLotHandler.handle(&body);
    StatusCode::NO_CONTENT
}
