//! Postgres access layer for the access-control core.
//!
//! Every SQL statement in the system lives in this crate. Functions that
//! participate in the request-path transaction take `impl PgExecutor<'_>`
//! so the same query runs against a pool or an open transaction; functions
//! that are standalone take `&PgPool`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Row};
use uuid::Uuid;

use acp_schemas::{CommandState, CommandType, DecisionResult, Direction, SubjectType};

pub const ENV_DB_URL: &str = "ACP_DATABASE_URL";

pub mod audit;
pub mod outbox;
pub mod rules;

pub use audit::audit_insert_deduped;
pub use outbox::{
    outbox_claim_batch, outbox_enqueue, outbox_fetch, outbox_mark_failed, outbox_mark_published,
    outbox_mark_retry, outbox_rehydrate_failed, outbox_release_expired_locks, outbox_stats,
    NewOutboxEvent, OutboxEventRow, OutboxStats,
};
pub use rules::{fetch_candidates, upsert_rule, RuleUpsert};

// ---------------------------------------------------------------------------
// Pool / migrations
// ---------------------------------------------------------------------------

/// Connect to Postgres with a bounded pool.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect using ACP_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Test helper used by integration tests:
/// - Connect using ACP_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='outbox_event'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_outbox_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_outbox_table: bool,
}

/// True when `err` wraps a Postgres unique-constraint violation (23505).
/// The pipeline uses this to recover idempotency-key races as replay hits.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Provisioning (organization / area / device)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub device_id: Uuid,
    pub org_id: Uuid,
    pub area_id: Uuid,
    pub name: String,
}

/// Resolve a device within its tenant. Scoping both the id and the org in
/// the predicate is what guarantees cross-tenant isolation on this path.
pub async fn fetch_device(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    device_id: Uuid,
) -> Result<Option<DeviceRow>> {
    let row = sqlx::query(
        r#"
        select device_id, org_id, area_id, name
        from device
        where device_id = $1 and org_id = $2
        "#,
    )
    .bind(device_id)
    .bind(org_id)
    .fetch_optional(ex)
    .await
    .context("fetch_device failed")?;

    Ok(row.map(|r| DeviceRow {
        device_id: r.get("device_id"),
        org_id: r.get("org_id"),
        area_id: r.get("area_id"),
        name: r.get("name"),
    }))
}

pub async fn insert_organization(ex: impl PgExecutor<'_>, org_id: Uuid, name: &str) -> Result<()> {
    sqlx::query(
        "insert into organization (org_id, name) values ($1, $2) on conflict (org_id) do nothing",
    )
    .bind(org_id)
    .bind(name)
    .execute(ex)
    .await
    .context("insert_organization failed")?;
    Ok(())
}

pub async fn insert_area(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    area_id: Uuid,
    name: &str,
    tz_name: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into area (area_id, org_id, name, tz_name)
        values ($1, $2, $3, $4)
        on conflict (area_id) do nothing
        "#,
    )
    .bind(area_id)
    .bind(org_id)
    .bind(name)
    .bind(tz_name)
    .execute(ex)
    .await
    .context("insert_area failed")?;
    Ok(())
}

pub async fn insert_device(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    area_id: Uuid,
    device_id: Uuid,
    name: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into device (device_id, org_id, area_id, name)
        values ($1, $2, $3, $4)
        on conflict (device_id) do nothing
        "#,
    )
    .bind(device_id)
    .bind(org_id)
    .bind(area_id)
    .bind(name)
    .execute(ex)
    .await
    .context("insert_device failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub attempt_id: Uuid,
    pub org_id: Uuid,
    pub device_id: Uuid,
    pub area_id: Uuid,
    pub direction: Direction,
    pub auth_method: Option<String>,
    pub subject_type: SubjectType,
    pub credential_ref: Option<String>,
    pub raw_payload: Option<Value>,
    pub idempotency_key: String,
    pub gateway_request_id: Option<String>,
    pub occurred_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptRow {
    pub attempt_id: Uuid,
    pub org_id: Uuid,
    pub device_id: Uuid,
    pub area_id: Uuid,
    pub direction: Direction,
    pub auth_method: Option<String>,
    pub subject_type: SubjectType,
    pub idempotency_key: String,
    pub occurred_at_utc: DateTime<Utc>,
    pub created_at_utc: DateTime<Utc>,
}

fn map_attempt(row: &PgRow) -> Result<AttemptRow> {
    let direction: String = row.try_get("direction")?;
    let subject: String = row.try_get("subject_type")?;
    Ok(AttemptRow {
        attempt_id: row.try_get("attempt_id")?,
        org_id: row.try_get("org_id")?,
        device_id: row.try_get("device_id")?,
        area_id: row.try_get("area_id")?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| anyhow!("corrupt attempt direction {direction:?}"))?,
        auth_method: row.try_get("auth_method")?,
        subject_type: SubjectType::parse(&subject)
            .ok_or_else(|| anyhow!("corrupt attempt subject_type {subject:?}"))?,
        idempotency_key: row.try_get("idempotency_key")?,
        occurred_at_utc: row.try_get("occurred_at_utc")?,
        created_at_utc: row.try_get("created_at_utc")?,
    })
}

/// Insert the attempt row. A concurrent duplicate idempotency key surfaces
/// as a unique violation (see [`is_unique_violation`]); the caller decides
/// whether to recover it as a replay hit.
pub async fn insert_attempt(ex: impl PgExecutor<'_>, a: &NewAttempt) -> Result<()> {
    sqlx::query(
        r#"
        insert into access_attempt (
          attempt_id, org_id, device_id, area_id, direction, auth_method,
          subject_type, credential_ref, raw_payload, idempotency_key,
          gateway_request_id, occurred_at_utc
        ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
        "#,
    )
    .bind(a.attempt_id)
    .bind(a.org_id)
    .bind(a.device_id)
    .bind(a.area_id)
    .bind(a.direction.as_str())
    .bind(&a.auth_method)
    .bind(a.subject_type.as_str())
    .bind(&a.credential_ref)
    .bind(&a.raw_payload)
    .bind(&a.idempotency_key)
    .bind(&a.gateway_request_id)
    .bind(a.occurred_at_utc)
    .execute(ex)
    .await
    .context("insert_attempt failed")?;
    Ok(())
}

pub async fn fetch_attempt_by_idempotency_key(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    idempotency_key: &str,
) -> Result<Option<AttemptRow>> {
    let row = sqlx::query(
        r#"
        select attempt_id, org_id, device_id, area_id, direction, auth_method,
               subject_type, idempotency_key, occurred_at_utc, created_at_utc
        from access_attempt
        where org_id = $1 and idempotency_key = $2
        "#,
    )
    .bind(org_id)
    .bind(idempotency_key)
    .fetch_optional(ex)
    .await
    .context("fetch_attempt_by_idempotency_key failed")?;

    row.as_ref().map(map_attempt).transpose()
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub decision_id: Uuid,
    pub org_id: Uuid,
    pub attempt_id: Uuid,
    pub result: DecisionResult,
    pub reason_code: String,
    pub detail: Option<String>,
    pub decided_at_utc: DateTime<Utc>,
    pub expires_at_utc: Option<DateTime<Utc>>,
    pub policy_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DecisionRow {
    pub decision_id: Uuid,
    pub org_id: Uuid,
    pub attempt_id: Uuid,
    pub result: DecisionResult,
    pub reason_code: String,
    pub detail: Option<String>,
    pub decided_at_utc: DateTime<Utc>,
    pub expires_at_utc: Option<DateTime<Utc>>,
    pub policy_version: Option<String>,
}

fn map_decision(row: &PgRow) -> Result<DecisionRow> {
    let result: String = row.try_get("result")?;
    Ok(DecisionRow {
        decision_id: row.try_get("decision_id")?,
        org_id: row.try_get("org_id")?,
        attempt_id: row.try_get("attempt_id")?,
        result: DecisionResult::parse(&result)
            .ok_or_else(|| anyhow!("corrupt decision result {result:?}"))?,
        reason_code: row.try_get("reason_code")?,
        detail: row.try_get("detail")?,
        decided_at_utc: row.try_get("decided_at_utc")?,
        expires_at_utc: row.try_get("expires_at_utc")?,
        policy_version: row.try_get("policy_version")?,
    })
}

pub async fn insert_decision(ex: impl PgExecutor<'_>, d: &NewDecision) -> Result<()> {
    sqlx::query(
        r#"
        insert into access_decision (
          decision_id, org_id, attempt_id, result, reason_code, detail,
          decided_at_utc, expires_at_utc, policy_version
        ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9)
        "#,
    )
    .bind(d.decision_id)
    .bind(d.org_id)
    .bind(d.attempt_id)
    .bind(d.result.as_str())
    .bind(&d.reason_code)
    .bind(&d.detail)
    .bind(d.decided_at_utc)
    .bind(d.expires_at_utc)
    .bind(&d.policy_version)
    .execute(ex)
    .await
    .context("insert_decision failed")?;
    Ok(())
}

pub async fn fetch_decision_by_attempt(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    attempt_id: Uuid,
) -> Result<Option<DecisionRow>> {
    let row = sqlx::query(
        r#"
        select decision_id, org_id, attempt_id, result, reason_code, detail,
               decided_at_utc, expires_at_utc, policy_version
        from access_decision
        where org_id = $1 and attempt_id = $2
        "#,
    )
    .bind(org_id)
    .bind(attempt_id)
    .fetch_optional(ex)
    .await
    .context("fetch_decision_by_attempt failed")?;

    row.as_ref().map(map_decision).transpose()
}

/// True when `code` exists in the reason catalog.
pub async fn reason_code_exists(ex: impl PgExecutor<'_>, code: &str) -> Result<bool> {
    let (exists,): (bool,) =
        sqlx::query_as("select exists (select 1 from reason_catalog where code = $1)")
            .bind(code)
            .fetch_one(ex)
            .await
            .context("reason_code_exists failed")?;
    Ok(exists)
}

/// Codes from `expected` that are absent from the reason catalog.
///
/// The daemon runs this over [`acp_schemas::reason::ALL`] at startup and
/// refuses to boot on a non-empty result: a partially seeded catalog
/// would turn rule matches into foreign-key failures at decision time.
pub async fn missing_reason_codes(
    ex: impl PgExecutor<'_>,
    expected: &[&str],
) -> Result<Vec<String>> {
    let wanted: Vec<String> = expected.iter().map(|c| (*c).to_string()).collect();
    let present: Vec<String> =
        sqlx::query_scalar("select code from reason_catalog where code = any($1)")
            .bind(&wanted)
            .fetch_all(ex)
            .await
            .context("missing_reason_codes failed")?;

    Ok(wanted
        .into_iter()
        .filter(|code| !present.contains(code))
        .collect())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub command_id: Uuid,
    pub org_id: Uuid,
    pub attempt_id: Uuid,
    pub device_id: Uuid,
    pub command_type: CommandType,
    pub message: Option<String>,
    pub idempotency_key: String,
    pub sent_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CommandRow {
    pub command_id: Uuid,
    pub org_id: Uuid,
    pub attempt_id: Uuid,
    pub device_id: Uuid,
    pub command_type: CommandType,
    pub message: Option<String>,
    pub state: CommandState,
    pub sent_at_utc: DateTime<Utc>,
    pub confirmed_at_utc: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub idempotency_key: String,
    pub external_execution_id: Option<String>,
}

fn map_command(row: &PgRow) -> Result<CommandRow> {
    let command_type: String = row.try_get("command_type")?;
    let state: String = row.try_get("state")?;
    Ok(CommandRow {
        command_id: row.try_get("command_id")?,
        org_id: row.try_get("org_id")?,
        attempt_id: row.try_get("attempt_id")?,
        device_id: row.try_get("device_id")?,
        command_type: CommandType::parse(&command_type)
            .ok_or_else(|| anyhow!("corrupt command type {command_type:?}"))?,
        message: row.try_get("message")?,
        state: CommandState::parse(&state)
            .ok_or_else(|| anyhow!("corrupt command state {state:?}"))?,
        sent_at_utc: row.try_get("sent_at_utc")?,
        confirmed_at_utc: row.try_get("confirmed_at_utc")?,
        error_code: row.try_get("error_code")?,
        error_detail: row.try_get("error_detail")?,
        idempotency_key: row.try_get("idempotency_key")?,
        external_execution_id: row.try_get("external_execution_id")?,
    })
}

const COMMAND_COLUMNS: &str = r#"
    command_id, org_id, attempt_id, device_id, command_type, message, state,
    sent_at_utc, confirmed_at_utc, error_code, error_detail, idempotency_key,
    external_execution_id
"#;

/// Insert a command in state SENT. Duplicate `(org, idempotency_key)`
/// surfaces as a unique violation, mirroring the attempt insert.
pub async fn insert_command(ex: impl PgExecutor<'_>, c: &NewCommand) -> Result<()> {
    sqlx::query(
        r#"
        insert into device_command (
          command_id, org_id, attempt_id, device_id, command_type, message,
          state, sent_at_utc, idempotency_key
        ) values ($1,$2,$3,$4,$5,$6,'SENT',$7,$8)
        "#,
    )
    .bind(c.command_id)
    .bind(c.org_id)
    .bind(c.attempt_id)
    .bind(c.device_id)
    .bind(c.command_type.as_str())
    .bind(&c.message)
    .bind(c.sent_at_utc)
    .bind(&c.idempotency_key)
    .execute(ex)
    .await
    .context("insert_command failed")?;
    Ok(())
}

pub async fn fetch_command(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    command_id: Uuid,
) -> Result<Option<CommandRow>> {
    let sql =
        format!("select {COMMAND_COLUMNS} from device_command where org_id = $1 and command_id = $2");
    let row = sqlx::query(&sql)
    .bind(org_id)
    .bind(command_id)
    .fetch_optional(ex)
    .await
    .context("fetch_command failed")?;

    row.as_ref().map(map_command).transpose()
}

/// First command emitted for an attempt (replay reconstruction path).
pub async fn fetch_first_command_for_attempt(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    attempt_id: Uuid,
) -> Result<Option<CommandRow>> {
    let sql = format!(
        r#"
        select {COMMAND_COLUMNS} from device_command
        where org_id = $1 and attempt_id = $2
        order by sent_at_utc asc, command_id asc
        limit 1
        "#
    );
    let row = sqlx::query(&sql)
    .bind(org_id)
    .bind(attempt_id)
    .fetch_optional(ex)
    .await
    .context("fetch_first_command_for_attempt failed")?;

    row.as_ref().map(map_command).transpose()
}

/// Apply a terminal outcome to a command, guarded on the SENT state.
///
/// Returns `true` if this call performed the SENT → terminal transition;
/// `false` if the command had already reached a terminal state (late or
/// duplicate outcome). The predicate makes the guard race-safe: of two
/// concurrent callbacks exactly one sees a row updated.
pub async fn finalize_command(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    command_id: Uuid,
    state: CommandState,
    confirmed_at_utc: DateTime<Utc>,
    error_code: Option<&str>,
    error_detail: Option<&str>,
    external_execution_id: Option<&str>,
) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update device_command
           set state = $3,
               confirmed_at_utc = $4,
               error_code = $5,
               error_detail = $6,
               external_execution_id =
                   coalesce(nullif(trim(external_execution_id), ''), $7)
         where org_id = $1 and command_id = $2 and state = 'SENT'
        returning command_id
        "#,
    )
    .bind(org_id)
    .bind(command_id)
    .bind(state.as_str())
    .bind(confirmed_at_utc)
    .bind(error_code)
    .bind(error_detail)
    .bind(external_execution_id)
    .fetch_optional(ex)
    .await
    .context("finalize_command failed")?;

    Ok(row.is_some())
}
