//! Append-only audit sink backed by the `audit_log` table.
//!
//! Writes are deduplicated per tenant on a stable event key so at-least-
//! once delivery into the sink leaves exactly one row.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

/// Insert one audit row; duplicate `(org_id, event_key)` is a no-op.
/// Returns `true` when a row was written.
#[allow(clippy::too_many_arguments)]
pub async fn audit_insert_deduped(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    event_key: &str,
    event_type: &str,
    aggregate_type: &str,
    aggregate_id: &str,
    payload: Value,
    occurred_at_utc: DateTime<Utc>,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into audit_log (
          org_id, event_key, event_type, aggregate_type, aggregate_id,
          payload, occurred_at_utc
        ) values ($1,$2,$3,$4,$5,$6,$7)
        on conflict (org_id, event_key) do nothing
        returning audit_id
        "#,
    )
    .bind(org_id)
    .bind(event_key)
    .bind(event_type)
    .bind(aggregate_type)
    .bind(aggregate_id)
    .bind(payload)
    .bind(occurred_at_utc)
    .fetch_optional(ex)
    .await
    .context("audit_insert_deduped failed")?;

    Ok(row.is_some())
}
