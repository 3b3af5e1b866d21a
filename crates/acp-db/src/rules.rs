//! Access-rule storage: the candidate query the engine's cache is filled
//! from, plus the minimal write path the policy-change publisher needs.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use acp_schemas::{Direction, Rule, RuleAction, RuleState, SubjectType};

#[derive(Debug, Clone)]
pub struct RuleUpsert {
    pub rule_id: Uuid,
    pub org_id: Uuid,
    pub area_id: Uuid,
    pub device_id: Option<Uuid>,
    pub subject_type: SubjectType,
    pub direction: Option<Direction>,
    pub auth_method: Option<String>,
    pub action: RuleAction,
    pub priority: i32,
    pub state: RuleState,
    pub message: Option<String>,
    pub valid_from_utc: Option<DateTime<Utc>>,
    pub valid_to_utc: Option<DateTime<Utc>>,
    pub daily_from_local: Option<NaiveTime>,
    pub daily_to_local: Option<NaiveTime>,
}

fn map_rule(row: &PgRow) -> Result<Rule> {
    let subject: String = row.try_get("subject_type")?;
    let action: String = row.try_get("action")?;
    let state: String = row.try_get("state")?;
    let direction: Option<String> = row.try_get("direction")?;

    Ok(Rule {
        rule_id: row.try_get("rule_id")?,
        org_id: row.try_get("org_id")?,
        area_id: row.try_get("area_id")?,
        device_id: row.try_get("device_id")?,
        subject_type: SubjectType::parse(&subject)
            .ok_or_else(|| anyhow!("corrupt rule subject_type {subject:?}"))?,
        direction: direction
            .map(|d| Direction::parse(&d).ok_or_else(|| anyhow!("corrupt rule direction {d:?}")))
            .transpose()?,
        auth_method: row.try_get("auth_method")?,
        action: RuleAction::parse(&action)
            .ok_or_else(|| anyhow!("corrupt rule action {action:?}"))?,
        priority: row.try_get("priority")?,
        state: RuleState::parse(&state).ok_or_else(|| anyhow!("corrupt rule state {state:?}"))?,
        message: row.try_get("message")?,
        valid_from_utc: row.try_get("valid_from_utc")?,
        valid_to_utc: row.try_get("valid_to_utc")?,
        daily_from_local: row.try_get("daily_from_local")?,
        daily_to_local: row.try_get("daily_to_local")?,
        created_at_utc: row.try_get("created_at_utc")?,
        updated_at_utc: row.try_get("updated_at_utc")?,
    })
}

/// Time-agnostic candidate set for `(org, area, subject)`: every ACTIVE
/// rule, regardless of validity or daily windows. The engine applies all
/// time-dependent matching at evaluation time.
pub async fn fetch_candidates(
    ex: impl PgExecutor<'_>,
    org_id: Uuid,
    area_id: Uuid,
    subject_type: SubjectType,
) -> Result<Vec<Rule>> {
    let rows = sqlx::query(
        r#"
        select rule_id, org_id, area_id, device_id, subject_type, direction,
               auth_method, action, priority, state, message, valid_from_utc,
               valid_to_utc, daily_from_local, daily_to_local, created_at_utc,
               updated_at_utc
        from access_rule
        where org_id = $1 and area_id = $2 and subject_type = $3
          and state = 'ACTIVE'
        "#,
    )
    .bind(org_id)
    .bind(area_id)
    .bind(subject_type.as_str())
    .fetch_all(ex)
    .await
    .context("fetch_candidates failed")?;

    rows.iter().map(map_rule).collect()
}

/// Insert or update a rule. On update, `updated_at_utc` is stamped so the
/// engine's newer-wins tie-break observes the write.
///
/// Returns `true` when the row was newly created.
pub async fn upsert_rule(ex: impl PgExecutor<'_>, r: &RuleUpsert) -> Result<bool> {
    let (inserted,): (bool,) = sqlx::query_as(
        r#"
        insert into access_rule (
          rule_id, org_id, area_id, device_id, subject_type, direction,
          auth_method, action, priority, state, message, valid_from_utc,
          valid_to_utc, daily_from_local, daily_to_local
        ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
        on conflict (rule_id) do update set
          device_id = excluded.device_id,
          subject_type = excluded.subject_type,
          direction = excluded.direction,
          auth_method = excluded.auth_method,
          action = excluded.action,
          priority = excluded.priority,
          state = excluded.state,
          message = excluded.message,
          valid_from_utc = excluded.valid_from_utc,
          valid_to_utc = excluded.valid_to_utc,
          daily_from_local = excluded.daily_from_local,
          daily_to_local = excluded.daily_to_local,
          updated_at_utc = now()
        where access_rule.org_id = excluded.org_id
        returning (xmax = 0) as inserted
        "#,
    )
    .bind(r.rule_id)
    .bind(r.org_id)
    .bind(r.area_id)
    .bind(r.device_id)
    .bind(r.subject_type.as_str())
    .bind(r.direction.map(|d| d.as_str()))
    .bind(&r.auth_method)
    .bind(r.action.as_str())
    .bind(r.priority)
    .bind(r.state.as_str())
    .bind(&r.message)
    .bind(r.valid_from_utc)
    .bind(r.valid_to_utc)
    .bind(r.daily_from_local)
    .bind(r.daily_to_local)
    .fetch_one(ex)
    .await
    .context("upsert_rule failed")?;

    Ok(inserted)
}
