//! Rule-based decision engine.
//!
//! # Design
//!
//! [`evaluate`] is a pure function: it reads the candidate snapshot, the
//! immutable context, an injected `now`, and a zone provider — no I/O, no
//! clock reads, no allocation beyond the output. Given a fixed rule set
//! and `now`, two invocations produce identical outputs.
//!
//! The candidate set is time-agnostic; every time-dependent predicate
//! (UTC validity window, local daily window) is applied here, at match
//! time. Selection among matching rules is total and deterministic:
//! priority desc, then `updated_at` (newer wins, absent loses), then
//! `created_at`, then `rule_id` as the final tie-break.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

use acp_schemas::{
    reason, CommandType, DecisionResult, Direction, Rule, RuleAction, RuleState, SubjectType,
    ENGINE_VERSION,
};

pub mod cache;
pub mod zone;

pub use cache::{CacheKey, CandidateCache};
pub use zone::{ConfigZoneProvider, TenantZoneProvider};

/// How long a WAIT_CONTROL decision stays actionable.
const WAIT_CONTROL_TTL_SECS: i64 = 15;

// ---------------------------------------------------------------------------
// Context / output
// ---------------------------------------------------------------------------

/// Immutable facts about one access attempt, as the engine sees them.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub org_id: Uuid,
    pub attempt_id: Uuid,
    pub device_id: Uuid,
    pub area_id: Uuid,
    pub direction: Direction,
    pub auth_method: Option<String>,
    pub subject: SubjectType,
}

/// What the engine decided and what the pipeline should do about it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutput {
    pub result: DecisionResult,
    pub reason_code: String,
    pub detail: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Command the pipeline should emit, if any.
    pub command_hint: Option<CommandType>,
    pub message: Option<String>,
    pub policy_version: &'static str,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate `ctx` against the candidate snapshot.
///
/// Never fails on domain data: malformed rules simply do not match (and
/// are metered). The fallbacks distinguish an empty candidate set from a
/// non-empty set with no match, per the reason catalog.
pub fn evaluate(
    ctx: &DecisionContext,
    candidates: &[Rule],
    now: DateTime<Utc>,
    zones: &dyn TenantZoneProvider,
) -> DecisionOutput {
    if candidates.is_empty() {
        return deny_fallback(reason::NO_RULES_FOR_CONTEXT, now);
    }

    // Local wall-clock time for daily windows, resolved once per
    // evaluation. A missing zone is a visible misconfiguration, not an
    // error: fall back to UTC and count it.
    let tz = zones.zone_for(ctx.org_id, ctx.area_id).unwrap_or_else(|| {
        metrics::counter!("engine_zone_fallback_total").increment(1);
        Tz::UTC
    });
    let local_time = now.with_timezone(&tz).time();

    let winner = candidates
        .iter()
        .filter(|r| rule_matches(r, ctx, now, local_time))
        .max_by_key(|r| (r.priority, r.updated_at_utc, r.created_at_utc, r.rule_id));

    match winner {
        Some(rule) => translate(rule, now),
        None => deny_fallback(reason::NO_MATCHING_RULE, now),
    }
}

fn deny_fallback(reason_code: &str, now: DateTime<Utc>) -> DecisionOutput {
    DecisionOutput {
        result: DecisionResult::Deny,
        reason_code: reason_code.to_string(),
        detail: None,
        decided_at: now,
        expires_at: None,
        command_hint: Some(CommandType::DenyWithSignal),
        message: Some("Access denied".to_string()),
        policy_version: ENGINE_VERSION,
    }
}

fn rule_matches(
    rule: &Rule,
    ctx: &DecisionContext,
    now: DateTime<Utc>,
    local_time: NaiveTime,
) -> bool {
    if rule.state != RuleState::Active {
        return false;
    }
    if rule.device_id.is_some_and(|d| d != ctx.device_id) {
        return false;
    }
    if rule.direction.is_some_and(|d| d != ctx.direction) {
        return false;
    }
    if let Some(method) = &rule.auth_method {
        if ctx.auth_method.as_deref() != Some(method.as_str()) {
            return false;
        }
    }
    if rule.valid_from_utc.is_some_and(|from| from > now) {
        return false;
    }
    if rule.valid_to_utc.is_some_and(|to| to < now) {
        return false;
    }

    match daily_window(rule.daily_from_local, rule.daily_to_local, local_time) {
        WindowMatch::Match => true,
        WindowMatch::NoMatch => false,
        WindowMatch::Malformed => {
            metrics::counter!("engine_malformed_window_total").increment(1);
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowMatch {
    Match,
    NoMatch,
    Malformed,
}

/// Daily local window `[from, to)` with wraparound.
///
/// Both bounds absent matches always; a single bound, or `from == to`,
/// is malformed and never matches. `from > to` spans midnight.
fn daily_window(from: Option<NaiveTime>, to: Option<NaiveTime>, t: NaiveTime) -> WindowMatch {
    match (from, to) {
        (None, None) => WindowMatch::Match,
        (Some(d), Some(h)) if d == h => WindowMatch::Malformed,
        (Some(d), Some(h)) if d < h => {
            if d <= t && t < h {
                WindowMatch::Match
            } else {
                WindowMatch::NoMatch
            }
        }
        (Some(d), Some(h)) => {
            // Overnight: matches late evening or early morning.
            debug_assert!(d > h);
            if t >= d || t < h {
                WindowMatch::Match
            } else {
                WindowMatch::NoMatch
            }
        }
        _ => WindowMatch::Malformed,
    }
}

fn translate(rule: &Rule, now: DateTime<Utc>) -> DecisionOutput {
    let base = DecisionOutput {
        result: DecisionResult::Error,
        reason_code: reason::POLICY_ERROR.to_string(),
        detail: None,
        decided_at: now,
        expires_at: None,
        command_hint: None,
        message: None,
        policy_version: ENGINE_VERSION,
    };

    match rule.action {
        RuleAction::Permit => DecisionOutput {
            result: DecisionResult::Permit,
            reason_code: reason::RULE_MATCH_ALLOW.to_string(),
            command_hint: Some(CommandType::OpenDoor),
            message: rule.message.clone(),
            ..base
        },
        RuleAction::Deny => DecisionOutput {
            result: DecisionResult::Deny,
            reason_code: reason::RULE_MATCH_DENY.to_string(),
            command_hint: Some(CommandType::DenyWithSignal),
            message: rule
                .message
                .clone()
                .or_else(|| Some("Access denied".to_string())),
            ..base
        },
        RuleAction::RequireAuth => DecisionOutput {
            result: DecisionResult::Pending,
            reason_code: reason::RULE_MATCH_REQUIRE_AUTH.to_string(),
            message: Some("Requires additional authentication".to_string()),
            ..base
        },
        RuleAction::WaitControl => DecisionOutput {
            result: DecisionResult::Pending,
            reason_code: reason::RULE_MATCH_WAIT_CONTROL.to_string(),
            detail: rule.message.clone(),
            expires_at: Some(now + ChronoDuration::seconds(WAIT_CONTROL_TTL_SECS)),
            message: rule.message.clone(),
            ..base
        },
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct NoZone;
    impl TenantZoneProvider for NoZone {
        fn zone_for(&self, _org: Uuid, _area: Uuid) -> Option<Tz> {
            None
        }
    }

    fn ctx() -> DecisionContext {
        DecisionContext {
            org_id: Uuid::new_v4(),
            attempt_id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            area_id: Uuid::new_v4(),
            direction: Direction::In,
            auth_method: Some("CARD".to_string()),
            subject: SubjectType::Resident,
        }
    }

    fn rule(ctx: &DecisionContext, action: RuleAction) -> Rule {
        Rule {
            rule_id: Uuid::new_v4(),
            org_id: ctx.org_id,
            area_id: ctx.area_id,
            device_id: None,
            subject_type: ctx.subject,
            direction: None,
            auth_method: None,
            action,
            priority: 100,
            state: RuleState::Active,
            message: None,
            valid_from_utc: None,
            valid_to_utc: None,
            daily_from_local: None,
            daily_to_local: None,
            created_at_utc: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            updated_at_utc: None,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn utc_zone() -> ConfigZoneProvider {
        ConfigZoneProvider::new(Tz::UTC, HashMap::new())
    }

    #[test]
    fn empty_candidates_deny_with_no_rules_reason() {
        let c = ctx();
        let out = evaluate(&c, &[], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out.result, DecisionResult::Deny);
        assert_eq!(out.reason_code, reason::NO_RULES_FOR_CONTEXT);
        assert_eq!(out.command_hint, Some(CommandType::DenyWithSignal));
    }

    #[test]
    fn permit_rule_opens_door() {
        let c = ctx();
        let mut r = rule(&c, RuleAction::Permit);
        r.message = Some("welcome".to_string());
        let out = evaluate(&c, &[r], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out.result, DecisionResult::Permit);
        assert_eq!(out.reason_code, reason::RULE_MATCH_ALLOW);
        assert_eq!(out.command_hint, Some(CommandType::OpenDoor));
        assert_eq!(out.message.as_deref(), Some("welcome"));
        assert_eq!(out.policy_version, ENGINE_VERSION);
    }

    #[test]
    fn no_match_deny_is_distinct_from_no_candidates() {
        let c = ctx();
        let mut r = rule(&c, RuleAction::Permit);
        r.direction = Some(Direction::Out);
        let out = evaluate(&c, &[r], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out.result, DecisionResult::Deny);
        assert_eq!(out.reason_code, reason::NO_MATCHING_RULE);
    }

    #[test]
    fn wildcards_match_any_device_direction_and_method() {
        let c = ctx();
        let r = rule(&c, RuleAction::Permit);
        let out = evaluate(&c, &[r], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out.result, DecisionResult::Permit);
    }

    #[test]
    fn scoped_fields_must_equal_context() {
        let c = ctx();
        let mut device_rule = rule(&c, RuleAction::Permit);
        device_rule.device_id = Some(c.device_id);
        let mut other_device = rule(&c, RuleAction::Permit);
        other_device.device_id = Some(Uuid::new_v4());
        let mut method_rule = rule(&c, RuleAction::Permit);
        method_rule.auth_method = Some("PIN".to_string());

        let now = at(2026, 3, 1, 12, 0);
        assert_eq!(
            evaluate(&c, &[device_rule], now, &utc_zone()).result,
            DecisionResult::Permit
        );
        assert_eq!(
            evaluate(&c, &[other_device], now, &utc_zone()).reason_code,
            reason::NO_MATCHING_RULE
        );
        assert_eq!(
            evaluate(&c, &[method_rule], now, &utc_zone()).reason_code,
            reason::NO_MATCHING_RULE
        );
    }

    #[test]
    fn utc_validity_window_bounds_are_inclusive() {
        let c = ctx();
        let now = at(2026, 3, 1, 12, 0);
        let mut r = rule(&c, RuleAction::Permit);
        r.valid_from_utc = Some(now);
        r.valid_to_utc = Some(now);
        assert_eq!(
            evaluate(&c, &[r.clone()], now, &utc_zone()).result,
            DecisionResult::Permit
        );

        r.valid_from_utc = Some(now + ChronoDuration::seconds(1));
        assert_eq!(
            evaluate(&c, &[r], now, &utc_zone()).reason_code,
            reason::NO_MATCHING_RULE
        );
    }

    #[test]
    fn higher_priority_wins() {
        let c = ctx();
        let mut low = rule(&c, RuleAction::Deny);
        low.priority = 100;
        let mut high = rule(&c, RuleAction::Permit);
        high.priority = 200;
        let out = evaluate(&c, &[low, high], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out.result, DecisionResult::Permit);
    }

    #[test]
    fn equal_priority_newer_updated_at_wins() {
        let c = ctx();
        let mut older = rule(&c, RuleAction::Deny);
        older.updated_at_utc = Some(at(2026, 2, 1, 0, 0));
        let mut newer = rule(&c, RuleAction::Permit);
        newer.updated_at_utc = Some(at(2026, 2, 15, 0, 0));
        let out = evaluate(
            &c,
            &[newer.clone(), older.clone()],
            at(2026, 3, 1, 12, 0),
            &utc_zone(),
        );
        assert_eq!(out.result, DecisionResult::Permit);

        // Candidate ordering must not affect the winner.
        let out2 = evaluate(&c, &[older, newer], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out2.result, DecisionResult::Permit);
    }

    #[test]
    fn never_updated_rule_loses_to_updated_one() {
        let c = ctx();
        let never = rule(&c, RuleAction::Deny);
        let mut updated = rule(&c, RuleAction::Permit);
        updated.updated_at_utc = Some(at(2026, 2, 1, 0, 0));
        let out = evaluate(&c, &[never, updated], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out.result, DecisionResult::Permit);
    }

    #[test]
    fn overnight_window_matches_late_and_early_local_time() {
        let c = ctx();
        let mut r = rule(&c, RuleAction::Permit);
        r.daily_from_local = NaiveTime::from_hms_opt(22, 0, 0);
        r.daily_to_local = NaiveTime::from_hms_opt(6, 0, 0);
        let zones = ConfigZoneProvider::new(chrono_tz::America::Bogota, HashMap::new());

        // Bogota is UTC-5 year-round: 04:30 UTC == 23:30 local → match.
        let out = evaluate(&c, &[r.clone()], at(2026, 3, 2, 4, 30), &zones);
        assert_eq!(out.result, DecisionResult::Permit);

        // 12:00 UTC == 07:00 local → outside the window → NO_MATCHING_RULE.
        let out = evaluate(&c, &[r], at(2026, 3, 2, 12, 0), &zones);
        assert_eq!(out.reason_code, reason::NO_MATCHING_RULE);
    }

    #[test]
    fn daytime_window_is_half_open() {
        let d = NaiveTime::from_hms_opt(9, 0, 0);
        let h = NaiveTime::from_hms_opt(17, 0, 0);
        assert_eq!(
            daily_window(d, h, NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
            WindowMatch::Match
        );
        assert_eq!(
            daily_window(d, h, NaiveTime::from_hms_opt(16, 59, 59).unwrap()),
            WindowMatch::Match
        );
        assert_eq!(
            daily_window(d, h, NaiveTime::from_hms_opt(17, 0, 0).unwrap()),
            WindowMatch::NoMatch
        );
    }

    #[test]
    fn malformed_windows_never_match() {
        let t = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let noon = NaiveTime::from_hms_opt(12, 0, 0);
        assert_eq!(daily_window(noon, noon, t), WindowMatch::Malformed);
        assert_eq!(daily_window(noon, None, t), WindowMatch::Malformed);
        assert_eq!(daily_window(None, noon, t), WindowMatch::Malformed);
    }

    #[test]
    fn missing_zone_falls_back_to_utc() {
        let c = ctx();
        let mut r = rule(&c, RuleAction::Permit);
        // Window that matches 12:00 UTC but not 07:00 Bogota.
        r.daily_from_local = NaiveTime::from_hms_opt(11, 0, 0);
        r.daily_to_local = NaiveTime::from_hms_opt(13, 0, 0);
        let out = evaluate(&c, &[r], at(2026, 3, 1, 12, 0), &NoZone);
        assert_eq!(out.result, DecisionResult::Permit);
    }

    #[test]
    fn require_auth_is_pending_without_command() {
        let c = ctx();
        let r = rule(&c, RuleAction::RequireAuth);
        let out = evaluate(&c, &[r], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out.result, DecisionResult::Pending);
        assert_eq!(out.reason_code, reason::RULE_MATCH_REQUIRE_AUTH);
        assert_eq!(out.command_hint, None);
        assert_eq!(
            out.message.as_deref(),
            Some("Requires additional authentication")
        );
    }

    #[test]
    fn wait_control_expires_fifteen_seconds_out() {
        let c = ctx();
        let mut r = rule(&c, RuleAction::WaitControl);
        r.message = Some("manual check".to_string());
        let now = at(2026, 3, 1, 12, 0);
        let out = evaluate(&c, &[r], now, &utc_zone());
        assert_eq!(out.result, DecisionResult::Pending);
        assert_eq!(out.reason_code, reason::RULE_MATCH_WAIT_CONTROL);
        assert_eq!(out.expires_at, Some(now + ChronoDuration::seconds(15)));
        assert_eq!(out.detail.as_deref(), Some("manual check"));
        assert_eq!(out.command_hint, None);
    }

    #[test]
    fn deny_without_message_uses_default() {
        let c = ctx();
        let r = rule(&c, RuleAction::Deny);
        let out = evaluate(&c, &[r], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out.message.as_deref(), Some("Access denied"));
        assert_eq!(out.command_hint, Some(CommandType::DenyWithSignal));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let c = ctx();
        let mut a = rule(&c, RuleAction::Permit);
        a.priority = 150;
        let b = rule(&c, RuleAction::Deny);
        let now = at(2026, 3, 1, 12, 0);
        let first = evaluate(&c, &[a.clone(), b.clone()], now, &utc_zone());
        let second = evaluate(&c, &[a, b], now, &utc_zone());
        assert_eq!(first, second);
    }

    #[test]
    fn inactive_rules_never_match() {
        let c = ctx();
        let mut r = rule(&c, RuleAction::Permit);
        r.state = RuleState::Inactive;
        let out = evaluate(&c, &[r], at(2026, 3, 1, 12, 0), &utc_zone());
        assert_eq!(out.reason_code, reason::NO_MATCHING_RULE);
    }
}
