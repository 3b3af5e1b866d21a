//! Shared vocabulary for the access-control core.
//!
//! Every enum that crosses a boundary (HTTP body, database column, event
//! payload) lives here, together with its canonical uppercase string form.
//! The database stores the `as_str` form; `parse` is the single place a
//! stored string is turned back into a typed value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod events;

pub use events::{
    AttemptRegistered, CommandEmitted, CommandExecuted, DecisionMade, DlqMessage, DomainEvent,
    EventEnvelope, InvalidateAllRequested, PolicyChanged, PolicyChangeType,
};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Physical direction of an access attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::Out => "OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN" => Some(Self::In),
            "OUT" => Some(Self::Out),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SubjectType
// ---------------------------------------------------------------------------

/// Who (category) is attempting access. Attempts start as `Unknown` and may
/// be refined by credential resolution upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectType {
    Unknown,
    Resident,
    Visitor,
    Staff,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Resident => "RESIDENT",
            Self::Visitor => "VISITOR",
            Self::Staff => "STAFF",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNKNOWN" => Some(Self::Unknown),
            "RESIDENT" => Some(Self::Resident),
            "VISITOR" => Some(Self::Visitor),
            "STAFF" => Some(Self::Staff),
            _ => None,
        }
    }
}

impl Default for SubjectType {
    fn default() -> Self {
        Self::Unknown
    }
}

// ---------------------------------------------------------------------------
// DecisionResult
// ---------------------------------------------------------------------------

/// Outcome of policy evaluation for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionResult {
    Permit,
    Deny,
    Pending,
    Error,
}

impl DecisionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permit => "PERMIT",
            Self::Deny => "DENY",
            Self::Pending => "PENDING",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PERMIT" => Some(Self::Permit),
            "DENY" => Some(Self::Deny),
            "PENDING" => Some(Self::Pending),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Lowercase tag used for the `attempts_total{result=…}` counter.
    pub fn metric_tag(&self) -> &'static str {
        match self {
            Self::Permit => "permit",
            Self::Deny => "deny",
            Self::Pending => "pending",
            Self::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// CommandType / CommandState
// ---------------------------------------------------------------------------

/// Instruction emitted to a device as a consequence of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    OpenDoor,
    DenyWithSignal,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenDoor => "OPEN_DOOR",
            Self::DenyWithSignal => "DENY_WITH_SIGNAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN_DOOR" => Some(Self::OpenDoor),
            "DENY_WITH_SIGNAL" => Some(Self::DenyWithSignal),
            _ => None,
        }
    }
}

/// Lifecycle state of a device command.
///
/// `Sent` is the only non-terminal state; a command transitions to exactly
/// one of the terminal states via the outcome callback and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandState {
    Sent,
    ExecutedOk,
    ExecutedError,
    Timeout,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::ExecutedOk => "EXECUTED_OK",
            Self::ExecutedError => "EXECUTED_ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENT" => Some(Self::Sent),
            "EXECUTED_OK" => Some(Self::ExecutedOk),
            "EXECUTED_ERROR" => Some(Self::ExecutedError),
            "TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ExecutedOk | Self::ExecutedError | Self::Timeout)
    }
}

// ---------------------------------------------------------------------------
// RuleAction / RuleState
// ---------------------------------------------------------------------------

/// What a matching rule asks the pipeline to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Permit,
    Deny,
    RequireAuth,
    WaitControl,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permit => "PERMIT",
            Self::Deny => "DENY",
            Self::RequireAuth => "REQUIRE_AUTH",
            Self::WaitControl => "WAIT_CONTROL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PERMIT" => Some(Self::Permit),
            "DENY" => Some(Self::Deny),
            "REQUIRE_AUTH" => Some(Self::RequireAuth),
            "WAIT_CONTROL" => Some(Self::WaitControl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleState {
    Active,
    Inactive,
}

impl RuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "INACTIVE" => Some(Self::Inactive),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// A base access rule as the decision engine sees it.
///
/// Candidate sets cache immutable snapshots of these; all time-dependent
/// matching (UTC validity window, daily local window) happens at evaluation
/// time, never at cache-fill time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: Uuid,
    pub org_id: Uuid,
    pub area_id: Uuid,
    /// `None` = rule applies to every device in the area.
    pub device_id: Option<Uuid>,
    pub subject_type: SubjectType,
    /// `None` = matches both directions.
    pub direction: Option<Direction>,
    /// `None` = matches every authentication method.
    pub auth_method: Option<String>,
    pub action: RuleAction,
    /// Higher wins. Default 100.
    pub priority: i32,
    pub state: RuleState,
    pub message: Option<String>,
    pub valid_from_utc: Option<DateTime<Utc>>,
    pub valid_to_utc: Option<DateTime<Utc>>,
    /// Daily local window `[from, to)`. Both bounds set or both unset;
    /// `from > to` wraps across midnight.
    pub daily_from_local: Option<chrono::NaiveTime>,
    pub daily_to_local: Option<chrono::NaiveTime>,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Reason codes
// ---------------------------------------------------------------------------

/// Fixed reason-catalog codes. The catalog table is seeded with exactly
/// these; an unknown code resolved at decision-persist time falls back to
/// [`reason::POLICY_ERROR`].
pub mod reason {
    pub const RULE_MATCH_ALLOW: &str = "RULE_MATCH_ALLOW";
    pub const RULE_MATCH_DENY: &str = "RULE_MATCH_DENY";
    pub const RULE_MATCH_REQUIRE_AUTH: &str = "RULE_MATCH_REQUIRE_AUTH";
    pub const RULE_MATCH_WAIT_CONTROL: &str = "RULE_MATCH_WAIT_CONTROL";
    pub const NO_MATCHING_RULE: &str = "NO_MATCHING_RULE";
    pub const NO_RULES_FOR_CONTEXT: &str = "NO_RULES_FOR_CONTEXT";
    pub const POLICY_ERROR: &str = "POLICY_ERROR";

    /// Every code the catalog is seeded with, in seed order. The daemon
    /// verifies the catalog against this list at startup and refuses to
    /// boot if any code is missing.
    pub const ALL: &[&str] = &[
        RULE_MATCH_ALLOW,
        RULE_MATCH_DENY,
        RULE_MATCH_REQUIRE_AUTH,
        RULE_MATCH_WAIT_CONTROL,
        NO_MATCHING_RULE,
        NO_RULES_FOR_CONTEXT,
        POLICY_ERROR,
    ];
}

/// Identifier of the rule-based engine, stamped into `policy_version` on
/// every decision it produces.
pub const ENGINE_VERSION: &str = "rules-v2";

// ---------------------------------------------------------------------------
// Field length limits
// ---------------------------------------------------------------------------

/// Column-width limits enforced by truncation at the service boundary.
pub mod limits {
    pub const COMMAND_MESSAGE: usize = 120;
    pub const DECISION_DETAIL: usize = 250;
    pub const ERROR_CODE: usize = 60;
    pub const ERROR_DETAIL: usize = 250;
    pub const EXTERNAL_EXECUTION_ID: usize = 120;
    pub const DLQ_ERROR_MESSAGE: usize = 500;
}

/// Truncate to at most `max` characters, cutting on a character boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Trim, then map empty to `None`.
pub fn normalize(s: Option<&str>) -> Option<String> {
    s.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}
