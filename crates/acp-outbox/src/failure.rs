//! Transport failure taxonomy.
//!
//! Classification decides retry policy: HTTP failures retry only for
//! 5xx/429/408, network-shaped failures always retry, and anything
//! unclassified defaults to retryable so a novel failure mode degrades to
//! retry-then-park instead of silent loss.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Remote answered with a non-success status.
    Http,
    /// Socket or request timeout.
    Timeout,
    /// DNS failure, connection refused/reset.
    Connection,
    /// Transient I/O trouble.
    Io,
    /// Client/framework-level error (bad request build, codec).
    Transport,
    /// Unclassified.
    Unknown,
}

impl FailureKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Timeout => "TIMEOUT",
            Self::Connection => "CONNECTION",
            Self::Io => "IO",
            Self::Transport => "TRANSPORT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// A classified delivery failure.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: FailureKind,
    pub message: String,
    pub http_status: Option<u16>,
    /// Server-provided retry hint; overrides computed backoff.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn http(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::Http,
            message: message.into(),
            http_status: Some(status),
            retry_after,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
            http_status: Some(408),
            retry_after: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Connection,
            message: message.into(),
            http_status: None,
            retry_after: None,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Io,
            message: message.into(),
            http_status: None,
            retry_after: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
            http_status: None,
            retry_after: None,
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unknown,
            message: message.into(),
            http_status: None,
            retry_after: None,
        }
    }

    /// Whether the dispatcher should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            FailureKind::Http => matches!(
                self.http_status,
                Some(status) if status >= 500 || status == 429 || status == 408
            ),
            FailureKind::Timeout
            | FailureKind::Connection
            | FailureKind::Io
            | FailureKind::Unknown => true,
            // Framework errors are request-shaped: retrying the same bytes
            // will fail the same way.
            FailureKind::Transport => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "{} ({status}): {}", self.kind.code(), self.message),
            None => write!(f, "{}: {}", self.kind.code(), self.message),
        }
    }
}

impl std::error::Error for TransportError {}
