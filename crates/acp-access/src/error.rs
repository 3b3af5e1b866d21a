//! Service error taxonomy, mapped to HTTP at the daemon boundary.

use std::fmt;

/// The reason a core operation was refused or failed.
///
/// Implements `std::error::Error` so it can be boxed and propagated
/// through `Box<dyn Error>` chains without extra wrapping.
#[derive(Debug)]
pub enum CoreError {
    /// Malformed input that slipped past the boundary. 400.
    Validation(String),
    /// Missing aggregate within the tenant. 404.
    NotFound(String),
    /// Uniqueness race with no safe recovery. 409.
    Conflict(String),
    /// Fail-fast setup problem (e.g. reason catalog missing POLICY_ERROR).
    FatalConfig(String),
    /// Transient infrastructure trouble. 503.
    Unavailable(String),
    /// Everything else. 500.
    Internal(anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::FatalConfig(_) => "FATAL_CONFIG",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::FatalConfig(_) | Self::Internal(_) => 500,
            Self::Unavailable(_) => 503,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation failed: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::FatalConfig(msg) => write!(f, "fatal configuration error: {msg}"),
            Self::Unavailable(msg) => write!(f, "temporarily unavailable: {msg}"),
            Self::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Internal(err) => err.source(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_taxonomy() {
        assert_eq!(CoreError::Validation("x".into()).http_status(), 400);
        assert_eq!(CoreError::NotFound("x".into()).http_status(), 404);
        assert_eq!(CoreError::Conflict("x".into()).http_status(), 409);
        assert_eq!(CoreError::FatalConfig("x".into()).http_status(), 500);
        assert_eq!(CoreError::Unavailable("x".into()).http_status(), 503);
        assert_eq!(
            CoreError::Internal(anyhow::anyhow!("x")).http_status(),
            500
        );
    }
}
