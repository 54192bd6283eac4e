//! lit-governor error types

/// lit-governor error types.
///
/// Only [`InvalidInput`](GovernorError::InvalidInput) reaches callers of the
/// rate limiter and cache manager during normal operation. Backend and
/// configuration failures are recovered locally and reported through return
/// values (miss, `false`, `0`, `Degraded`).
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    // Contract violations
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Backend errors
    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend not connected")]
    NotConnected,

    #[error("backend operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GovernorError {
    /// Whether this error is transient and worth retrying on a later call.
    ///
    /// Backend outages and timeouts are transient. Contract violations,
    /// configuration mistakes and corrupt payloads are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GovernorError::Backend(_) | GovernorError::NotConnected | GovernorError::Timeout { .. }
        )
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for GovernorError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            GovernorError::Timeout {
                operation: format!("redis: {err}"),
                timeout_ms: 0,
            }
        } else {
            GovernorError::Backend(err.to_string())
        }
    }
}

/// Result type alias for lit-governor operations
pub type Result<T> = std::result::Result<T, GovernorError>;
