use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`CrucibleError`].
pub type CrucibleResult<T> = Result<T, CrucibleError>;

/// The abstract classification of a [`CrucibleError`], used by the retry
/// controller to decide whether an operation is worth retrying and by
/// progress events to report a stable, serializable failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The provider took too long to respond.
    Timeout,
    /// The provider rejected the request due to rate limiting.
    RateLimited,
    /// A transport-level failure talking to the provider.
    NetworkError,
    /// A provider-side failure; `retryable` distinguishes transient 5xx-class
    /// failures from permanent ones.
    ProviderError,
    /// The request itself was malformed; retrying would not help.
    InvalidRequest,
    /// A payload failed schema validation.
    SchemaValidation,
    /// An attempt to advance `current_stage` to a non-adjacent stage.
    InvalidStageTransition,
    /// A checkpoint record failed to parse or carries an unknown schema version.
    CheckpointCorrupted,
    /// The workflow configuration is invalid; the workflow refuses to start.
    ConfigurationError,
}

/// Top-level error type shared across the orchestration engine.
///
/// Each variant corresponds to one abstract error kind from the error
/// taxonomy; [`CrucibleError::error_kind`] recovers it for classification by
/// the retry controller and the progress emitter.
#[derive(Debug, Error)]
pub enum CrucibleError {
    /// The `Generator` did not respond within the configured deadline.
    #[error("generator timed out: {0}")]
    Timeout(String),

    /// The provider rejected the request for being over its rate limit.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A transport-level failure (connection reset, DNS, TLS, ...).
    #[error("network error: {0}")]
    NetworkError(String),

    /// A provider-side error. `retryable` is the provider's own signal of
    /// whether the same request might succeed on a later attempt.
    #[error("provider error: {message}")]
    ProviderError {
        /// Human-readable detail from the provider.
        message: String,
        /// Whether the provider flagged this failure as transient.
        retryable: bool,
    },

    /// The caller supplied a malformed request; retrying will not help.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A payload did not conform to its expected schema.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// `ProjectState::advance_stage` was asked to jump to a non-adjacent
    /// stage (anything other than `FAILED` or the immediate successor).
    #[error("invalid stage transition from {from} to {to}")]
    InvalidStageTransition {
        /// The stage the workflow was in when the transition was attempted.
        from: String,
        /// The stage that was requested.
        to: String,
    },

    /// A checkpoint record failed schema validation or carries an unknown
    /// `schema_version`. Recoverable by discarding the record and falling
    /// back to an older one, or starting fresh.
    #[error("checkpoint corrupted: {0}")]
    CheckpointCorrupted(String),

    /// The workflow's configuration failed validation before any stage ran.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// JSON (de)serialization failure, surfaced from `serde_json`.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem or other I/O failure (checkpoint and cache persistence).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrucibleError {
    /// Classifies this error into its abstract [`ErrorKind`].
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            CrucibleError::Timeout(_) => ErrorKind::Timeout,
            CrucibleError::RateLimited(_) => ErrorKind::RateLimited,
            CrucibleError::NetworkError(_) => ErrorKind::NetworkError,
            CrucibleError::ProviderError { .. } => ErrorKind::ProviderError,
            CrucibleError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            CrucibleError::SchemaValidation(_) => ErrorKind::SchemaValidation,
            CrucibleError::InvalidStageTransition { .. } => ErrorKind::InvalidStageTransition,
            CrucibleError::CheckpointCorrupted(_) => ErrorKind::CheckpointCorrupted,
            CrucibleError::ConfigurationError(_) => ErrorKind::ConfigurationError,
            // Ambient I/O and serialization failures are not part of the
            // taxonomy's retry vocabulary; callers that need to retry on
            // them should wrap with a named kind at the call site instead.
            CrucibleError::Json(_) | CrucibleError::Io(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Whether the provider flagged a [`CrucibleError::ProviderError`] as
    /// transient. Other variants are never retryable through this signal
    /// alone (retryability is decided by `retry_on_errors` membership).
    pub fn provider_retryable(&self) -> bool {
        matches!(self, CrucibleError::ProviderError { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_classification() {
        assert_eq!(CrucibleError::Timeout("x".into()).error_kind(), ErrorKind::Timeout);
        assert_eq!(
            CrucibleError::ProviderError { message: "x".into(), retryable: true }.error_kind(),
            ErrorKind::ProviderError
        );
        assert_eq!(
            CrucibleError::InvalidStageTransition { from: "A".into(), to: "C".into() }.error_kind(),
            ErrorKind::InvalidStageTransition
        );
    }

    #[test]
    fn provider_retryable_signal() {
        let retryable = CrucibleError::ProviderError { message: "x".into(), retryable: true };
        let permanent = CrucibleError::ProviderError { message: "x".into(), retryable: false };
        assert!(retryable.provider_retryable());
        assert!(!permanent.provider_retryable());
        assert!(!CrucibleError::Timeout("x".into()).provider_retryable());
    }
}
