//! Error types for the packet compiler.
//!
//! Only [`CompileError`] ever reaches the caller of a compilation. Everything
//! below it ([`StageError`] and the port errors it wraps) is caught at a stage
//! boundary and turned into a recorded [`crate::ValidationIssue`] plus a
//! fallback. Cancellation is the one condition that unwinds all the way out.

use thiserror::Error;

use crate::StageKind;

// ---------------------------------------------------------------------------
// Port errors
// ---------------------------------------------------------------------------

/// Failure reported by an [`crate::LlmGateway`] implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// The request never produced an HTTP response (DNS, TLS, reset, timeout).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The provider answered with a non-success status.
    #[error("provider returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// The provider rejected the request because it does not support the
    /// requested structured-output mechanism.
    ///
    /// The call gateway answers this by retrying once without a schema.
    #[error("provider does not support structured output: {0}")]
    SchemaUnsupported(String),

    /// The provider answered successfully but without any content.
    #[error("provider returned an empty completion")]
    EmptyResponse,
}

impl GatewayError {
    /// Transient failures worth another attempt: transport errors, rate
    /// limits and server errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::SchemaUnsupported(_) | Self::EmptyResponse => false,
        }
    }
}

/// Failure reported by a [`crate::DictionaryLookup`] implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LookupError {
    #[error("dictionary unavailable: {0}")]
    Unavailable(String),
    #[error("malformed dictionary entry for '{surface}': {message}")]
    Malformed { surface: String, message: String },
}

/// Failure reported by a [`crate::SegmentSource`] implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("work '{0}' not found")]
    NotFound(String),
    #[error("segment source unavailable: {0}")]
    Unavailable(String),
    #[error("segment source returned malformed data: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Stage boundary
// ---------------------------------------------------------------------------

/// A model response that could not be turned into a typed stage payload.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PayloadError {
    /// No JSON object could be recovered from the response text.
    #[error("response contained no parseable JSON object")]
    NoJson,

    /// JSON parsed but did not match the payload shape.
    #[error("response did not match the expected shape: {0}")]
    Shape(String),

    /// The payload parsed but is unusable (e.g. no words for a non-empty phase).
    #[error("payload rejected: {0}")]
    Rejected(String),
}

/// Why one specialist stage (or the planner, or the monolithic fallback) failed.
///
/// Everything except [`StageError::Cancelled`] is recoverable by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("{stage} call failed: {source}")]
    Gateway {
        stage: StageKind,
        #[source]
        source: GatewayError,
    },

    #[error("{stage} payload invalid: {source}")]
    Payload {
        stage: StageKind,
        #[source]
        source: PayloadError,
    },

    /// The stage has no input to work on (e.g. no reference translation for alignment).
    #[error("{stage} skipped: {reason}")]
    Skipped { stage: StageKind, reason: String },

    #[error("compilation cancelled")]
    Cancelled,
}

impl StageError {
    /// Returns `true` for the cancellation variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Top-level
// ---------------------------------------------------------------------------

/// Errors returned from a compilation run.
///
/// Validation findings are never returned this way; they are carried in the
/// packet's `validationIssues`.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The caller's abort signal fired.
    #[error("compilation cancelled")]
    Cancelled,

    /// The compiler configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The segment source could not supply the work.
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl From<StageError> for CompileError {
    /// Only cancellation is expected to cross this boundary; any other stage
    /// error reaching it is reported as a configuration problem.
    fn from(err: StageError) -> Self {
        match err {
            StageError::Cancelled => Self::Cancelled,
            other => Self::Configuration(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_gateway_failures_are_retryable() {
        let status = |status| GatewayError::Status { status, body: String::new() };
        assert!(GatewayError::Transport("reset".into()).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!GatewayError::SchemaUnsupported("json_schema".into()).is_retryable());
        assert!(!GatewayError::EmptyResponse.is_retryable());
    }
}
