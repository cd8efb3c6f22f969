//! Error types for the email agent.
//!
//! Every collaborator error maps onto a [`FailureClass`], which is the only
//! thing the orchestrator looks at when deciding whether to retry, fail an
//! item, or halt the rest of a cycle.

use std::time::Duration;

use uuid::Uuid;

use crate::llm::CallUsage;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Reconciler error: {0}")]
    Reconciler(#[from] ReconcilerError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// How a failed collaborator call should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff; fail the unit once the budget is spent.
    Transient,
    /// Fail the unit immediately.
    Permanent,
    /// Credentials need renewal. Halts calls to that collaborator.
    AuthExpired,
    /// Budget or API quota spent. Halts calls for the rest of the cycle.
    QuotaExceeded,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors. Always fatal for the running cycle.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        let msg = e.to_string();
        if msg.contains("CHECK constraint") || msg.contains("UNIQUE constraint") {
            DatabaseError::Constraint(msg)
        } else {
            DatabaseError::Query(msg)
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        DatabaseError::Serialization(e.to_string())
    }
}

/// Errors from the inbound item source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source {name} connection failed: {reason}")]
    Connection { name: String, reason: String },

    #[error("Authentication failed for source {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Source {name} protocol error: {reason}")]
    Protocol { name: String, reason: String },

    #[error("Source {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} quota exhausted: {reason}")]
    QuotaExhausted { provider: String, reason: String },

    #[error("Provider {provider} returned {status}: {body}")]
    ServerError {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} rejected request ({status}): {body}")]
    Rejected {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by an analysis engine.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Analysis rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Analysis call timed out")]
    Timeout,

    #[error("Analysis engine unavailable: {reason}")]
    Unavailable { reason: String },

    /// The engine answered but the answer failed validation. Any usage the
    /// call consumed is carried so it still reaches the cost ledger.
    #[error("Invalid analysis content: {reason}")]
    InvalidContent {
        reason: String,
        usage: Option<CallUsage>,
    },

    #[error("Analysis request rejected: {reason}")]
    Rejected { reason: String },

    #[error("Analysis quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    #[error("Analysis credentials expired: {reason}")]
    AuthExpired { reason: String },
}

impl AnalysisError {
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::RateLimited { .. } | Self::Timeout | Self::Unavailable { .. } => {
                FailureClass::Transient
            }
            Self::InvalidContent { .. } | Self::Rejected { .. } => FailureClass::Permanent,
            Self::QuotaExceeded { .. } => FailureClass::QuotaExceeded,
            Self::AuthExpired { .. } => FailureClass::AuthExpired,
        }
    }

    /// Usage consumed by the failing call, if the engine reported any.
    pub fn usage(&self) -> Option<&CallUsage> {
        match self {
            Self::InvalidContent { usage, .. } => usage.as_ref(),
            _ => None,
        }
    }

    /// Server-suggested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<LlmError> for AnalysisError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited { retry_after, .. } => Self::RateLimited { retry_after },
            LlmError::Timeout { .. } => Self::Timeout,
            LlmError::RequestFailed { reason, .. } => Self::Unavailable { reason },
            LlmError::ServerError { status, body, .. } => Self::Unavailable {
                reason: format!("status {status}: {body}"),
            },
            LlmError::QuotaExhausted { reason, .. } => Self::QuotaExceeded { reason },
            LlmError::AuthFailed { provider } => Self::AuthExpired {
                reason: format!("provider {provider} rejected credentials"),
            },
            LlmError::Rejected { status, body, .. } => Self::Rejected {
                reason: format!("status {status}: {body}"),
            },
            LlmError::InvalidResponse { reason, .. } => Self::InvalidContent {
                reason,
                usage: None,
            },
            LlmError::Json(e) => Self::InvalidContent {
                reason: e.to_string(),
                usage: None,
            },
        }
    }
}

/// Errors surfaced by a task reconciler.
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("Reconciler request failed: {reason}")]
    Transient { reason: String },

    #[error("Reconciler conflict: {reason}")]
    Conflict { reason: String },

    #[error("Remote task {external_id} not found")]
    NotFound { external_id: String },

    #[error("Reconciler rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Reconciler credentials expired: {reason}")]
    AuthExpired { reason: String },

    #[error("Reconciler quota exceeded: {reason}")]
    QuotaExceeded { reason: String },
}

impl ReconcilerError {
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Transient { .. } => FailureClass::Transient,
            Self::Conflict { .. } | Self::NotFound { .. } | Self::Rejected { .. } => {
                FailureClass::Permanent
            }
            Self::AuthExpired { .. } => FailureClass::AuthExpired,
            Self::QuotaExceeded { .. } => FailureClass::QuotaExceeded,
        }
    }
}

impl From<reqwest::Error> for ReconcilerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient {
            reason: e.to_string(),
        }
    }
}

/// Pipeline-level errors returned by orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Storage is unreachable or refused a write. Aborts the cycle.
    #[error("Storage failure: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Source failure: {0}")]
    Source(#[from] SourceError),

    #[error("Reconciler failure: {0}")]
    Reconciler(#[from] ReconcilerError),

    #[error("Analysis failure: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Item {id} is {state}, cannot {operation}")]
    InvalidState {
        id: Uuid,
        state: String,
        operation: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("Item {id} was modified concurrently")]
    Conflict { id: Uuid },
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn llm_errors_map_to_analysis_classes() {
        let cases = [
            (
                LlmError::RateLimited {
                    provider: "openai".into(),
                    retry_after: None,
                },
                FailureClass::Transient,
            ),
            (
                LlmError::ServerError {
                    provider: "openai".into(),
                    status: 503,
                    body: "overloaded".into(),
                },
                FailureClass::Transient,
            ),
            (
                LlmError::QuotaExhausted {
                    provider: "openai".into(),
                    reason: "insufficient_quota".into(),
                },
                FailureClass::QuotaExceeded,
            ),
            (
                LlmError::AuthFailed {
                    provider: "openai".into(),
                },
                FailureClass::AuthExpired,
            ),
            (
                LlmError::Rejected {
                    provider: "openai".into(),
                    status: 400,
                    body: "bad request".into(),
                },
                FailureClass::Permanent,
            ),
        ];
        for (llm, expected) in cases {
            assert_eq!(AnalysisError::from(llm).classify(), expected);
        }
    }

    #[test]
    fn invalid_content_carries_usage() {
        let err = AnalysisError::InvalidContent {
            reason: "missing summary".into(),
            usage: Some(CallUsage {
                input_tokens: 120,
                output_tokens: 30,
                cost: dec!(0.0001),
            }),
        };
        assert_eq!(err.classify(), FailureClass::Permanent);
        assert_eq!(err.usage().map(|u| u.total_tokens()), Some(150));
    }

    #[test]
    fn rate_limit_exposes_retry_hint() {
        let err = AnalysisError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(AnalysisError::Timeout.retry_after(), None);
    }

    #[test]
    fn reconciler_classes() {
        assert_eq!(
            ReconcilerError::Transient { reason: "503".into() }.classify(),
            FailureClass::Transient
        );
        assert_eq!(
            ReconcilerError::Conflict { reason: "dup".into() }.classify(),
            FailureClass::Permanent
        );
        assert_eq!(
            ReconcilerError::AuthExpired { reason: "401".into() }.classify(),
            FailureClass::AuthExpired
        );
        assert_eq!(
            ReconcilerError::QuotaExceeded { reason: "daily".into() }.classify(),
            FailureClass::QuotaExceeded
        );
    }
}
