use chrono::{DateTime, Utc};

/// Structured payload returned when a tier usage limit is hit.
///
/// Carries everything a front-end needs to render an upgrade prompt.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LimitExceeded {
    /// Machine-readable code, e.g. `"monthly_messages_exceeded"`.
    pub error_code: String,
    pub limit: u64,
    pub used: u64,
    pub reset_at: DateTime<Utc>,
    /// Suggested tier to upgrade to, if any.
    pub upgrade_to: Option<String>,
}

/// Shared error type used across all Cortex crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency failure: the expected document version did
    /// not match. Callers may retry with a fresh read.
    #[error("version conflict on {entity} {id}: expected version {expected}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: u64,
    },

    /// Per-user daemon slots are exhausted.
    #[error("capacity exceeded: {used}/{limit} daemon slots in use")]
    CapacityExceeded { limit: u32, used: u32 },

    /// A tier usage limit was hit. Carries the structured payload.
    #[error("limit exceeded: {}", .0.error_code)]
    LimitExceeded(LimitExceeded),

    /// Transient LLM failure (network, 5xx, unparseable output). Retried
    /// across candidate models before surfacing.
    #[error("llm transient ({provider}/{model}): {message}")]
    LlmTransient {
        provider: String,
        model: String,
        message: String,
    },

    /// Quota / rate-limit response from a provider. Triggers a cooldown on
    /// the (provider, model) key; the call is retried on another candidate.
    #[error("llm quota ({provider}/{model}): {message}")]
    LlmQuota {
        provider: String,
        model: String,
        message: String,
    },

    /// Non-retryable tool failure.
    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Cooperative cancellation. Partial work stays persisted and no
    /// failure event is emitted beyond the `cancelled` status.
    #[error("cancelled")]
    Cancelled,

    #[error("invalid state transition: {entity} {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the orchestrator should retry this error on another model.
    pub fn is_retryable_llm(&self) -> bool {
        matches!(
            self,
            Error::LlmTransient { .. } | Error::LlmQuota { .. } | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_display() {
        let e = Error::VersionConflict {
            entity: "chat",
            id: "c1".into(),
            expected: 7,
        };
        assert_eq!(
            e.to_string(),
            "version conflict on chat c1: expected version 7"
        );
    }

    #[test]
    fn retryable_classification() {
        let transient = Error::LlmTransient {
            provider: "gw".into(),
            model: "m".into(),
            message: "503".into(),
        };
        let quota = Error::LlmQuota {
            provider: "gw".into(),
            model: "m".into(),
            message: "429".into(),
        };
        assert!(transient.is_retryable_llm());
        assert!(quota.is_retryable_llm());
        assert!(Error::Timeout("chat".into()).is_retryable_llm());
        assert!(!Error::Cancelled.is_retryable_llm());
        assert!(!Error::Validation("x".into()).is_retryable_llm());
    }

    #[test]
    fn limit_exceeded_payload_roundtrip() {
        let payload = LimitExceeded {
            error_code: "monthly_messages_exceeded".into(),
            limit: 100,
            used: 100,
            reset_at: Utc::now(),
            upgrade_to: Some("pro".into()),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: LimitExceeded = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
