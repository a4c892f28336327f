//! Error taxonomy for the retrieval core.
//!
//! Tool executors never surface these to the model directly — dispatch
//! converts them into structured `{ok: false, error}` results. The engine
//! propagates only [`Error::ContextOverflow`] and fatal transport errors
//! to the caller.

use crate::llm::ChatMessage;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network or provider failure. `retryable` distinguishes transient
    /// conditions (429, 5xx, connection errors) from fatal ones.
    #[error("transport error (retryable={retryable}): {message}")]
    Transport { message: String, retryable: bool },

    /// An input was rejected before any I/O was performed.
    #[error("guardrail rejected {input}: {reason}")]
    Guardrail { input: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Even the minimal message set exceeds the model context. Carries the
    /// compacted messages so the caller can retry on a larger model.
    #[error("context overflow: {} messages still exceed the model limit", .0.len())]
    ContextOverflow(Vec<ChatMessage>),

    /// Hash mismatch or schema problem detected at read time.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The vector backend is unreachable. Queries degrade to relational
    /// scans; writes report this upward.
    #[error("vector backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Error::Transport {
            message: message.into(),
            retryable,
        }
    }

    pub fn guardrail(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Guardrail {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether a retry against the same endpoint could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_retryable_flag() {
        assert!(Error::transport("503", true).is_retryable());
        assert!(!Error::transport("401", false).is_retryable());
        assert!(!Error::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn guardrail_message_names_input() {
        let err = Error::guardrail("file:///etc/passwd", "local filesystem target rejected");
        let msg = err.to_string();
        assert!(msg.contains("file:///etc/passwd"));
        assert!(msg.contains("rejected"));
    }
}
