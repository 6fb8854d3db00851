use thiserror::Error;

use super::FailPoint;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{resource} request failed with status {status}: {message}")]
    Status {
        resource: String,
        status: u16,
        message: String,
    },
    #[error("failed to decode {resource}: {message}")]
    Decode { resource: String, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("injected failure at {0:?}")]
    Injected(FailPoint),
}

impl BackendError {
    pub fn transport(err: impl ToString) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn decode(resource: impl Into<String>, err: impl ToString) -> Self {
        Self::Decode {
            resource: resource.into(),
            message: err.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}
