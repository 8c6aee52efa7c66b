//! Error taxonomy
//!
//! `StepError` is scoped to one step on one platform and never escapes it.
//! `StoreError` comes from the secret store. `ReconcileError` aborts a whole run.

use thiserror::Error;

/// Failure of a single capability call against a platform
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Network error or timeout; the readiness gate retries on the next run
    #[error("platform unreachable: {0}")]
    Unreachable(String),

    /// The platform validated and refused the request
    #[error("platform rejected request ({status}): {payload}")]
    Rejected { status: u16, payload: String },

    /// The platform answered with something we could not interpret
    #[error("unexpected platform response: {0}")]
    Decode(String),

    /// Reading or persisting a secret failed
    #[error("secret store error: {0}")]
    Store(String),
}

impl StepError {
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Unreachable(_) => "unreachable",
            StepError::Rejected { .. } => "rejected",
            StepError::Decode(_) => "decode",
            StepError::Store(_) => "store",
        }
    }
}

impl From<reqwest::Error> for StepError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StepError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            StepError::Rejected {
                status: status.as_u16(),
                payload: err.to_string(),
            }
        } else {
            StepError::Unreachable(err.to_string())
        }
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::Store(err.to_string())
    }
}

/// Secret store failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Network error, sealed or uninitialised store
    #[error("secret store unavailable: {0}")]
    Unavailable(String),

    #[error("secret store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// A conditional write lost against a concurrent writer
    #[error("check-and-set conflict at {0}")]
    Conflict(String),

    #[error("malformed secret store response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// Errors that abort an entire run before or during platform fan-out
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Nothing can be persisted safely, so no platform is touched
    #[error("secret store unavailable, aborting run: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_kinds() {
        assert_eq!(StepError::Unreachable("x".into()).kind(), "unreachable");
        assert_eq!(
            StepError::Rejected {
                status: 400,
                payload: "bad".into()
            }
            .kind(),
            "rejected"
        );
    }

    #[test]
    fn test_rejected_message_carries_payload() {
        let err = StepError::Rejected {
            status: 422,
            payload: "{\"message\":\"invalid email\"}".into(),
        };
        let message = err.to_string();
        assert!(message.contains("422"));
        assert!(message.contains("invalid email"));
    }

    #[test]
    fn test_store_error_converts_to_step_error() {
        let err: StepError = StoreError::Conflict("service-accounts/gitea".into()).into();
        assert_eq!(err.kind(), "store");
    }
}
