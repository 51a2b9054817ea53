use thiserror::Error;

/// Metal Bank runtime errors.
#[derive(Debug, Error)]
pub enum BankError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("remote service '{service}' unavailable: {message}")]
    RemoteUnavailable { service: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BankError {
    pub fn remote(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable { .. })
    }
}
