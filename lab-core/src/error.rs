use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("Unknown lab status: {0}")]
    UnknownStatus(String),

    #[error("Invalid transition for lab {lab_id}: {from} -> {to}")]
    InvalidTransition {
        lab_id: String,
        from: String,
        to: String,
    },

    #[error("Service type must not be empty")]
    EmptyServiceType,
}
