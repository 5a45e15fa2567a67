use thiserror::Error;

pub type DripResult<T> = Result<T, DripError>;

#[derive(Error, Debug)]
pub enum DripError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid enrollment transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Contact {contact_id} is already enrolled in campaign {campaign_id}")]
    DuplicateEnrollment {
        campaign_id: uuid::Uuid,
        contact_id: String,
    },

    #[error("Insufficient credit balance: requested {requested:.2}, available {available:.2}")]
    InsufficientBalance { requested: f64, available: f64 },

    #[error("Transient send failure: {0}")]
    TransientSend(String),

    #[error("Permanent send failure: {0}")]
    PermanentSend(String),

    #[error("Concurrency conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
