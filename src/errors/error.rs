use thiserror::Error;
use uuid::Uuid;

use crate::domains::mutation::types::SyncStatus;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Record not found: {0} with ID {1}")]
    NotFound(String, String),

    #[error("Conflict error: {0}")]
    Conflict(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(String),
}

/// Domain-level errors
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Illegal sync status transition for mutation {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: Uuid,
        from: SyncStatus,
        to: SyncStatus,
    },

    #[error("Entity not found: {0} with ID {1}")]
    EntityNotFound(String, Uuid),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Delivery errors on the path to the remote store. These mark a single
/// mutation as failed or retryable; they never abort a worker batch.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Media file missing: {0}")]
    MediaMissing(String),

    #[error("Media upload failed: {0}")]
    Upload(String),

    #[error("Sync error: {0}")]
    Other(String),
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' contains invalid format: {reason}")]
    Format { field: String, reason: String },

    #[error("Field '{field}' contains an invalid value: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Entity is invalid: {0}")]
    Entity(String),

    #[error("Validation error: {0}")]
    Custom(String),
}

impl ValidationError {
    pub fn required(field: &str) -> Self {
        Self::Required {
            field: field.to_string(),
        }
    }

    pub fn format(field: &str, reason: &str) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn entity(message: &str) -> Self {
        Self::Entity(message.to_string())
    }

    pub fn custom(message: &str) -> Self {
        Self::Custom(message.to_string())
    }
}
