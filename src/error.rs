use thiserror::Error;

use crate::{
    config::ConfigError,
    storage::{CursorError, StorageError},
};

/// A usage event rejected by `log()` before reaching the buffer.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid usage event: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

impl ValidationError {
    /// Names of the fields that failed validation.
    pub fn fields(&self) -> Vec<String> {
        match self {
            Self::Invalid(errors) => errors
                .field_errors()
                .keys()
                .map(|field| field.to_string())
                .collect(),
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields().iter().any(|f| f == field)
    }
}

/// Errors surfaced by the client facade.
///
/// Ingestion failures never appear here: a failing backend shows up as
/// growing `queue_size`/`dropped_count` in the stats instead.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(#[source] CursorError),

    #[error("Backend request failed: {0}")]
    BackendUnavailable(#[source] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Client is closed")]
    Closed,
}

impl From<StorageError> for UsageError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidCursor(e) => Self::InvalidCursor(e),
            other => Self::BackendUnavailable(other),
        }
    }
}

pub type UsageResult<T> = Result<T, UsageError>;
