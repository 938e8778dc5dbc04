use thiserror::Error;
use crate::job::JobStatus;
use crate::storage::StorageError;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced synchronously by the job API.
///
/// Encoder failures never show up here; they are recorded on the job and
/// observed through `status`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} is not complete")]
    NotReady {
        id: String,
        status: JobStatus,
        progress: u8,
        error: Option<String>,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_found(id: &str) -> Self {
        Self::NotFound(id.to_string())
    }
}

impl From<StorageError> for ServiceError {
    /// Client-side upload problems are validation errors; disk problems are not.
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Empty | StorageError::TooLarge { .. } | StorageError::Upload(_) => {
                ServiceError::Validation(err.to_string())
            }
            StorageError::Io { .. } => ServiceError::Storage(err),
        }
    }
}
