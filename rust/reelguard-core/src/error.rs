use crate::identifiers::ValidationError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    /// Secure storage could not be created. Fatal to the owning component.
    #[error("guard: storage unavailable - {0}")]
    StorageInit(String),

    #[error("guard: storage error - {0}")]
    Storage(StoreError),

    #[error("guard: {0}")]
    Validation(#[from] ValidationError),

    #[error("guard: invalid configuration - {0}")]
    InvalidConfig(String),

    #[error("guard: already running")]
    AlreadyRunning,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<StoreError> for GuardError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Init(reason) => GuardError::StorageInit(reason),
            other => GuardError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
