use thiserror::Error;

use netplug_core::{ResourceError, StateError};

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is still in use")]
    InUse(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

pub type Result<T> = std::result::Result<T, MasterError>;
