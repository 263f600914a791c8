//! Error kinds surfaced by the run and session services.

use thiserror::Error;

use crate::pipeline::TransitionError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    /// The external content generator failed; kept apart from approval errors.
    #[error("generation failed: {0:#}")]
    Generation(anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ServiceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Out-of-order or incomplete approvals are caller errors.
impl From<TransitionError> for ServiceError {
    fn from(err: TransitionError) -> Self {
        ServiceError::BadRequest(err.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
