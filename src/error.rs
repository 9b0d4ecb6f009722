//! Error taxonomy for the admission queue and its collaborators.

use crate::process::Application;
use crate::scheduler::ResourceClass;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// No valid session for the user when the request was admitted, or the
    /// session was destroyed while the request was being bound to it.
    #[error("session expired for user {0}")]
    SessionExpired(String),

    #[error("failed to acquire {application} for user {user_id}: {reason}")]
    ResourceAcquisition {
        application: Application,
        user_id: String,
        reason: String,
    },

    #[error("no operation {operation:?} registered for resource class {resource_class}")]
    UnknownOperation {
        resource_class: ResourceClass,
        operation: String,
    },

    /// The operation body returned an error. Carried through untouched.
    #[error(transparent)]
    Operation(anyhow::Error),

    #[error("operation {0} panicked")]
    OperationPanicked(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("workspace io error: {0}")]
    Workspace(#[from] std::io::Error),
}

impl QueueError {
    /// Unwrap a body error, passing queue errors raised inside the body
    /// (resource acquisition, expired session) through unchanged.
    pub(crate) fn from_operation(err: anyhow::Error) -> Self {
        match err.downcast::<QueueError>() {
            Ok(queue_err) => queue_err,
            Err(other) => QueueError::Operation(other),
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, QueueError::SessionExpired(_))
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
