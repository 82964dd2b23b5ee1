//! Errors surfaced by the public service to the RPC boundary.

use thiserror::Error;

use updater_core::{RegistryError, UpdateStatus};

#[derive(Error, Debug)]
pub enum ServiceError {
    /// No update with this download id.
    #[error("Update not found: {0}")]
    NotFound(String),

    /// The update is not in a state that allows the request.
    #[error("Update {download_id} is {status:?}: {reason}")]
    InvalidState {
        download_id: String,
        status: UpdateStatus,
        reason: &'static str,
    },

    /// Another operation of the same kind is already running.
    #[error("Busy: {0}")]
    Busy(String),

    /// No installation is running.
    #[error("No installation in progress")]
    NotInstalling,

    /// The import source could not be opened.
    #[error("Update source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl ServiceError {
    pub fn invalid_state(download_id: &str, status: UpdateStatus, reason: &'static str) -> Self {
        Self::InvalidState {
            download_id: download_id.to_string(),
            status,
            reason,
        }
    }

    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "not_found",
            ServiceError::InvalidState { .. } => "invalid_state",
            ServiceError::Busy(_) => "busy",
            ServiceError::NotInstalling => "not_installing",
            ServiceError::SourceUnavailable(_) => "source_unavailable",
            ServiceError::Internal(_) => "internal_error",
        }
    }
}
