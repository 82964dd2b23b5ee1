//! Error types for the update coordinator.

use thiserror::Error;

/// Errors raised by the import pipeline and its phases.
///
/// None of these cross the worker boundary: the pipeline logs them and
/// collapses every one into a single "completed without a record" outcome.
#[derive(Error, Debug)]
pub enum ImportError {
    /// The caller-supplied byte source could not be opened or read.
    #[error("Update source unavailable: {0}")]
    SourceUnavailable(String),

    /// Local copy or archive I/O failed.
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The archive has no entry at the expected path.
    #[error("Entry {entry} not found in {archive}")]
    NotFound { entry: String, archive: String },

    /// Signature or integrity check failed.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// A metadata value was present but could not be parsed.
    #[error("Invalid metadata: {0}")]
    MetadataInvalid(String),

    /// The canonical slot is held by an install in progress.
    #[error("Local update is being installed ({0})")]
    SlotBusy(String),

    /// The import was cancelled before it reached registration.
    #[error("Import cancelled")]
    Cancelled,

    /// The registry refused the finished record.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl ImportError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Errors raised by the update registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No record with this download id.
    #[error("Update not found: {0}")]
    NotFound(String),

    /// Persisting the registry state failed.
    #[error("Failed to persist registry state: {0}")]
    Persist(String),

    /// Loading the registry state failed.
    #[error("Failed to load registry state: {0}")]
    Load(String),

    /// Internal error (lock poisoning and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised when delivering an event to the external subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    /// The subscriber went away.
    #[error("Subscriber disconnected")]
    Disconnected,

    /// The transport rejected the message.
    #[error("Callback transport error: {0}")]
    Transport(String),
}

/// Result type alias for import operations.
pub type Result<T> = std::result::Result<T, ImportError>;
