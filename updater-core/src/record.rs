//! Update record and status model.
//!
//! An [`UpdateRecord`] carries two status fields:
//!
//! - `status` is the volatile session phase, including transient download and
//!   install detail.
//! - `persistent_status` is the durable checkpoint written to disk and used for
//!   restart recovery.
//!
//! They are always set explicitly. [`UpdateStatus::persistent_checkpoint`] and
//! [`UpdateStatus::restored_from`] are the only sanctioned conversions.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved download id of a locally imported package.
pub const LOCAL_ID: &str = "local";

/// Volatile lifecycle phase of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    #[default]
    Unknown,
    Starting,
    Downloading,
    Downloaded,
    Paused,
    PausedError,
    Deleted,
    Verifying,
    Verified,
    VerificationFailed,
    Installing,
    Installed,
    InstallationFailed,
    InstallationCancelled,
    InstallationSuspended,
}

impl UpdateStatus {
    /// Durable checkpoint for this phase.
    ///
    /// | status                                                   | checkpoint   |
    /// |----------------------------------------------------------|--------------|
    /// | `Unknown`, `Deleted`, `VerificationFailed`               | `Unknown`    |
    /// | `Starting` .. `PausedError`, `Verifying`                 | `Incomplete` |
    /// | `Verified`, `Installing` and every installation outcome  | `Verified`   |
    ///
    /// A package that failed verification has been deleted, so nothing of it
    /// survives a restart.
    pub fn persistent_checkpoint(self) -> PersistentStatus {
        match self {
            UpdateStatus::Unknown
            | UpdateStatus::Deleted
            | UpdateStatus::VerificationFailed => PersistentStatus::Unknown,
            UpdateStatus::Starting
            | UpdateStatus::Downloading
            | UpdateStatus::Downloaded
            | UpdateStatus::Paused
            | UpdateStatus::PausedError
            | UpdateStatus::Verifying => PersistentStatus::Incomplete,
            UpdateStatus::Verified
            | UpdateStatus::Installing
            | UpdateStatus::Installed
            | UpdateStatus::InstallationFailed
            | UpdateStatus::InstallationCancelled
            | UpdateStatus::InstallationSuspended => PersistentStatus::Verified,
        }
    }

    /// Session phase to resume in after a restart.
    ///
    /// An interrupted download comes back paused so it can be resumed; a
    /// verified package is ready to install again.
    pub fn restored_from(persistent: PersistentStatus) -> Self {
        match persistent {
            PersistentStatus::Unknown => UpdateStatus::Unknown,
            PersistentStatus::Incomplete => UpdateStatus::Paused,
            PersistentStatus::Verified => UpdateStatus::Verified,
        }
    }

    /// An installer run owns the record and its package.
    pub fn is_installing(self) -> bool {
        matches!(
            self,
            UpdateStatus::Installing | UpdateStatus::InstallationSuspended
        )
    }

    /// The package file must exist on disk in this phase.
    pub fn requires_file(self) -> bool {
        matches!(
            self,
            UpdateStatus::Verified
                | UpdateStatus::Installing
                | UpdateStatus::Installed
                | UpdateStatus::InstallationFailed
                | UpdateStatus::InstallationCancelled
                | UpdateStatus::InstallationSuspended
        )
    }
}

/// Durable projection of [`UpdateStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistentStatus {
    #[default]
    Unknown = 0,
    Incomplete = 1,
    Verified = 2,
}

impl PersistentStatus {
    /// Numeric code used on the wire.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Parse a wire code. Unrecognised codes map to `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => PersistentStatus::Incomplete,
            2 => PersistentStatus::Verified,
            _ => PersistentStatus::Unknown,
        }
    }
}

/// One update known to the device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateRecord {
    /// Unique identity; [`LOCAL_ID`] for local imports
    pub download_id: String,
    /// Display name
    pub name: String,
    /// Display version
    pub version: String,
    /// Package on disk, `None` until materialized
    pub file: Option<PathBuf>,
    /// Package size in bytes
    pub file_size: u64,
    /// Build time, epoch milliseconds
    pub timestamp: i64,
    /// Remote location, empty for local imports
    pub download_url: String,
    pub status: UpdateStatus,
    pub persistent_status: PersistentStatus,
    /// Download progress, 0-100
    pub progress: u8,
    /// Estimated seconds left in the download
    pub eta: u64,
    /// Download speed, bytes per second
    pub speed: u64,
    /// Install progress, 0-100
    pub install_progress: u8,
    /// Advertised by the remote update feed
    pub available_online: bool,
    /// Install finished writing, activation pending
    pub is_finalizing: bool,
}

impl UpdateRecord {
    /// Create an empty record with the given id.
    pub fn new(download_id: impl Into<String>) -> Self {
        Self {
            download_id: download_id.into(),
            ..Default::default()
        }
    }

    /// Build the record of a verified local import.
    pub fn local(name: &str, file: PathBuf, file_size: u64, timestamp: i64) -> Self {
        Self {
            download_id: LOCAL_ID.to_string(),
            version: local_version(name, timestamp),
            name: name.to_string(),
            file: Some(file),
            file_size,
            timestamp,
            download_url: String::new(),
            status: UpdateStatus::Verified,
            persistent_status: PersistentStatus::Verified,
            available_online: false,
            ..Default::default()
        }
    }

    /// Whether this record came from a local import.
    pub fn is_local(&self) -> bool {
        self.download_id == LOCAL_ID
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Check the file invariant: from `Verified` on, the package must exist
    /// and be non-empty.
    pub fn file_is_consistent(&self) -> bool {
        if !self.status.requires_file() {
            return true;
        }
        match &self.file {
            Some(path) => std::fs::metadata(path)
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Display version of a local import: `"<name> (<build date>)"`.
///
/// The date is rendered in UTC in a medium-length format, e.g. `Nov 14, 2023`.
pub fn local_version(name: &str, timestamp_ms: i64) -> String {
    format!("{} ({})", name, build_date(timestamp_ms))
}

fn build_date(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%b %-d, %Y").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_mapping() {
        assert_eq!(UpdateStatus::Downloading.persistent_checkpoint(), PersistentStatus::Incomplete);
        assert_eq!(UpdateStatus::Paused.persistent_checkpoint(), PersistentStatus::Incomplete);
        assert_eq!(UpdateStatus::Verified.persistent_checkpoint(), PersistentStatus::Verified);
        assert_eq!(UpdateStatus::Installed.persistent_checkpoint(), PersistentStatus::Verified);
        assert_eq!(UpdateStatus::VerificationFailed.persistent_checkpoint(), PersistentStatus::Unknown);
        assert_eq!(UpdateStatus::Deleted.persistent_checkpoint(), PersistentStatus::Unknown);
    }

    #[test]
    fn test_restore_round_trips_checkpoints() {
        for persistent in [
            PersistentStatus::Unknown,
            PersistentStatus::Incomplete,
            PersistentStatus::Verified,
        ] {
            let restored = UpdateStatus::restored_from(persistent);
            assert_eq!(restored.persistent_checkpoint(), persistent);
        }
    }

    #[test]
    fn test_persistent_codes() {
        assert_eq!(PersistentStatus::Verified.code(), 2);
        assert_eq!(PersistentStatus::from_code(1), PersistentStatus::Incomplete);
        assert_eq!(PersistentStatus::from_code(42), PersistentStatus::Unknown);
    }

    #[test]
    fn test_local_record() {
        let record = UpdateRecord::local(
            "Local update",
            PathBuf::from("/data/updates/localUpdate.zip"),
            1024,
            1_700_000_000_000,
        );

        assert!(record.is_local());
        assert_eq!(record.status, UpdateStatus::Verified);
        assert_eq!(record.persistent_status, PersistentStatus::Verified);
        assert_eq!(record.version, "Local update (Nov 14, 2023)");
        assert!(record.download_url.is_empty());
        assert!(!record.available_online);
    }

    #[test]
    fn test_file_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");

        let mut record = UpdateRecord::local("Local update", path.clone(), 3, 0);
        assert!(!record.file_is_consistent());

        std::fs::write(&path, b"zip").unwrap();
        assert!(record.file_is_consistent());

        record.status = UpdateStatus::Downloading;
        record.file = None;
        assert!(record.file_is_consistent());
    }
}
