//! External wire shape of an update.
//!
//! Subscribers on the other side of the RPC boundary never see
//! [`UpdateRecord`] directly. They receive [`UpdateItemInfo`] snapshots, which
//! drop the local file path and carry the status as [`UpdateItemStatus`].

use serde::{Deserialize, Serialize};

use crate::record::{PersistentStatus, UpdateRecord, UpdateStatus};

/// Status as published to external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateItemStatus {
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

impl From<UpdateStatus> for UpdateItemStatus {
    fn from(status: UpdateStatus) -> Self {
        match status {
            UpdateStatus::Unknown => UpdateItemStatus::Unknown,
            UpdateStatus::Starting => UpdateItemStatus::Starting,
            UpdateStatus::Downloading => UpdateItemStatus::Downloading,
            UpdateStatus::Downloaded => UpdateItemStatus::Downloaded,
            UpdateStatus::Paused => UpdateItemStatus::Paused,
            UpdateStatus::PausedError => UpdateItemStatus::PausedError,
            UpdateStatus::Deleted => UpdateItemStatus::Deleted,
            UpdateStatus::Verifying => UpdateItemStatus::Verifying,
            UpdateStatus::Verified => UpdateItemStatus::Verified,
            UpdateStatus::VerificationFailed => UpdateItemStatus::VerificationFailed,
            UpdateStatus::Installing => UpdateItemStatus::Installing,
            UpdateStatus::Installed => UpdateItemStatus::Installed,
            UpdateStatus::InstallationFailed => UpdateItemStatus::InstallationFailed,
            UpdateStatus::InstallationCancelled => UpdateItemStatus::InstallationCancelled,
            UpdateStatus::InstallationSuspended => UpdateItemStatus::InstallationSuspended,
        }
    }
}

impl From<UpdateItemStatus> for UpdateStatus {
    fn from(status: UpdateItemStatus) -> Self {
        match status {
            UpdateItemStatus::Unknown => UpdateStatus::Unknown,
            UpdateItemStatus::Starting => UpdateStatus::Starting,
            UpdateItemStatus::Downloading => UpdateStatus::Downloading,
            UpdateItemStatus::Downloaded => UpdateStatus::Downloaded,
            UpdateItemStatus::Paused => UpdateStatus::Paused,
            UpdateItemStatus::PausedError => UpdateStatus::PausedError,
            UpdateItemStatus::Deleted => UpdateStatus::Deleted,
            UpdateItemStatus::Verifying => UpdateStatus::Verifying,
            UpdateItemStatus::Verified => UpdateStatus::Verified,
            UpdateItemStatus::VerificationFailed => UpdateStatus::VerificationFailed,
            UpdateItemStatus::Installing => UpdateStatus::Installing,
            UpdateItemStatus::Installed => UpdateStatus::Installed,
            UpdateItemStatus::InstallationFailed => UpdateStatus::InstallationFailed,
            UpdateItemStatus::InstallationCancelled => UpdateStatus::InstallationCancelled,
            UpdateItemStatus::InstallationSuspended => UpdateStatus::InstallationSuspended,
        }
    }
}

/// Snapshot of one update as seen by external callers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItemInfo {
    pub name: String,
    pub download_url: String,
    pub download_id: String,
    pub timestamp: i64,
    pub version: String,
    pub file_size: u64,
    pub status: UpdateItemStatus,
    /// [`PersistentStatus`] code
    pub persistent_status: i32,
    pub progress: u8,
    pub eta: u64,
    pub speed: u64,
    pub install_progress: u8,
    pub available_online: bool,
    pub finalizing: bool,
}

impl From<&UpdateRecord> for UpdateItemInfo {
    fn from(update: &UpdateRecord) -> Self {
        Self {
            name: update.name.clone(),
            download_url: update.download_url.clone(),
            download_id: update.download_id.clone(),
            timestamp: update.timestamp,
            version: update.version.clone(),
            file_size: update.file_size,
            status: update.status.into(),
            persistent_status: update.persistent_status.code(),
            progress: update.progress,
            eta: update.eta,
            speed: update.speed,
            install_progress: update.install_progress,
            available_online: update.available_online,
            finalizing: update.is_finalizing,
        }
    }
}

impl From<&UpdateItemInfo> for UpdateRecord {
    /// The file path is not part of the wire shape, so the record comes back
    /// unmaterialized.
    fn from(info: &UpdateItemInfo) -> Self {
        Self {
            download_id: info.download_id.clone(),
            name: info.name.clone(),
            version: info.version.clone(),
            file: None,
            file_size: info.file_size,
            timestamp: info.timestamp,
            download_url: info.download_url.clone(),
            status: info.status.into(),
            persistent_status: PersistentStatus::from_code(info.persistent_status),
            progress: info.progress,
            eta: info.eta,
            speed: info.speed,
            install_progress: info.install_progress,
            available_online: info.available_online,
            is_finalizing: info.finalizing,
        }
    }
}
