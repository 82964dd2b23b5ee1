//! Package downloads with resume support and verification.
//!
//! Each download runs as its own task. Pausing aborts the task and keeps the
//! partial file; resuming continues it with an HTTP range request. Progress,
//! speed and ETA are published through the registry as `DownloadProgress`
//! events, status transitions as `StatusChanged`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use updater_core::{
    verify_or_discard, PackageVerifier, PersistentStatus, RegistryEventKind, SharedRegistry,
    UpdateRecord, UpdateStatus,
};

use crate::error::ServiceError;

/// Directory of downloaded packages inside the download directory.
pub const DOWNLOADS_DIR: &str = "downloads";

/// Progress is reported at least this often even if the percentage is flat.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Progress sample of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub percent: u8,
    /// Bytes per second since the transfer (re)started
    pub speed: u64,
    /// Seconds left at the current speed
    pub eta_secs: u64,
}

/// Rate limiter and calculator for progress reports.
#[derive(Debug)]
pub struct TransferStats {
    started: Instant,
    start_bytes: u64,
    total: u64,
    last_report: Option<(Instant, u8)>,
}

impl TransferStats {
    pub fn new(started: Instant, start_bytes: u64, total: u64) -> Self {
        Self {
            started,
            start_bytes,
            total,
            last_report: None,
        }
    }

    /// Progress at `now`, or `None` if nothing worth reporting changed.
    pub fn sample(&mut self, now: Instant, downloaded: u64) -> Option<TransferProgress> {
        let percent = if self.total > 0 {
            (downloaded.saturating_mul(100) / self.total).min(100) as u8
        } else {
            0
        };

        if let Some((at, last_percent)) = self.last_report {
            if percent == last_percent && now.duration_since(at) < PROGRESS_INTERVAL {
                return None;
            }
        }
        self.last_report = Some((now, percent));

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let transferred = downloaded.saturating_sub(self.start_bytes);
        let speed = if elapsed > 0.0 {
            (transferred as f64 / elapsed) as u64
        } else {
            0
        };
        let eta_secs = if speed > 0 {
            self.total.saturating_sub(downloaded) / speed
        } else {
            0
        };

        Some(TransferProgress {
            percent,
            speed,
            eta_secs,
        })
    }
}

/// Runs and tracks package downloads.
pub struct DownloadManager {
    registry: SharedRegistry,
    verifier: Arc<dyn PackageVerifier>,
    client: reqwest::Client,
    download_dir: PathBuf,
    active: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DownloadManager {
    pub fn new(
        registry: SharedRegistry,
        verifier: Arc<dyn PackageVerifier>,
        download_dir: PathBuf,
        connect_timeout: Duration,
    ) -> Result<Self> {
        // No overall timeout: packages are large and downloads can be paused.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            registry,
            verifier,
            client,
            download_dir,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Where the package of `download_id` is stored.
    pub fn package_path(&self, download_id: &str) -> PathBuf {
        self.download_dir
            .join(DOWNLOADS_DIR)
            .join(format!("{}.zip", sanitize_file_name(download_id)))
    }

    /// Start (or restart) downloading an update. Idempotent while running.
    pub fn start_download(self: &Arc<Self>, download_id: &str) -> Result<(), ServiceError> {
        let update = self
            .registry
            .get_update(download_id)
            .ok_or_else(|| ServiceError::NotFound(download_id.to_string()))?;

        if update.is_local() || update.download_url.is_empty() {
            return Err(ServiceError::invalid_state(
                download_id,
                update.status,
                "update has no download url",
            ));
        }
        if !matches!(
            update.status,
            UpdateStatus::Unknown
                | UpdateStatus::Paused
                | UpdateStatus::PausedError
                | UpdateStatus::Deleted
                | UpdateStatus::VerificationFailed
        ) {
            return Err(ServiceError::invalid_state(
                download_id,
                update.status,
                "update is already downloaded or in progress",
            ));
        }

        let mut active = self.lock_active();
        active.retain(|_, task| !task.is_finished());
        if active.contains_key(download_id) {
            info!(download_id = %download_id, "Download already running");
            return Ok(());
        }

        let path = self.package_path(download_id);
        self.registry.modify(download_id, RegistryEventKind::StatusChanged, &mut |u| {
            u.status = UpdateStatus::Starting;
            u.persistent_status = PersistentStatus::Incomplete;
            u.file = Some(path.clone());
            u.eta = 0;
            u.speed = 0;
        })?;

        info!(download_id = %download_id, url = %update.download_url, "Starting download");
        let task = tokio::spawn(self.clone().run(update, path));
        active.insert(download_id.to_string(), task);
        Ok(())
    }

    /// Stop a running download, keeping what has been received.
    pub fn pause_download(&self, download_id: &str) -> Result<(), ServiceError> {
        let task = self.lock_active().remove(download_id);
        let Some(task) = task.filter(|t| !t.is_finished()) else {
            let status = self
                .registry
                .get_update(download_id)
                .map(|u| u.status)
                .ok_or_else(|| ServiceError::NotFound(download_id.to_string()))?;
            return Err(ServiceError::invalid_state(
                download_id,
                status,
                "no download running",
            ));
        };

        task.abort();
        self.registry.modify(download_id, RegistryEventKind::StatusChanged, &mut |u| {
            u.status = UpdateStatus::Paused;
            u.eta = 0;
            u.speed = 0;
        })?;
        info!(download_id = %download_id, "Download paused");
        Ok(())
    }

    /// Continue a paused or failed download.
    pub fn resume_download(self: &Arc<Self>, download_id: &str) -> Result<(), ServiceError> {
        let update = self
            .registry
            .get_update(download_id)
            .ok_or_else(|| ServiceError::NotFound(download_id.to_string()))?;
        if !matches!(update.status, UpdateStatus::Paused | UpdateStatus::PausedError) {
            return Err(ServiceError::invalid_state(
                download_id,
                update.status,
                "download is not paused",
            ));
        }
        self.start_download(download_id)
    }

    /// Whether a download task is running for `download_id`.
    pub fn is_downloading(&self, download_id: &str) -> bool {
        self.lock_active()
            .get(download_id)
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[instrument(skip(self, update, path), fields(download_id = %update.download_id))]
    async fn run(self: Arc<Self>, update: UpdateRecord, path: PathBuf) {
        let download_id = update.download_id.clone();

        match self.transfer(&update, &path).await {
            Ok(size) => self.verify(&download_id, &path, size).await,
            Err(e) => {
                error!(error = %e, "Download failed");
                self.set(&download_id, RegistryEventKind::StatusChanged, |u| {
                    u.status = UpdateStatus::PausedError;
                    u.eta = 0;
                    u.speed = 0;
                });
            }
        }
    }

    async fn transfer(&self, update: &UpdateRecord, path: &Path) -> Result<u64> {
        let download_id = update.download_id.as_str();
        let expected = update.file_size;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let existing = fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        if expected > 0 && existing >= expected {
            info!("Package already fully downloaded");
            return Ok(existing);
        }

        let mut request = self.client.get(&update.download_url);
        if existing > 0 {
            info!(existing, total = expected, "Resuming download");
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", existing));
        }

        let response = request.send().await.context("Failed to start download")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Download failed with status {}: {}", status, body);
        }

        let resumed = existing > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        let mut file = if resumed {
            fs::OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .context("Failed to reopen partial download")?
        } else {
            File::create(path).await.context("Failed to create package file")?
        };

        let mut downloaded = if resumed { existing } else { 0 };
        let total = if expected > 0 {
            expected
        } else {
            downloaded + response.content_length().unwrap_or(0)
        };

        self.registry
            .modify(download_id, RegistryEventKind::StatusChanged, &mut |u| {
                u.status = UpdateStatus::Downloading;
            })?;

        let mut stats = TransferStats::new(Instant::now(), downloaded, total);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading response chunk")?;
            file.write_all(&chunk)
                .await
                .context("Failed to write package file")?;
            downloaded += chunk.len() as u64;

            if let Some(progress) = stats.sample(Instant::now(), downloaded) {
                self.registry
                    .modify(download_id, RegistryEventKind::DownloadProgress, &mut |u| {
                        u.progress = progress.percent;
                        u.speed = progress.speed;
                        u.eta = progress.eta_secs;
                    })?;
            }
        }

        file.flush().await.context("Failed to flush package file")?;
        file.sync_all().await.context("Failed to sync package file")?;

        if expected > 0 && downloaded != expected {
            warn!(downloaded, expected, "Downloaded size differs from advertised size");
        }
        info!(bytes = downloaded, "Download complete");
        Ok(downloaded)
    }

    async fn verify(&self, download_id: &str, path: &Path, size: u64) {
        self.set(download_id, RegistryEventKind::StatusChanged, |u| {
            u.status = UpdateStatus::Downloaded;
            u.progress = 100;
            u.eta = 0;
        });
        self.set(download_id, RegistryEventKind::StatusChanged, |u| {
            u.status = UpdateStatus::Verifying;
        });

        let verifier = self.verifier.clone();
        let package = path.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || verify_or_discard(verifier.as_ref(), &package))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        match outcome {
            Ok(()) => {
                info!(download_id = %download_id, "Package verified");
                self.set(download_id, RegistryEventKind::StatusChanged, |u| {
                    u.status = UpdateStatus::Verified;
                    u.persistent_status = PersistentStatus::Verified;
                    u.file_size = size;
                });
            }
            Err(e) => {
                error!(download_id = %download_id, error = %e, "Package verification failed");
                self.set(download_id, RegistryEventKind::StatusChanged, |u| {
                    u.status = UpdateStatus::VerificationFailed;
                    u.persistent_status = PersistentStatus::Unknown;
                    u.file = None;
                    u.progress = 0;
                });
            }
        }
    }

    /// Registry update from a download task; failures are logged.
    fn set(&self, download_id: &str, kind: RegistryEventKind, mut change: impl FnMut(&mut UpdateRecord)) {
        if let Err(e) = self.registry.modify(download_id, kind, &mut change) {
            warn!(download_id = %download_id, error = %e, "Failed to update download state");
        }
    }
}

/// Restrict an id to characters safe in a file name.
fn sanitize_file_name(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
