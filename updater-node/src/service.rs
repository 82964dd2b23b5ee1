//! Public updater service.
//!
//! This is the contract the RPC boundary talks to. Every mutating call
//! returns as soon as the work is accepted; results reach the subscriber
//! registered with [`UpdaterPublicService::set_callback`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::fs::File;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use updater_core::{
    CallbackSlot, SharedRegistry, UpdateImporter, UpdateItemInfo, UpdaterCallback,
};

use crate::checker::UpdateChecker;
use crate::downloader::DownloadManager;
use crate::error::ServiceError;
use crate::installer::Installer;

/// Updater service implementation.
pub struct UpdaterPublicService {
    registry: SharedRegistry,
    callbacks: Arc<CallbackSlot>,
    importer: UpdateImporter,
    downloads: Arc<DownloadManager>,
    checker: Arc<UpdateChecker>,
    installer: Arc<dyn Installer>,
    check_task: Mutex<Option<JoinHandle<()>>>,
}

impl UpdaterPublicService {
    pub fn new(
        registry: SharedRegistry,
        callbacks: Arc<CallbackSlot>,
        importer: UpdateImporter,
        downloads: Arc<DownloadManager>,
        checker: Arc<UpdateChecker>,
        installer: Arc<dyn Installer>,
    ) -> Self {
        Self {
            registry,
            callbacks,
            importer,
            downloads,
            checker,
            installer,
            check_task: Mutex::new(None),
        }
    }

    /// Register the subscriber. Replaces any previous one.
    pub fn set_callback(&self, subscriber: Arc<dyn UpdaterCallback>) {
        info!("Update callback registered");
        self.callbacks.set(subscriber);
    }

    /// Fetch the update list in the background.
    ///
    /// The subscriber gets `on_update_check_completed` with whether new
    /// builds were found, or `false` when the check failed.
    pub fn check_for_updates(&self) -> Result<(), ServiceError> {
        let mut task = self.check_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return Err(ServiceError::Busy("update check in progress".to_string()));
        }

        let checker = self.checker.clone();
        let callbacks = self.callbacks.clone();
        *task = Some(tokio::spawn(async move {
            let new_updates = match checker.check().await {
                Ok(new_updates) => new_updates,
                Err(e) => {
                    warn!(error = %e, "Update check failed");
                    false
                }
            };
            callbacks.deliver("update_check_completed", |cb| {
                cb.on_update_check_completed(new_updates)
            });
        }));
        Ok(())
    }

    /// All known updates, newest first.
    pub fn list_available_updates(&self) -> Vec<UpdateItemInfo> {
        self.registry
            .updates()
            .iter()
            .map(UpdateItemInfo::from)
            .collect()
    }

    #[instrument(skip(self))]
    pub fn download_update(&self, download_id: &str) -> Result<(), ServiceError> {
        self.downloads.start_download(download_id)
    }

    #[instrument(skip(self))]
    pub fn pause_download(&self, download_id: &str) -> Result<(), ServiceError> {
        self.downloads.pause_download(download_id)
    }

    #[instrument(skip(self))]
    pub fn resume_download(&self, download_id: &str) -> Result<(), ServiceError> {
        self.downloads.resume_download(download_id)
    }

    #[instrument(skip(self))]
    pub async fn install_update(&self, download_id: &str) -> Result<(), ServiceError> {
        self.installer.trigger_install(download_id).await
    }

    pub async fn cancel_update(&self) -> Result<(), ServiceError> {
        self.installer.cancel().await
    }

    pub async fn suspend_update(&self) -> Result<(), ServiceError> {
        self.installer.suspend().await
    }

    pub async fn resume_update(&self) -> Result<(), ServiceError> {
        self.installer.resume().await
    }

    /// Import the package at `path`.
    ///
    /// Fails only if the file cannot be opened; everything after that is
    /// reported through `on_import_started` / `on_import_completed`.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn import_update(&self, path: &Path) -> Result<(), ServiceError> {
        let source = File::open(path).await.map_err(|e| {
            warn!(error = %e, "Cannot open update package");
            ServiceError::SourceUnavailable(format!("{}: {}", path.display(), e))
        })?;

        if !self.importer.begin_import(Box::new(source)) {
            return Err(ServiceError::Internal("import could not be started".to_string()));
        }
        Ok(())
    }

    /// Cancel the local import in flight. Returns whether one was running.
    pub fn cancel_import(&self) -> bool {
        self.importer.cancel_import()
    }

    /// Whether a local import is still running.
    pub fn is_importing(&self) -> bool {
        self.importer.is_importing()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use updater_core::{
        ImportError, ImporterConfig, InMemoryRegistry, PackageVerifier, UpdateRecord,
        UpdateRegistry,
    };

    use crate::callback::{CallbackFrame, ChannelSubscriber};
    use crate::installer::CommandInstaller;

    struct RejectAll;

    impl PackageVerifier for RejectAll {
        fn verify(&self, _path: &Path) -> updater_core::Result<()> {
            Err(ImportError::VerificationFailed("rejected".to_string()))
        }
    }

    /// Service wired against an unreachable update server and a rejecting verifier.
    pub(crate) fn test_service(
        dir: &Path,
        registry: Arc<InMemoryRegistry>,
    ) -> UpdaterPublicService {
        let callbacks = Arc::new(CallbackSlot::new());
        let verifier: Arc<dyn PackageVerifier> = Arc::new(RejectAll);
        let importer = UpdateImporter::new(
            ImporterConfig {
                download_dir: dir.to_path_buf(),
                ..Default::default()
            },
            verifier.clone(),
            registry.clone(),
            callbacks.clone(),
        );
        let downloads = Arc::new(
            DownloadManager::new(
                registry.clone(),
                verifier,
                dir.to_path_buf(),
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let checker = Arc::new(
            UpdateChecker::new(
                registry.clone(),
                "http://127.0.0.1:9/updates.json".to_string(),
                dir,
                Duration::from_secs(1),
                Duration::from_secs(2),
            )
            .unwrap(),
        );
        let installer = Arc::new(CommandInstaller::new(
            registry.clone(),
            vec!["/bin/true".to_string()],
        ));
        UpdaterPublicService::new(registry, callbacks, importer, downloads, checker, installer)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<CallbackFrame>) -> CallbackFrame {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("callback channel closed")
    }

    #[tokio::test]
    async fn test_list_available_updates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .add_update(UpdateRecord {
                download_id: "older".to_string(),
                timestamp: 1_000,
                available_online: true,
                ..Default::default()
            })
            .unwrap();
        registry
            .add_update(UpdateRecord {
                download_id: "newer".to_string(),
                timestamp: 2_000,
                available_online: true,
                ..Default::default()
            })
            .unwrap();

        let service = test_service(dir.path(), registry);
        let ids: Vec<_> = service
            .list_available_updates()
            .into_iter()
            .map(|u| u.download_id)
            .collect();
        assert_eq!(ids, vec!["newer".to_string(), "older".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_check_reports_no_updates() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), Arc::new(InMemoryRegistry::new()));
        let (subscriber, mut rx) = ChannelSubscriber::new();
        service.set_callback(Arc::new(subscriber));

        service.check_for_updates().unwrap();
        assert_eq!(
            next(&mut rx).await,
            CallbackFrame::UpdateCheckCompleted { new_updates: false }
        );
    }

    #[tokio::test]
    async fn test_import_missing_file_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), Arc::new(InMemoryRegistry::new()));

        let err = service
            .import_update(&dir.path().join("missing.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SourceUnavailable(_)));
        assert!(!service.is_importing());
    }

    #[tokio::test]
    async fn test_rejected_import_completes_without_update() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let service = test_service(dir.path(), registry.clone());
        let (subscriber, mut rx) = ChannelSubscriber::new();
        service.set_callback(Arc::new(subscriber));

        let package = dir.path().join("package.zip");
        std::fs::write(&package, b"not really a package").unwrap();
        service.import_update(&package).await.unwrap();

        assert_eq!(next(&mut rx).await, CallbackFrame::ImportStarted);
        assert_eq!(
            next(&mut rx).await,
            CallbackFrame::ImportCompleted { update: None }
        );
        assert!(registry.get_update(updater_core::LOCAL_ID).is_none());
    }

    #[tokio::test]
    async fn test_unknown_update_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), Arc::new(InMemoryRegistry::new()));

        assert!(matches!(
            service.download_update("nope"),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            service.install_update("nope").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            service.cancel_update().await,
            Err(ServiceError::NotInstalling)
        ));
    }
}
