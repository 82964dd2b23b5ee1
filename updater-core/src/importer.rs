//! Local package import pipeline.
//!
//! An import runs as a background task through a fixed sequence of phases:
//!
//! ```text
//! RECEIVING ──► VERIFYING ──► METADATA ──► REGISTERED
//!     │             │             │
//!     └─────────────┴─────────────┴──► FAILED
//! ```
//!
//! Each attempt streams into its own working file under
//! `<download-dir>/imports/`. Only the most recent attempt may promote its
//! verified file into the canonical slot `<download-dir>/localUpdate.zip`;
//! promotion happens under the slot lock after a final cancellation check.
//! While the previous local update is being installed the slot stays
//! untouched and new attempts fail. Whatever happens, exactly one `on_import_completed` callback is delivered
//! per accepted `begin_import`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ImportError, RegistryError, Result};
use crate::metadata::read_build_timestamp;
use crate::record::{UpdateRecord, LOCAL_ID};
use crate::registry::UpdateRegistry;
use crate::verifier::{verify_or_discard, PackageVerifier};

/// File name of the canonical import slot inside the download directory.
pub const LOCAL_PACKAGE_NAME: &str = "localUpdate.zip";

/// Directory of per-attempt working files inside the download directory.
pub const IMPORTS_DIR: &str = "imports";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on how long a blocked source read delays a cancellation.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Caller-supplied package bytes.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Phases of one import attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Receiving,
    Verifying,
    Metadata,
    Registered,
    Failed,
}

/// Completion notifications of the import pipeline.
pub trait ImportCallbacks: Send + Sync {
    /// Called synchronously from `begin_import` before the worker starts.
    fn on_import_started(&self);

    /// Called once per accepted import, from the worker.
    fn on_import_completed(&self, update: Option<UpdateRecord>);
}

/// Cooperative cancellation flag shared with one import worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ImportError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Import pipeline settings.
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Directory holding the canonical slot and the working files
    pub download_dir: PathBuf,
    /// Display name of imported updates
    pub local_update_name: String,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("/var/lib/updater/updates"),
            local_update_name: "Local update".to_string(),
        }
    }
}

impl ImporterConfig {
    /// Canonical location of the imported package.
    pub fn local_package_path(&self) -> PathBuf {
        self.download_dir.join(LOCAL_PACKAGE_NAME)
    }

    pub fn imports_dir(&self) -> PathBuf {
        self.download_dir.join(IMPORTS_DIR)
    }
}

struct ImportHandle {
    import_id: Uuid,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

/// State shared by the importer and its workers.
struct Shared {
    config: ImporterConfig,
    verifier: Arc<dyn PackageVerifier>,
    registry: Arc<dyn UpdateRegistry>,
    callbacks: Arc<dyn ImportCallbacks>,
    /// Serializes every change to the canonical slot
    slot: tokio::sync::Mutex<()>,
}

/// Runs local imports, one live attempt at a time.
pub struct UpdateImporter {
    shared: Arc<Shared>,
    current: Mutex<Option<ImportHandle>>,
}

impl UpdateImporter {
    pub fn new(
        config: ImporterConfig,
        verifier: Arc<dyn PackageVerifier>,
        registry: Arc<dyn UpdateRegistry>,
        callbacks: Arc<dyn ImportCallbacks>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                verifier,
                registry,
                callbacks,
                slot: tokio::sync::Mutex::new(()),
            }),
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ImporterConfig {
        &self.shared.config
    }

    /// Start importing `source` in the background.
    ///
    /// Returns immediately. Any import still in flight is cancelled first.
    /// Returns `false` without any callback when no tokio runtime is
    /// available to run the worker.
    pub fn begin_import(&self, source: ByteSource) -> bool {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "Cannot start import outside of a tokio runtime");
                return false;
            }
        };

        let mut current = self.lock_current();
        if let Some(previous) = current.take() {
            info!(import_id = %previous.import_id, "Cancelling previous import");
            previous.cancel.cancel();
        }

        let job = ImportJob {
            import_id: Uuid::new_v4(),
            cancel: CancelToken::new(),
            working_file: self
                .shared
                .config
                .imports_dir()
                .join(format!("{}.zip", Uuid::new_v4())),
        };
        info!(
            import_id = %job.import_id,
            working_file = %job.working_file.display(),
            "Starting update import"
        );

        self.shared.callbacks.on_import_started();

        let handle = ImportHandle {
            import_id: job.import_id,
            cancel: job.cancel.clone(),
            task: runtime.spawn(job.run(self.shared.clone(), source)),
        };
        *current = Some(handle);
        true
    }

    /// Request cancellation of the import in flight, if any. Returns whether
    /// a running worker was asked to stop.
    ///
    /// Cancellation is cooperative: the worker stops at its next check and
    /// still reports `on_import_completed(None)`. An import that has already
    /// passed its final check registers normally.
    pub fn cancel_import(&self) -> bool {
        match self.lock_current().as_ref() {
            Some(handle) if !handle.task.is_finished() => {
                info!(import_id = %handle.import_id, "Cancelling import");
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Whether an import worker is still running. Stays `true` after a
    /// cancellation until the worker has delivered its completion.
    pub fn is_importing(&self) -> bool {
        self.lock_current()
            .as_ref()
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    /// Remove working files left behind by a previous process.
    pub fn purge_stale_imports(&self) -> Result<usize> {
        let dir = self.shared.config.imports_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(ImportError::io(
                    format!("Failed to list {}", dir.display()),
                    e,
                ))
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale import"),
            }
        }
        if removed > 0 {
            info!(count = removed, "Removed stale import working files");
        }
        Ok(removed)
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<ImportHandle>> {
        // The guarded value is a plain handle, so a poisoned lock is still usable.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for UpdateImporter {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_current().take() {
            handle.cancel.cancel();
        }
    }
}

/// One import attempt.
struct ImportJob {
    import_id: Uuid,
    cancel: CancelToken,
    working_file: PathBuf,
}

impl ImportJob {
    async fn run(self, shared: Arc<Shared>, source: ByteSource) {
        let update = match self.execute(&shared, source).await {
            Ok(update) => {
                self.log_phase(ImportPhase::Registered);
                info!(
                    import_id = %self.import_id,
                    version = %update.version,
                    timestamp = update.timestamp,
                    size = update.file_size,
                    "Update import completed"
                );
                Some(update)
            }
            Err(ImportError::Cancelled) => {
                self.log_phase(ImportPhase::Failed);
                info!(import_id = %self.import_id, "Update import cancelled");
                None
            }
            Err(e) => {
                self.log_phase(ImportPhase::Failed);
                error!(import_id = %self.import_id, error = %e, "Failed to import update package");
                None
            }
        };

        if update.is_none() {
            remove_if_exists(&self.working_file).await;
        }
        shared.callbacks.on_import_completed(update);
    }

    async fn execute(&self, shared: &Shared, source: ByteSource) -> Result<UpdateRecord> {
        self.enter(ImportPhase::Receiving)?;
        clear_slot(shared, &self.cancel).await?;
        let file_size = self.receive(source).await?;

        self.enter(ImportPhase::Verifying)?;
        let verifier = shared.verifier.clone();
        let path = self.working_file.clone();
        tokio::task::spawn_blocking(move || verify_or_discard(verifier.as_ref(), &path))
            .await
            .map_err(worker_failed)??;

        self.enter(ImportPhase::Metadata)?;
        let path = self.working_file.clone();
        let now_ms = Utc::now().timestamp_millis();
        let timestamp = tokio::task::spawn_blocking(move || read_build_timestamp(&path, now_ms))
            .await
            .map_err(worker_failed)?;

        let _slot = shared.slot.lock().await;
        self.cancel.check()?;

        let canonical = shared.config.local_package_path();
        fs::rename(&self.working_file, &canonical)
            .await
            .map_err(|e| ImportError::io(format!("Failed to move package to {}", canonical.display()), e))?;

        let update = UpdateRecord::local(
            &shared.config.local_update_name,
            canonical.clone(),
            file_size,
            timestamp.millis,
        );
        if let Err(e) = shared.registry.add_update(update.clone()) {
            remove_if_exists(&canonical).await;
            return Err(e.into());
        }
        Ok(update)
    }

    /// Stream the source into the working file and make it world-readable.
    async fn receive(&self, mut source: ByteSource) -> Result<u64> {
        if let Some(dir) = self.working_file.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| ImportError::io(format!("Failed to create {}", dir.display()), e))?;
        }

        let mut out = fs::File::create(&self.working_file)
            .await
            .map_err(|e| ImportError::io("Failed to create working file", e))?;

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            self.cancel.check()?;
            let n = match tokio::time::timeout(READ_POLL_INTERVAL, source.read(&mut buffer)).await {
                Err(_) => continue,
                Ok(read) => read.map_err(|e| ImportError::SourceUnavailable(e.to_string()))?,
            };
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])
                .await
                .map_err(|e| ImportError::io("Failed to write working file", e))?;
            copied += n as u64;
        }

        out.flush()
            .await
            .map_err(|e| ImportError::io("Failed to flush working file", e))?;
        out.sync_all()
            .await
            .map_err(|e| ImportError::io("Failed to sync working file", e))?;
        drop(out);

        make_world_readable(&self.working_file).await?;
        debug!(import_id = %self.import_id, bytes = copied, "Package received");
        Ok(copied)
    }

    /// Log the phase change, refusing to start a phase once cancelled.
    fn enter(&self, phase: ImportPhase) -> Result<()> {
        self.cancel.check()?;
        self.log_phase(phase);
        Ok(())
    }

    fn log_phase(&self, phase: ImportPhase) {
        debug!(import_id = %self.import_id, phase = ?phase, "Import phase");
    }
}

/// Delete the canonical package and the record that points at it.
///
/// Fails without touching either while the installer owns them.
async fn clear_slot(shared: &Shared, cancel: &CancelToken) -> Result<()> {
    let _slot = shared.slot.lock().await;
    cancel.check()?;

    if let Some(previous) = shared.registry.get_update(LOCAL_ID) {
        if previous.status.is_installing() {
            warn!(status = ?previous.status, "Local update is being installed, refusing import");
            return Err(ImportError::SlotBusy(format!("{:?}", previous.status)));
        }
    }

    let canonical = shared.config.local_package_path();
    remove_if_exists(&canonical).await;
    match shared.registry.remove_update(LOCAL_ID) {
        Ok(_) | Err(RegistryError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
async fn make_world_readable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
        .await
        .map_err(|e| ImportError::io("Failed to relax package permissions", e))
}

#[cfg(not(unix))]
async fn make_world_readable(_path: &Path) -> Result<()> {
    Ok(())
}

async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed package file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove package file"),
    }
}

fn worker_failed(e: tokio::task::JoinError) -> ImportError {
    ImportError::io(
        "Import worker failed",
        io::Error::new(io::ErrorKind::Other, e.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PersistentStatus, UpdateStatus};
    use crate::registry::{InMemoryRegistry, RegistryEventKind};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct AcceptAll;

    impl PackageVerifier for AcceptAll {
        fn verify(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct RejectAll;

    impl PackageVerifier for RejectAll {
        fn verify(&self, _path: &Path) -> Result<()> {
            Err(ImportError::VerificationFailed("rejected".to_string()))
        }
    }

    struct Recorder {
        started: AtomicUsize,
        completed: mpsc::UnboundedSender<Option<UpdateRecord>>,
    }

    impl ImportCallbacks for Recorder {
        fn on_import_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_import_completed(&self, update: Option<UpdateRecord>) {
            let _ = self.completed.send(update);
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        importer: UpdateImporter,
        registry: Arc<InMemoryRegistry>,
        recorder: Arc<Recorder>,
        completed: mpsc::UnboundedReceiver<Option<UpdateRecord>>,
    }

    fn fixture(verifier: Arc<dyn PackageVerifier>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let (tx, completed) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            started: AtomicUsize::new(0),
            completed: tx,
        });
        let config = ImporterConfig {
            download_dir: dir.path().to_path_buf(),
            local_update_name: "Local update".to_string(),
        };
        let importer = UpdateImporter::new(config, verifier, registry.clone(), recorder.clone());
        Fixture {
            _dir: dir,
            importer,
            registry,
            recorder,
            completed,
        }
    }

    fn bytes(data: &'static [u8]) -> ByteSource {
        Box::new(data)
    }

    #[tokio::test]
    async fn test_accepted_import_registers_local_record() {
        let mut fx = fixture(Arc::new(AcceptAll));
        assert!(fx.importer.begin_import(bytes(b"package bytes")));
        assert_eq!(fx.recorder.started.load(Ordering::SeqCst), 1);

        let update = fx.completed.recv().await.unwrap().unwrap();
        assert_eq!(update.download_id, LOCAL_ID);
        assert_eq!(update.status, UpdateStatus::Verified);
        assert_eq!(update.persistent_status, PersistentStatus::Verified);
        assert_eq!(update.file_size, 13);

        let canonical = fx.importer.config().local_package_path();
        assert_eq!(update.file.as_deref(), Some(canonical.as_path()));
        assert!(canonical.exists());
        assert_eq!(fx.registry.get_update(LOCAL_ID).unwrap(), update);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_imported_package_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let mut fx = fixture(Arc::new(AcceptAll));
        fx.importer.begin_import(bytes(b"package bytes"));
        fx.completed.recv().await.unwrap().unwrap();

        let mode = std::fs::metadata(fx.importer.config().local_package_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o444, 0o444);
    }

    #[tokio::test]
    async fn test_rejected_import_leaves_nothing() {
        let mut fx = fixture(Arc::new(RejectAll));
        fx.importer.begin_import(bytes(b"package bytes"));

        assert!(fx.completed.recv().await.unwrap().is_none());
        assert!(fx.registry.get_update(LOCAL_ID).is_none());
        assert!(!fx.importer.config().local_package_path().exists());
        assert_eq!(fx.importer.purge_stale_imports().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_receiving() {
        let mut fx = fixture(Arc::new(AcceptAll));
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(b"partial").await.unwrap();

        fx.importer.begin_import(Box::new(reader));
        assert!(fx.importer.is_importing());
        assert!(fx.importer.cancel_import());

        assert!(fx.completed.recv().await.unwrap().is_none());
        assert!(fx.registry.get_update(LOCAL_ID).is_none());
        assert!(!fx.importer.config().local_package_path().exists());
        assert_eq!(fx.importer.purge_stale_imports().unwrap(), 0);
        drop(writer);
    }

    #[tokio::test]
    async fn test_new_import_supersedes_running_one() {
        let mut fx = fixture(Arc::new(AcceptAll));
        let (_writer, reader) = tokio::io::duplex(1024);

        fx.importer.begin_import(Box::new(reader));
        fx.importer.begin_import(bytes(b"second package"));

        let mut outcomes = vec![
            fx.completed.recv().await.unwrap(),
            fx.completed.recv().await.unwrap(),
        ];
        outcomes.sort_by_key(|o| o.is_some());
        assert!(outcomes[0].is_none());
        assert_eq!(outcomes[1].as_ref().unwrap().file_size, 14);
        assert_eq!(fx.recorder.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_still_importing_until_cancelled_worker_finishes() {
        let mut fx = fixture(Arc::new(AcceptAll));
        let (_writer, reader) = tokio::io::duplex(1024);

        fx.importer.begin_import(Box::new(reader));
        assert!(fx.importer.cancel_import());
        // The worker has not observed the cancellation yet.
        assert!(fx.importer.is_importing());
        assert!(fx.importer.cancel_import());

        assert!(fx.completed.recv().await.unwrap().is_none());
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.importer.is_importing() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker kept running after completion");
        assert!(!fx.importer.cancel_import());
    }

    #[tokio::test]
    async fn test_replacing_local_update_announces_deletion() {
        let mut fx = fixture(Arc::new(AcceptAll));
        fx.importer.begin_import(bytes(b"first package"));
        fx.completed.recv().await.unwrap().unwrap();

        let mut events = fx.registry.subscribe();
        fx.importer.begin_import(bytes(b"second package"));
        let second = fx.completed.recv().await.unwrap().unwrap();
        assert_eq!(second.file_size, 14);

        let removal = events.try_recv().unwrap();
        assert_eq!(removal.download_id, LOCAL_ID);
        let last = removal.removed.unwrap();
        assert_eq!(last.status, UpdateStatus::Deleted);
        assert_eq!(last.file_size, 13);

        let registered = events.try_recv().unwrap();
        assert_eq!(registered.download_id, LOCAL_ID);
        assert!(registered.removed.is_none());
        assert!(registered.sequence > removal.sequence);
    }

    #[tokio::test]
    async fn test_import_refused_while_local_update_installs() {
        for installing in [UpdateStatus::Installing, UpdateStatus::InstallationSuspended] {
            let mut fx = fixture(Arc::new(AcceptAll));
            fx.importer.begin_import(bytes(b"first package"));
            fx.completed.recv().await.unwrap().unwrap();
            fx.registry
                .modify(LOCAL_ID, RegistryEventKind::StatusChanged, &mut |u| {
                    u.status = installing
                })
                .unwrap();

            assert!(fx.importer.begin_import(bytes(b"second package")));
            assert!(fx.completed.recv().await.unwrap().is_none());

            let local = fx.registry.get_update(LOCAL_ID).unwrap();
            assert_eq!(local.status, installing);
            assert_eq!(local.file_size, 13);
            assert!(fx.importer.config().local_package_path().exists());
            assert_eq!(fx.importer.purge_stale_imports().unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_cancel_without_import() {
        let fx = fixture(Arc::new(AcceptAll));
        assert!(!fx.importer.cancel_import());
        assert!(!fx.importer.is_importing());
    }

    #[test]
    fn test_begin_outside_runtime_is_refused() {
        let fx = fixture(Arc::new(AcceptAll));
        assert!(!fx.importer.begin_import(bytes(b"x")));
        assert_eq!(fx.recorder.started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_purge_stale_imports() {
        let fx = fixture(Arc::new(AcceptAll));
        let dir = fx.importer.config().imports_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.zip"), b"a").unwrap();
        std::fs::write(dir.join("b.zip"), b"b").unwrap();

        assert_eq!(fx.importer.purge_stale_imports().unwrap(), 2);
        assert_eq!(fx.importer.purge_stale_imports().unwrap(), 0);
    }
}
