//! Lifecycle event bridge.
//!
//! Forwards registry changes to the one external subscriber, in order and at
//! most once each. The subscriber lives in a [`CallbackSlot`]; registering a
//! new one replaces the old. Events raised while nobody is subscribed are
//! dropped and never replayed.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::CallbackError;
use crate::importer::ImportCallbacks;
use crate::record::UpdateRecord;
use crate::registry::{RegistryEvent, RegistryEventKind, UpdateRegistry};
use crate::wire::UpdateItemInfo;

/// External subscriber of update lifecycle events.
///
/// Implementations must not block: they are called from the bridge loop and
/// from import workers.
pub trait UpdaterCallback: Send + Sync {
    fn on_status_change(&self, update: &UpdateItemInfo) -> Result<(), CallbackError>;

    fn on_download_progress_change(&self, update: &UpdateItemInfo) -> Result<(), CallbackError>;

    fn on_install_progress(&self, update: &UpdateItemInfo) -> Result<(), CallbackError>;

    fn on_update_check_completed(&self, new_updates: bool) -> Result<(), CallbackError>;

    fn on_import_started(&self) -> Result<(), CallbackError>;

    fn on_import_completed(&self, update: Option<&UpdateItemInfo>) -> Result<(), CallbackError>;
}

/// Holder of the current subscriber. Last registration wins.
#[derive(Default)]
pub struct CallbackSlot {
    subscriber: RwLock<Option<Arc<dyn UpdaterCallback>>>,
}

impl CallbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber`, replacing any previous one.
    pub fn set(&self, subscriber: Arc<dyn UpdaterCallback>) {
        let mut slot = self.subscriber.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            info!("Replacing update callback");
        } else {
            info!("Update callback registered");
        }
        *slot = Some(subscriber);
    }

    pub fn clear(&self) {
        *self.subscriber.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn current(&self) -> Option<Arc<dyn UpdaterCallback>> {
        self.subscriber
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_set(&self) -> bool {
        self.current().is_some()
    }

    /// Deliver one event to the current subscriber.
    ///
    /// Delivery errors are logged and never returned. A disconnected
    /// subscriber is unregistered, unless it was already replaced.
    pub fn deliver<F>(&self, event: &'static str, send: F) -> bool
    where
        F: FnOnce(&dyn UpdaterCallback) -> Result<(), CallbackError>,
    {
        let Some(subscriber) = self.current() else {
            debug!(event, "No callback found, dropping event");
            return false;
        };

        match send(subscriber.as_ref()) {
            Ok(()) => true,
            Err(CallbackError::Disconnected) => {
                warn!(event, "Update callback disconnected, unregistering");
                self.clear_if_current(&subscriber);
                false
            }
            Err(e) => {
                warn!(event, error = %e, "Failed to deliver update callback");
                false
            }
        }
    }

    fn clear_if_current(&self, subscriber: &Arc<dyn UpdaterCallback>) {
        let mut slot = self.subscriber.write().unwrap_or_else(|e| e.into_inner());
        let same = slot
            .as_ref()
            .map(|current| same_subscriber(current, subscriber))
            .unwrap_or(false);
        if same {
            *slot = None;
        }
    }
}

fn same_subscriber(a: &Arc<dyn UpdaterCallback>, b: &Arc<dyn UpdaterCallback>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl ImportCallbacks for CallbackSlot {
    fn on_import_started(&self) {
        self.deliver("import_started", |cb| cb.on_import_started());
    }

    fn on_import_completed(&self, update: Option<UpdateRecord>) {
        let info = update.as_ref().map(UpdateItemInfo::from);
        self.deliver("import_completed", |cb| cb.on_import_completed(info.as_ref()));
    }
}

/// Single consumer of the registry event stream.
pub struct LifecycleEventBridge {
    registry: Arc<dyn UpdateRegistry>,
    callbacks: Arc<CallbackSlot>,
    events: broadcast::Receiver<RegistryEvent>,
}

impl LifecycleEventBridge {
    /// Subscribe to `registry` now; events from this point on are bridged.
    pub fn new(registry: Arc<dyn UpdateRegistry>, callbacks: Arc<CallbackSlot>) -> Self {
        let events = registry.subscribe();
        Self {
            registry,
            callbacks,
            events,
        }
    }

    /// Run the bridge on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Forward events until the registry goes away.
    #[instrument(skip(self), name = "event_bridge")]
    pub async fn run(mut self) {
        info!("Lifecycle event bridge started");
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    self.forward(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event bridge lagged behind the registry, events skipped");
                }
                Err(RecvError::Closed) => {
                    info!("Registry closed, stopping event bridge");
                    break;
                }
            }
        }
    }

    /// Forward one event with the current snapshot of its record, or the
    /// final one if the record was removed.
    pub fn forward(&self, event: &RegistryEvent) -> bool {
        if !self.callbacks.is_set() {
            debug!(download_id = %event.download_id, "No callback found, dropping event");
            return false;
        }

        let update = match &event.removed {
            Some(removed) => removed.clone(),
            None => match self.registry.get_update(&event.download_id) {
                Some(update) => update,
                None => {
                    debug!(download_id = %event.download_id, "Update gone before its event was delivered");
                    return false;
                }
            },
        };
        let info = UpdateItemInfo::from(&update);

        match event.kind {
            RegistryEventKind::StatusChanged => self
                .callbacks
                .deliver("status_change", |cb| cb.on_status_change(&info)),
            RegistryEventKind::DownloadProgress => self
                .callbacks
                .deliver("download_progress", |cb| cb.on_download_progress_change(&info)),
            RegistryEventKind::InstallProgress => self
                .callbacks
                .deliver("install_progress", |cb| cb.on_install_progress(&info)),
        }
    }
}
