//! # Updater Core
//!
//! Update lifecycle coordinator for firmware packages.
//!
//! ## Architecture
//!
//! ```text
//!   begin_import(source)
//!          │
//!          ▼
//! ┌───────────────────┐   verify    ┌──────────────────┐
//! │  UpdateImporter   │────────────►│ PackageVerifier  │
//! │ (background task) │   metadata  ├──────────────────┤
//! │                   │────────────►│ container / meta │
//! └─────────┬─────────┘             └──────────────────┘
//!           │ add_update
//!           ▼
//! ┌───────────────────┐  RegistryEvent  ┌──────────────────────┐
//! │  UpdateRegistry   │────────────────►│ LifecycleEventBridge │──► UpdaterCallback
//! └───────────────────┘                 └──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use updater_core::{
//!     CallbackSlot, ImporterConfig, InMemoryRegistry, LifecycleEventBridge,
//!     SignatureVerifier, UpdateImporter,
//! };
//!
//! let registry = Arc::new(InMemoryRegistry::new());
//! let callbacks = Arc::new(CallbackSlot::new());
//! LifecycleEventBridge::new(registry.clone(), callbacks.clone()).spawn();
//!
//! let verifier = Arc::new(SignatureVerifier::from_hex_keys(&keys)?);
//! let importer = UpdateImporter::new(ImporterConfig::default(), verifier, registry, callbacks);
//! importer.begin_import(Box::new(tokio::fs::File::open("update.zip").await?));
//! ```

pub mod bridge;
pub mod container;
pub mod error;
pub mod importer;
pub mod metadata;
pub mod record;
pub mod registry;
pub mod verifier;
pub mod wire;

pub use bridge::{CallbackSlot, LifecycleEventBridge, UpdaterCallback};
pub use container::{read_entry, METADATA_PATH};
pub use error::{CallbackError, ImportError, RegistryError, Result};
pub use importer::{
    ByteSource, CancelToken, ImportCallbacks, ImportPhase, ImporterConfig, UpdateImporter,
    LOCAL_PACKAGE_NAME,
};
pub use metadata::{read_build_timestamp, BuildTimestamp, FallbackReason, TimestampSource};
pub use record::{local_version, PersistentStatus, UpdateRecord, UpdateStatus, LOCAL_ID};
pub use registry::{InMemoryRegistry, RegistryEvent, RegistryEventKind, SharedRegistry, UpdateRegistry};
pub use verifier::{sign_package, verify_or_discard, PackageVerifier, SignatureVerifier};
pub use wire::{UpdateItemInfo, UpdateItemStatus};
