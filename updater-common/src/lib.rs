//! # Updater Common
//!
//! Shared utilities for the updater workspace.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use updater_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(download_id = "local", "Import completed");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
