//! Build metadata extraction.
//!
//! The package metadata entry is line-oriented `key=value` text. Only the
//! build timestamp is consumed here. A missing or malformed timestamp never
//! rejects a package: the caller's "now" is used instead and the fallback is
//! logged and reported in [`BuildTimestamp::source`].

use std::path::Path;

use tracing::{debug, warn};

use crate::container::{read_entry, METADATA_PATH};
use crate::error::ImportError;

/// Metadata key carrying the build timestamp.
pub const TIMESTAMP_KEY: &str = "post-timestamp=";

/// Why the fallback timestamp was used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// No line starts with the timestamp key
    Missing,
    /// The value after the key is not an integer
    Malformed(String),
    /// The metadata entry could not be read from the package
    Unreadable(String),
}

/// Where a build timestamp came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampSource {
    Metadata,
    Fallback(FallbackReason),
}

/// Build timestamp in epoch milliseconds, with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTimestamp {
    pub millis: i64,
    pub source: TimestampSource,
}

impl BuildTimestamp {
    fn fallback(now_ms: i64, reason: FallbackReason) -> Self {
        warn!(
            fallback = now_ms,
            reason = ?reason,
            "Couldn't find timestamp in package metadata, falling back to now"
        );
        Self {
            millis: now_ms,
            source: TimestampSource::Fallback(reason),
        }
    }

    /// Whether the value was read from the package rather than synthesized.
    pub fn is_from_metadata(&self) -> bool {
        self.source == TimestampSource::Metadata
    }
}

/// Parse the build timestamp out of metadata text.
///
/// The first line starting with [`TIMESTAMP_KEY`] decides; later lines are
/// not consulted even if that value is malformed.
pub fn parse_build_timestamp(metadata: &str, now_ms: i64) -> BuildTimestamp {
    let Some(value) = metadata
        .lines()
        .find_map(|line| line.strip_prefix(TIMESTAMP_KEY))
    else {
        return BuildTimestamp::fallback(now_ms, FallbackReason::Missing);
    };

    match parse_millis(value) {
        Ok(millis) => {
            debug!(timestamp = millis, "Build timestamp read from metadata");
            BuildTimestamp {
                millis,
                source: TimestampSource::Metadata,
            }
        }
        Err(e) => BuildTimestamp::fallback(now_ms, FallbackReason::Malformed(e.to_string())),
    }
}

fn parse_millis(value: &str) -> Result<i64, ImportError> {
    value.trim().parse::<i64>().map_err(|e| {
        ImportError::MetadataInvalid(format!("{}{:?}: {}", TIMESTAMP_KEY, value, e))
    })
}

/// Read the metadata entry of a package and derive its build timestamp.
pub fn read_build_timestamp(package: &Path, now_ms: i64) -> BuildTimestamp {
    match read_entry(package, METADATA_PATH) {
        Ok(metadata) => parse_build_timestamp(&metadata, now_ms),
        Err(e) => BuildTimestamp::fallback(now_ms, FallbackReason::Unreadable(e.to_string())),
    }
}
