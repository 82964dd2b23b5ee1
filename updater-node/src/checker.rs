//! Update list checks.
//!
//! The update server publishes a JSON list of builds:
//!
//! ```json
//! { "response": [ { "datetime": 1700000000, "filename": "bliss-16.zip",
//!                   "id": "5f1c...", "romtype": "OFFICIAL", "size": 1073741824,
//!                   "url": "https://...", "version": "16.9" } ] }
//! ```
//!
//! A check downloads the list next to the cached copy, parses it, registers
//! new builds and then replaces the cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use updater_core::{PersistentStatus, SharedRegistry, UpdateRecord, UpdateStatus, LOCAL_ID};

/// File name of the cached update list inside the download directory.
pub const CACHED_LIST_NAME: &str = "updates.json";

#[derive(Debug, Deserialize)]
struct UpdateList {
    response: Vec<UpdateListEntry>,
}

#[derive(Debug, Deserialize)]
struct UpdateListEntry {
    /// Build time, epoch seconds
    datetime: i64,
    filename: String,
    id: String,
    size: u64,
    url: String,
    version: String,
}

impl UpdateListEntry {
    fn into_record(self) -> UpdateRecord {
        UpdateRecord {
            download_id: self.id,
            name: self.filename,
            version: self.version,
            file: None,
            file_size: self.size,
            timestamp: self.datetime.saturating_mul(1000),
            download_url: self.url,
            status: UpdateStatus::Unknown,
            persistent_status: PersistentStatus::Unknown,
            available_online: true,
            ..Default::default()
        }
    }
}

/// Parse an update list into unregistered records.
pub fn parse_update_list(json: &str) -> Result<Vec<UpdateRecord>> {
    let list: UpdateList = serde_json::from_str(json).context("Failed to parse update list")?;
    Ok(list
        .response
        .into_iter()
        .filter(|entry| {
            if entry.id.is_empty() || entry.url.is_empty() {
                warn!(filename = %entry.filename, "Skipping update list entry without id or url");
                return false;
            }
            if entry.id == LOCAL_ID {
                warn!(filename = %entry.filename, "Skipping update list entry with reserved id");
                return false;
            }
            true
        })
        .map(UpdateListEntry::into_record)
        .collect())
}

/// Fetches the update list and feeds it into the registry.
pub struct UpdateChecker {
    registry: SharedRegistry,
    client: reqwest::Client,
    server_url: String,
    cache_path: PathBuf,
}

impl UpdateChecker {
    pub fn new(
        registry: SharedRegistry,
        server_url: String,
        download_dir: &Path,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            registry,
            client,
            server_url,
            cache_path: download_dir.join(CACHED_LIST_NAME),
        })
    }

    /// Run one check. Returns whether any build was new to the registry.
    #[instrument(skip(self), fields(url = %self.server_url))]
    pub async fn check(&self) -> Result<bool> {
        info!("Checking for updates");

        let fresh = self.fetch().await?;
        let result = self.apply(&fresh).await;

        match &result {
            Ok(_) => {
                if let Err(e) = fs::rename(&fresh, &self.cache_path).await {
                    warn!(error = %e, "Failed to replace cached update list");
                }
            }
            Err(_) => {
                let _ = fs::remove_file(&fresh).await;
            }
        }
        result
    }

    /// Download the list into a fresh file next to the cache.
    async fn fetch(&self) -> Result<PathBuf> {
        let response = self
            .client
            .get(&self.server_url)
            .send()
            .await
            .context("Failed to connect to update server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Update server returned error {}: {}", status, body);
        }

        let body = response
            .bytes()
            .await
            .context("Failed to read update list")?;

        if let Some(dir) = self.cache_path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let fresh = PathBuf::from(format!("{}.{}", self.cache_path.display(), Uuid::new_v4()));
        fs::write(&fresh, &body)
            .await
            .with_context(|| format!("Failed to write {}", fresh.display()))?;
        Ok(fresh)
    }

    async fn apply(&self, list: &Path) -> Result<bool> {
        let content = fs::read_to_string(list)
            .await
            .with_context(|| format!("Failed to read {}", list.display()))?;
        let updates = parse_update_list(&content)?;

        let mut new_updates = false;
        let mut online = Vec::with_capacity(updates.len());
        for update in updates {
            online.push(update.download_id.clone());
            new_updates |= self.registry.add_update(update)?;
        }
        self.registry.set_available_online(&online, true);

        info!(
            count = online.len(),
            new_updates,
            "Update list processed"
        );
        Ok(new_updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use updater_core::{InMemoryRegistry, UpdateRegistry};

    const LIST: &str = r#"{
        "response": [
            {
                "datetime": 1700000000,
                "filename": "Bliss-v16.9-x86_64-OFFICIAL.zip",
                "id": "c1a8e3",
                "romtype": "OFFICIAL",
                "size": 1048576,
                "url": "https://mirror.example.org/c1a8e3.zip",
                "version": "16.9"
            },
            {
                "datetime": 1690000000,
                "filename": "broken.zip",
                "id": "",
                "size": 1,
                "url": "",
                "version": "0"
            }
        ]
    }"#;

    #[test]
    fn test_parse_update_list() {
        let updates = parse_update_list(LIST).unwrap();
        assert_eq!(updates.len(), 1);

        let update = &updates[0];
        assert_eq!(update.download_id, "c1a8e3");
        assert_eq!(update.timestamp, 1_700_000_000_000);
        assert_eq!(update.file_size, 1_048_576);
        assert_eq!(update.status, UpdateStatus::Unknown);
        assert!(update.available_online);
        assert!(update.file.is_none());
    }

    #[tokio::test]
    async fn test_reserved_local_id_keeps_imported_update() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let package = dir.path().join("localUpdate.zip");
        std::fs::write(&package, b"zip").unwrap();
        registry
            .add_update(UpdateRecord::local("Local update", package.clone(), 3, 1_000))
            .unwrap();

        let list = r#"{ "response": [ { "datetime": 1700000000, "filename": "evil.zip",
            "id": "local", "size": 1, "url": "https://mirror.example.org/evil.zip",
            "version": "1" } ] }"#;
        assert!(parse_update_list(list).unwrap().is_empty());

        let checker = UpdateChecker::new(
            registry.clone(),
            "http://127.0.0.1:9/list.json".to_string(),
            dir.path(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        let path = dir.path().join("list.json");
        std::fs::write(&path, list).unwrap();
        assert!(!checker.apply(&path).await.unwrap());

        let local = registry.get_update(LOCAL_ID).unwrap();
        assert_eq!(local.status, UpdateStatus::Verified);
        assert_eq!(local.file.as_deref(), Some(package.as_path()));
    }

    #[test]
    fn test_malformed_list_is_an_error() {
        assert!(parse_update_list("{\"builds\": []}").is_err());
        assert!(parse_update_list("not json").is_err());
    }

    #[tokio::test]
    async fn test_apply_registers_and_marks_online() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .add_update(UpdateRecord {
                download_id: "stale".to_string(),
                available_online: true,
                ..Default::default()
            })
            .unwrap();

        let checker = UpdateChecker::new(
            registry.clone(),
            "http://127.0.0.1:9/list.json".to_string(),
            dir.path(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();

        let list = dir.path().join("list.json");
        std::fs::write(&list, LIST).unwrap();

        assert!(checker.apply(&list).await.unwrap());
        assert!(!checker.apply(&list).await.unwrap());

        assert!(registry.get_update("c1a8e3").unwrap().available_online);
        // Offline and nothing durable: purged
        assert!(registry.get_update("stale").is_none());
    }
}
