//! Service wiring and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use updater_core::{
    CallbackSlot, ImporterConfig, InMemoryRegistry, LifecycleEventBridge, PackageVerifier,
    SharedRegistry, SignatureVerifier, UpdateImporter, UpdateRegistry,
};

use crate::checker::UpdateChecker;
use crate::config::Config;
use crate::downloader::DownloadManager;
use crate::http_server::run_http_server;
use crate::installer::CommandInstaller;
use crate::service::UpdaterPublicService;

/// Build every component and serve the HTTP API until it fails.
pub async fn run(config: Config) -> Result<()> {
    let updates = &config.updates;

    tokio::fs::create_dir_all(&updates.download_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create download directory {}",
                updates.download_dir.display()
            )
        })?;

    let registry: SharedRegistry = match &updates.state_file {
        Some(path) => {
            let registry = InMemoryRegistry::with_state_file(path)
                .with_context(|| format!("Failed to load update state from {}", path.display()))?;
            info!(
                state_file = %path.display(),
                updates = registry.updates().len(),
                "Update state loaded"
            );
            Arc::new(registry)
        }
        None => {
            info!("No state file configured, update state is not persisted");
            Arc::new(InMemoryRegistry::new())
        }
    };

    let signature_verifier = SignatureVerifier::from_hex_keys(&updates.trusted_keys)
        .context("Invalid trusted key in configuration")?;
    if signature_verifier.trusted_key_count() == 0 {
        warn!("No trusted keys configured, every package will fail verification");
    }
    let verifier: Arc<dyn PackageVerifier> = Arc::new(signature_verifier);

    // Subscriber slot shared by the bridge and the importer
    let callbacks = Arc::new(CallbackSlot::new());
    LifecycleEventBridge::new(registry.clone(), callbacks.clone()).spawn();

    let importer = UpdateImporter::new(
        ImporterConfig {
            download_dir: updates.download_dir.clone(),
            local_update_name: updates.local_update_name.clone(),
        },
        verifier.clone(),
        registry.clone(),
        callbacks.clone(),
    );
    match importer.purge_stale_imports() {
        Ok(0) => {}
        Ok(count) => info!(count, "Removed stale import files"),
        Err(e) => warn!(error = %e, "Failed to purge stale import files"),
    }

    let downloads = Arc::new(DownloadManager::new(
        registry.clone(),
        verifier,
        updates.download_dir.clone(),
        updates.connect_timeout(),
    )?);

    let checker = Arc::new(UpdateChecker::new(
        registry.clone(),
        updates.server_url.clone(),
        &updates.download_dir,
        updates.connect_timeout(),
        updates.check_timeout(),
    )?);

    let installer = Arc::new(CommandInstaller::new(
        registry.clone(),
        updates.install_command.clone(),
    ));

    let service = Arc::new(UpdaterPublicService::new(
        registry,
        callbacks,
        importer,
        downloads,
        checker,
        installer,
    ));

    let addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.server.listen_address))?;

    info!(
        listen = %addr,
        download_dir = %updates.download_dir.display(),
        server_url = %updates.server_url,
        "Updater service ready"
    );

    run_http_server(addr, service).await
}
