use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use log::{error, info, warn};

use focustrace::{
    models::AppIdentity, reader::NullContextReader, Database, FocusEngine, SettingsStore,
    SyncClient, SyncService,
};

fn data_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".local/share/focustrace"))
}

/// Opening some store is the one hard startup requirement: prefer the
/// file-backed database, fall back to a volatile in-memory one, and only
/// give up if even that fails.
fn open_store(dir: &std::path::Path) -> Result<Database> {
    match Database::new(dir.join("focustrace.sqlite3")) {
        Ok(db) => Ok(db),
        Err(err) => {
            warn!("Falling back to in-memory store; file-backed open failed: {err:#}");
            Database::in_memory().context("unable to open any session store")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("focustrace starting up...");

    let dir = data_dir()?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create data directory {}", dir.display()))?;

    let db = open_store(&dir)?;
    let settings = SettingsStore::new(dir.join("settings.json"))?;

    // No platform focus observer is wired into this binary; the engine runs
    // with the null reader until one is injected, recording wall-clock time
    // under a single generic identity.
    let engine = FocusEngine::spawn(db.clone(), Arc::new(NullContextReader));
    engine.start(AppIdentity::new("Desktop", None)).await?;

    let sync_settings = settings.sync();
    let sync = if sync_settings.sync_ready() {
        let client = SyncClient::new(
            sync_settings.server_url.clone(),
            sync_settings.api_token.clone(),
        )
        .map_err(|err| anyhow::anyhow!("failed to build sync client: {err}"))?;
        let service = SyncService::new(db.clone(), Arc::new(client));
        service.apply_settings(&sync_settings).await;
        Some(service)
    } else {
        info!("Sync is not configured; running with local store only");
        None
    };

    info!(
        "{} sessions in store; awaiting shutdown signal",
        db.count_sessions().await?
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    if let Err(err) = engine.stop().await {
        error!("Failed to stop tracking cleanly: {err:#}");
    }
    engine.settle().await?;
    db.barrier().await?;

    if let Some(service) = &sync {
        service.stop().await;
        // Best-effort final drain so the just-finalized session ships too.
        if let Err(err) = service.sync_now().await {
            error!("Final sync on shutdown failed: {err}");
        }
    }

    Ok(())
}
