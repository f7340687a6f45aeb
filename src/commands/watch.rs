use super::sync::{apply, log_plan};
use super::{Server, open_pair, until_tunnel_failure};
use anyhow::{Context, Result};
use dbsync::Config;
use dbsync::services::{DatabaseManager, Watcher};
use std::time::Duration;

pub async fn run(config: &Config, master: &str, slave: &str, interval: Duration) -> Result<()> {
    let (mut master, mut slave) = open_pair(config, master, slave).await?;

    let result = {
        let work = watch(&master.server, &slave.server, interval);
        until_tunnel_failure(master.tunnel.as_mut(), slave.tunnel.as_mut(), work).await
    };

    master.close().await;
    slave.close().await;
    result
}

async fn watch(master: &Server, slave: &Server, interval: Duration) -> Result<()> {
    let master_db = DatabaseManager::connect(&master.connection)
        .await
        .with_context(|| format!("connecting to {}", master.name))?;

    let handle = Watcher::new(master_db, interval).start();
    let diffs = handle.diffs();
    let errors = handle.errors();

    let _error_log = smol::spawn(async move {
        while let Ok(e) = errors.recv().await {
            tracing::warn!("Checking for changes failed: {}", e);
        }
    });

    // The first event lists every master table, which syncs them all.
    while let Ok(event) = diffs.recv().await {
        tracing::info!("Changes detected at {}", event.timestamp.format("%H:%M:%S"));
        log_plan(&event.diff);

        match apply(&event.diff, master, slave).await {
            Ok(()) => tracing::info!("Synced {} tables", event.diff.len()),
            Err(e) => tracing::error!("Sync failed: {:#}", e),
        }
    }

    handle.stop().await;
    Ok(())
}
