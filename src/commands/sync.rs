use super::{Server, open_pair, until_tunnel_failure};
use anyhow::{Context, Result};
use dbsync::Config;
use dbsync::services::{DatabaseManager, Diff, Dumper, Importer, collect};

pub async fn run(config: &Config, master: &str, slave: &str) -> Result<()> {
    let (mut master, mut slave) = open_pair(config, master, slave).await?;

    let result = {
        let work = sync(&master.server, &slave.server);
        until_tunnel_failure(master.tunnel.as_mut(), slave.tunnel.as_mut(), work).await
    };

    master.close().await;
    slave.close().await;
    result
}

async fn sync(master: &Server, slave: &Server) -> Result<()> {
    let master_db = DatabaseManager::connect(&master.connection)
        .await
        .with_context(|| format!("connecting to {}", master.name))?;
    let slave_db = DatabaseManager::connect(&slave.connection)
        .await
        .with_context(|| format!("connecting to {}", slave.name))?;

    tracing::info!("Computing differences between master and slave...");
    let master_checksums = collect(&master_db).await.context("master table checksums")?;
    let slave_checksums = collect(&slave_db).await.context("slave table checksums")?;

    master_db.close().await;
    slave_db.close().await;

    let diff = Diff::compute(&slave_checksums, &master_checksums);
    if diff.is_empty() {
        tracing::info!("Nothing to sync");
        return Ok(());
    }

    log_plan(&diff);
    apply(&diff, master, slave).await?;

    tracing::info!("Done!");
    Ok(())
}

pub fn log_plan(diff: &Diff) {
    let join = |units: &std::collections::BTreeSet<String>| {
        units.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
    };

    if !diff.created.is_empty() {
        tracing::info!("Create tables: {}", join(&diff.created));
    }
    if !diff.updated.is_empty() {
        tracing::info!("Update tables: {}", join(&diff.updated));
    }
    if !diff.deleted.is_empty() {
        tracing::info!("Delete tables: {}", join(&diff.deleted));
    }
}

pub async fn apply(diff: &Diff, master: &Server, slave: &Server) -> Result<()> {
    let sql = diff
        .generate_sql(&Dumper::new(master.connection.clone()))
        .await
        .context("generating SQL")?;

    tracing::info!("Syncing...");
    Importer::new(slave.connection.clone())
        .import(&sql)
        .await
        .with_context(|| format!("importing into {}", slave.name))?;
    Ok(())
}
