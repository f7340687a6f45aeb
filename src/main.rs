//! dbsync
//!
//! Sync tables from a master database to a slave, optionally through SSH
//! tunnels.
//!
//! # Commands
//!
//! - `sync` - copy every changed table from master to slave once
//! - `watch` - poll master for changes and apply them to slave

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dbsync::Config;
use dbsync::ssh::handle_askpass_mode;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Sync two databases described in a config file.
#[derive(Parser)]
#[command(name = "dbsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default ./.dbsync.json or ~/.dbsync/config.json)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync server MASTER to server SLAVE
    Sync {
        /// Server name to copy from
        master: String,

        /// Server name to copy to
        slave: String,
    },

    /// Watch MASTER for changes and sync them to SLAVE
    Watch {
        /// Server name to watch
        master: String,

        /// Server name to apply changes to
        slave: String,

        /// Seconds between checks
        #[arg(short, long, default_value = "5")]
        interval: u64,
    },
}

fn main() -> Result<()> {
    // Handle --askpass mode first (before any other initialization)
    handle_askpass_mode();

    let cli = Cli::parse();

    let level = if cli.verbose { "dbsync=debug" } else { "dbsync=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(level.parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    smol::block_on(async {
        let config = Config::load(cli.config.as_deref()).await?;

        match cli.command {
            Commands::Sync { master, slave } => commands::sync::run(&config, &master, &slave).await,
            Commands::Watch {
                master,
                slave,
                interval,
            } => {
                let interval = Duration::from_secs(interval.max(1));
                commands::watch::run(&config, &master, &slave, interval).await
            }
        }
    })
}
