//! Keep two databases in sync, optionally through SSH tunnels.
//!
//! The library provides the tunnel manager, per-table checksum collection,
//! the diff engine and a polling watcher. The `dbsync` binary wires them to
//! a JSON config file and the engines' dump/restore tools.

pub mod config;
pub mod error;
pub mod net;
pub mod services;

pub use config::{Config, ServerConfig, SshConfig};
pub use error::{DialStage, Error, Result};
pub use services::ssh;
