//! SSH tunneling for reaching private database hosts.
//!
//! This module provides:
//! - `Credential` - ssh-agent or private key authentication
//! - `Tunnel` - local port forwarding through a relay
//! - `SshRelay` - relay sessions using the system ssh binary
//! - `AskpassProxy` - passphrase delivery via Unix socket

mod askpass;
mod credential;
mod relay;
mod session;
mod tunnel;
mod types;

pub use askpass::{AskpassProxy, handle_askpass_mode};
pub use credential::{Credential, expand_home};
pub use relay::{DirectRelay, RelayChannel, RelayConnector};
pub use session::{SshRelay, SshSession};
pub use tunnel::{Tunnel, TunnelId};
pub use types::{Endpoint, HostKeyPolicy};
