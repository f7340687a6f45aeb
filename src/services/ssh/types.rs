//! SSH tunnel endpoint and host identity types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A host/port pair, optionally with the user to log in as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Build the SSH destination (user@host)
    pub fn ssh_destination(&self) -> String {
        match self.user.as_deref() {
            Some(user) if !user.is_empty() => format!("{}@{}", user, self.host),
            _ => self.host.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How the relay's host key is verified.
///
/// `AcceptAny` trusts whatever identity the relay presents. It is the default
/// and is insecure: a man in the middle can impersonate the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostKeyPolicy {
    #[default]
    AcceptAny,
    /// Require the relay key to be listed in this known_hosts file.
    KnownHosts(PathBuf),
}

impl HostKeyPolicy {
    /// `-o` options passed to ssh for this policy.
    pub fn ssh_options(&self) -> Vec<String> {
        match self {
            HostKeyPolicy::AcceptAny => vec![
                "StrictHostKeyChecking=no".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "LogLevel=ERROR".to_string(),
            ],
            HostKeyPolicy::KnownHosts(path) => vec![
                "StrictHostKeyChecking=yes".to_string(),
                format!("UserKnownHostsFile={}", path.display()),
            ],
        }
    }
}
