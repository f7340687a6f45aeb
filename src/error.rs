//! Error types shared by the tunnel, checksum and watcher services.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for dbsync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which leg of a forwarded connection failed to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStage {
    Relay,
    Target,
}

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration, detected before anything is started.
    #[error("invalid config: {}", .0.join("; "))]
    ConfigInvalid(Vec<String>),

    /// No usable ssh-agent socket.
    #[error("ssh agent unavailable: {0}")]
    AgentUnavailable(String),

    /// The private key file does not exist.
    #[error("private key not found: {}", .0.display())]
    KeyFileNotFound(PathBuf),

    /// The private key file is malformed or needs a passphrase.
    #[error("cannot use private key {}: {reason}", path.display())]
    KeyParse { path: PathBuf, reason: String },

    /// Opening the authenticated session to the relay failed.
    #[error("relay dial {endpoint} failed: {message}")]
    RelayDial { endpoint: String, message: String },

    /// Opening the logical channel to the target failed.
    #[error("target dial {endpoint} failed: {message}")]
    TargetDial { endpoint: String, message: String },

    /// The tunnel listener broke; the tunnel is dead.
    #[error("tunnel listener on {addr} failed: {source}")]
    Accept {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Checksum collection failed. `unit` is `None` when listing units failed.
    #[error("checksum collection failed{}: {source}", unit.as_ref().map(|u| format!(" for `{u}`")).unwrap_or_default())]
    Collection {
        unit: Option<String>,
        #[source]
        source: Box<Error>,
    },

    /// A unit listed by the store could not be inspected.
    #[error("unit `{0}` not found")]
    UnitNotFound(String),

    /// The unit's row aggregate exceeds what the store will return in one value.
    #[error("unit `{0}` is too large to checksum (raise max_allowed_packet)")]
    ChecksumOverflow(String),

    /// SQL was requested for a diff with nothing in it.
    #[error("diff empty")]
    EmptyDiff,

    /// An external dump/restore process failed or could not be started.
    #[error("{tool}: {message}")]
    ExternalTool { tool: String, message: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the credential resolution failures (agent or key file).
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Error::AgentUnavailable(_) | Error::KeyFileNotFound(_) | Error::KeyParse { .. }
        )
    }

    /// The failed leg for relay and target dial errors.
    pub fn dial_stage(&self) -> Option<DialStage> {
        match self {
            Error::RelayDial { .. } => Some(DialStage::Relay),
            Error::TargetDial { .. } => Some(DialStage::Target),
            _ => None,
        }
    }

    /// The unit named by a collection failure, if any.
    pub fn failed_unit(&self) -> Option<&str> {
        match self {
            Error::Collection { unit, .. } => unit.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn collection(unit: Option<&str>, source: Error) -> Self {
        Error::Collection {
            unit: unit.map(str::to_string),
            source: Box::new(source),
        }
    }
}
