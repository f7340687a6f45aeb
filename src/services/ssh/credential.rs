//! Resolution of the signing credential used to authenticate to a relay.
//!
//! A credential is either the user's ssh-agent or a private key file. When a
//! key path is configured it always wins; otherwise the agent named by
//! `SSH_AUTH_SOCK` is used.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use smol::process::Command;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

const OPENSSH_MAGIC: &[u8] = b"openssh-key-v1\0";

/// A resolved authentication capability. Shared read-only by every
/// connection of a tunnel.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Keys held by an ssh-agent listening on `socket`.
    Agent { socket: PathBuf },
    /// A private key file, with the passphrase to unlock it if it is encrypted.
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Agent { socket } => f.debug_struct("Agent").field("socket", socket).finish(),
            Credential::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

impl Credential {
    /// Pick a credential: the key file if one is given, the agent otherwise.
    pub fn resolve(key_path: Option<&str>, passphrase: Option<String>) -> Result<Self> {
        match key_path {
            Some(path) if !path.trim().is_empty() => {
                let credential = Self::resolve_key_file(path, passphrase)?;
                tracing::info!("Authenticating to relay using private key: {}", path);
                Ok(credential)
            }
            _ => {
                let credential = Self::resolve_agent()?;
                tracing::info!("Authenticating to relay using SSH agent");
                Ok(credential)
            }
        }
    }

    /// Use the agent reachable through `SSH_AUTH_SOCK`.
    pub fn resolve_agent() -> Result<Self> {
        Self::resolve_agent_at(std::env::var_os("SSH_AUTH_SOCK"))
    }

    pub(crate) fn resolve_agent_at(socket: Option<OsString>) -> Result<Self> {
        let socket = match socket {
            Some(s) if !s.is_empty() => PathBuf::from(s),
            _ => return Err(Error::AgentUnavailable("SSH_AUTH_SOCK is not set".to_string())),
        };

        probe_agent(&socket).map_err(|e| {
            Error::AgentUnavailable(format!("cannot reach {}: {}", socket.display(), e))
        })?;

        Ok(Credential::Agent { socket })
    }

    /// Use the private key at `path` (`~` is expanded).
    pub fn resolve_key_file(path: &str, passphrase: Option<String>) -> Result<Self> {
        let path = expand_home(path);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::KeyFileNotFound(path));
            }
            Err(e) => {
                return Err(Error::KeyParse {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        let encrypted = is_encrypted_key(&contents).map_err(|reason| Error::KeyParse {
            path: path.clone(),
            reason,
        })?;

        let passphrase = passphrase.filter(|p| !p.is_empty());
        if encrypted && passphrase.is_none() {
            return Err(Error::KeyParse {
                path,
                reason: "key is passphrase protected and no passphrase was supplied".to_string(),
            });
        }

        Ok(Credential::KeyFile { path, passphrase })
    }

    /// Passphrase the ssh client will ask for, if any.
    pub fn passphrase(&self) -> Option<&str> {
        match self {
            Credential::KeyFile { passphrase, .. } => passphrase.as_deref(),
            Credential::Agent { .. } => None,
        }
    }

    /// Make an ssh invocation sign with this credential.
    pub(crate) fn configure(&self, cmd: &mut Command) {
        match self {
            Credential::Agent { socket } => {
                cmd.env("SSH_AUTH_SOCK", socket);
            }
            Credential::KeyFile { path, .. } => {
                cmd.arg("-i").arg(path);
                cmd.args(["-o", "IdentitiesOnly=yes"]);
                cmd.env_remove("SSH_AUTH_SOCK");
            }
        }
    }
}

#[cfg(unix)]
fn probe_agent(socket: &Path) -> std::io::Result<()> {
    std::os::unix::net::UnixStream::connect(socket).map(drop)
}

#[cfg(not(unix))]
fn probe_agent(_socket: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "agent sockets are only supported on Unix systems",
    ))
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };

    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Inspect a private key, returning whether it is encrypted.
fn is_encrypted_key(contents: &str) -> std::result::Result<bool, String> {
    let begin = contents
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("-----BEGIN ") && l.ends_with("-----"))
        .ok_or_else(|| "no PEM armor found".to_string())?;

    let label = begin
        .trim_start_matches("-----BEGIN ")
        .trim_end_matches("-----");

    match label {
        "OPENSSH PRIVATE KEY" => openssh_cipher(contents).map(|cipher| cipher != "none"),
        "RSA PRIVATE KEY" | "EC PRIVATE KEY" | "DSA PRIVATE KEY" => {
            Ok(contents.contains("Proc-Type: 4,ENCRYPTED"))
        }
        "PRIVATE KEY" => Ok(false),
        "ENCRYPTED PRIVATE KEY" => Ok(true),
        other => Err(format!("unsupported key type `{}`", other)),
    }
}

/// Read the cipher name out of an `openssh-key-v1` blob.
fn openssh_cipher(contents: &str) -> std::result::Result<String, String> {
    let body: String = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with("-----"))
        .collect();

    let blob = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| format!("invalid base64 body: {}", e))?;

    let rest = blob
        .strip_prefix(OPENSSH_MAGIC)
        .ok_or_else(|| "missing openssh-key-v1 header".to_string())?;

    if rest.len() < 4 {
        return Err("truncated key".to_string());
    }
    let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let name = rest
        .get(4..4 + len)
        .ok_or_else(|| "truncated cipher name".to_string())?;

    String::from_utf8(name.to_vec()).map_err(|_| "cipher name is not utf-8".to_string())
}
