//! Relay sessions using the system ssh binary.
//!
//! Each session is an `ssh -M -N` master process with a private control
//! socket. Logical channels are `ssh -S <socket> -W host:port` clients
//! multiplexed over that master; their stdin/stdout carry the bytes.

use super::askpass::AskpassProxy;
use super::credential::Credential;
use super::relay::{RelayChannel, RelayConnector};
use super::types::{Endpoint, HostKeyPolicy};
use crate::error::{Error, Result};
use futures::StreamExt;
use smol::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use smol::process::{Child, Command, Stdio};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ASKPASS_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated sessions to one relay host.
#[derive(Debug, Clone)]
pub struct SshRelay {
    relay: Endpoint,
    credential: Credential,
    host_keys: HostKeyPolicy,
}

impl SshRelay {
    pub fn new(relay: Endpoint, credential: Credential) -> Self {
        Self {
            relay,
            credential,
            host_keys: HostKeyPolicy::default(),
        }
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_keys = policy;
        self
    }

    pub fn relay(&self) -> &Endpoint {
        &self.relay
    }

    /// Start a master session and wait until it is authenticated.
    pub async fn connect(&self) -> Result<SshSession> {
        let temp_dir = tempfile::Builder::new()
            .prefix("dbsync-ssh-")
            .tempdir()?;
        let control_path = temp_dir.path().join("ctl.sock");

        let mut cmd = Command::new("ssh");
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        cmd.arg("-N");
        cmd.args(["-o", "ControlMaster=yes"]);
        cmd.arg("-o").arg(format!("ControlPath={}", control_path.display()));
        cmd.args(["-o", "ServerAliveInterval=15"]);
        cmd.args(["-o", "ServerAliveCountMax=3"]);
        cmd.arg("-p").arg(self.relay.port.to_string());

        for option in self.host_keys.ssh_options() {
            cmd.arg("-o").arg(option);
        }

        self.credential.configure(&mut cmd);

        let askpass = match self.credential.passphrase() {
            Some(passphrase) => {
                let proxy = Arc::new(AskpassProxy::new().await.map_err(|e| self.dial_error(e))?);
                proxy.configure(&mut cmd);

                let server = proxy.clone();
                let passphrase = passphrase.to_string();
                smol::spawn(async move {
                    if let Err(e) = server.serve_with_timeout(&passphrase, ASKPASS_TIMEOUT).await {
                        tracing::warn!("Askpass proxy failed: {}", e);
                    }
                })
                .detach();
                Some(proxy)
            }
            None => {
                cmd.args(["-o", "BatchMode=yes"]);
                None
            }
        };

        let destination = self.relay.ssh_destination();
        cmd.arg(&destination);

        tracing::debug!("Starting relay session: {:?}", cmd);
        let mut master = cmd.spawn().map_err(|e| self.dial_error(e))?;

        loop {
            if let Ok(Some(status)) = master.try_status() {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(self.dial_error(format!(
                    "ssh exited with {}: {}",
                    status,
                    stderr.trim()
                )));
            }

            if control_ready(&control_path, &destination).await {
                break;
            }

            smol::Timer::after(READY_POLL_INTERVAL).await;
        }

        tracing::debug!("Relay session to {} is up", self.relay);

        Ok(SshSession {
            master,
            control_path,
            destination,
            _askpass: askpass,
            _temp_dir: temp_dir,
        })
    }

    fn dial_error(&self, message: impl ToString) -> Error {
        Error::RelayDial {
            endpoint: self.relay.to_string(),
            message: message.to_string(),
        }
    }
}

impl RelayConnector for SshRelay {
    async fn open_channel(&self, target: &Endpoint) -> Result<RelayChannel> {
        let session = self.connect().await?;
        session.open_channel(target).await
    }
}

async fn control_ready(control_path: &std::path::Path, destination: &str) -> bool {
    if !control_path.exists() {
        return false;
    }

    let mut cmd = Command::new("ssh");
    cmd.arg("-o")
        .arg(format!("ControlPath={}", control_path.display()))
        .args(["-O", "check"])
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    match cmd.status().await {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

/// An authenticated master connection to the relay.
pub struct SshSession {
    master: Child,
    control_path: PathBuf,
    destination: String,
    _askpass: Option<Arc<AskpassProxy>>,
    _temp_dir: tempfile::TempDir,
}

impl SshSession {
    /// Open a logical channel to `target` through this session.
    ///
    /// The session is moved into the channel and lives as long as it does.
    pub async fn open_channel(self, target: &Endpoint) -> Result<RelayChannel> {
        let mut cmd = Command::new("ssh");
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        cmd.args(["-o", "ControlMaster=no"]);
        cmd.arg("-W").arg(forward_spec(target));
        cmd.arg(&self.destination);

        let target_err = |message: String| Error::TargetDial {
            endpoint: target.to_string(),
            message,
        };

        let mut client = cmd.spawn().map_err(|e| target_err(e.to_string()))?;
        let stdin = client
            .stdin
            .take()
            .ok_or_else(|| target_err("channel stdin unavailable".to_string()))?;
        let stdout = client
            .stdout
            .take()
            .ok_or_else(|| target_err("channel stdout unavailable".to_string()))?;

        if let Some(stderr) = client.stderr.take() {
            let target = target.clone();
            smol::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(result) = lines.next().await {
                    match result {
                        Ok(line) if line.contains("open failed") || line.contains("connect failed") => {
                            tracing::warn!("Target dial {} failed: {}", target, line);
                        }
                        Ok(line) => tracing::debug!("ssh channel stderr: {}", line),
                        Err(e) => {
                            tracing::debug!("ssh channel stderr read error: {}", e);
                            break;
                        }
                    }
                }
            })
            .detach();
        }

        Ok(RelayChannel::new(Box::new(stdout), Box::new(stdin)).with_keepalive((self, client)))
    }
}

/// `host:port` for `ssh -W`, bracketing IPv6 literals.
fn forward_spec(target: &Endpoint) -> String {
    if target.host.contains(':') {
        format!("[{}]:{}", target.host, target.port)
    } else {
        target.to_string()
    }
}
