//! Key passphrase delivery to the ssh client through a Unix socket.
//!
//! When a private key is encrypted, ssh asks `SSH_ASKPASS` for the
//! passphrase. Rather than writing the passphrase into a script, we:
//!
//! 1. Bind a Unix socket (0600) inside a private temp directory (0700)
//! 2. Write a script that only knows the socket path and calls
//!    `dbsync --askpass <socket>` (or `nc -U` as a fallback)
//! 3. Serve the passphrase over the socket when ssh runs the script
//!
//! Binaries must call [`handle_askpass_mode`] first thing in `main`.

use anyhow::{Context, Result};
use smol::io::AsyncWriteExt;
use smol::net::unix::UnixListener;
use smol::process::Command;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Handle `--askpass <socket>` and exit, or return if the flag is absent.
pub fn handle_askpass_mode() {
    let mut args = std::env::args().skip_while(|a| a != "--askpass");
    if args.next().is_none() {
        return;
    }

    let code = match args.next() {
        Some(socket) => match relay_secret(Path::new(&socket)) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("askpass error: {}", e);
                1
            }
        },
        None => {
            eprintln!("--askpass requires a socket path argument");
            1
        }
    };
    std::process::exit(code);
}

/// Copy the secret served on `socket` to stdout, where ssh reads it.
fn relay_secret(socket: &Path) -> std::io::Result<()> {
    let mut stream = std::os::unix::net::UnixStream::connect(socket)?;
    let mut secret = String::new();
    stream.read_to_string(&mut secret)?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(secret.as_bytes())?;
    stdout.flush()
}

/// Serves one secret over a Unix socket for `SSH_ASKPASS`.
pub struct AskpassProxy {
    listener: UnixListener,
    script_path: PathBuf,
    socket_path: PathBuf,
    _temp_dir: TempDir,
}

impl AskpassProxy {
    pub async fn new() -> Result<Self> {
        let temp_dir = TempDir::with_prefix("dbsync-askpass-")?;
        restrict(temp_dir.path(), 0o700)?;

        let socket_path = temp_dir.path().join("askpass.sock");
        let listener =
            UnixListener::bind(&socket_path).context("Failed to create askpass socket")?;
        restrict(&socket_path, 0o600)?;

        let exe = std::env::current_exe().context("Failed to get current executable path")?;
        let script_path = temp_dir.path().join("askpass.sh");
        std::fs::write(&script_path, render_script(&exe, &socket_path))?;
        restrict(&script_path, 0o700)?;

        tracing::debug!("Askpass proxy listening on {}", socket_path.display());

        Ok(Self {
            listener,
            script_path,
            socket_path,
            _temp_dir: temp_dir,
        })
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Point an ssh invocation at this proxy.
    pub fn configure(&self, cmd: &mut Command) {
        cmd.env("SSH_ASKPASS", &self.script_path);
        cmd.env("SSH_ASKPASS_REQUIRE", "force");
        cmd.env("DISPLAY", ":0");
    }

    /// Wait for the script to connect, then send the secret and close.
    pub async fn serve(&self, secret: &str) -> Result<()> {
        let (mut stream, _) = self
            .listener
            .accept()
            .await
            .context("Failed to accept askpass connection")?;

        stream
            .write_all(format!("{}\n", secret).as_bytes())
            .await
            .context("Failed to write passphrase to socket")?;
        stream.flush().await?;

        tracing::debug!("Served passphrase via askpass proxy");
        Ok(())
    }

    /// Like [`serve`](Self::serve), giving up after `timeout`.
    ///
    /// Returns Ok(true) if the secret was served, Ok(false) if timed out.
    pub async fn serve_with_timeout(&self, secret: &str, timeout: Duration) -> Result<bool> {
        smol::future::or(
            async { self.serve(secret).await.map(|()| true) },
            async {
                smol::Timer::after(timeout).await;
                tracing::debug!("Askpass timeout - ssh did not ask for a passphrase");
                Ok(false)
            },
        )
        .await
    }
}

fn restrict(path: &Path, mode: u32) -> std::io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// The `SSH_ASKPASS` script: ask our own binary, else `nc`.
fn render_script(exe: &Path, socket: &Path) -> String {
    let exe = shell_escape(&exe.to_string_lossy());
    let socket = shell_escape(&socket.to_string_lossy());

    format!(
        "#!/bin/sh\n\
         # Key passphrase is delivered via Unix socket, never stored here\n\
         {exe} --askpass {socket} 2>/dev/null && exit 0\n\
         command -v nc >/dev/null 2>&1 && exec nc -U {socket}\n\
         echo 'dbsync askpass: neither dbsync --askpass nor nc available' >&2\n\
         exit 1\n"
    )
}

/// Single-quote a string for a POSIX shell.
fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
