//! Local TCP port forwarding through a relay.
//!
//! A tunnel binds a local listener and, for every accepted connection, opens
//! a channel to the target through its [`RelayConnector`] and splices bytes
//! both ways. Per-connection failures are logged and the tunnel keeps
//! serving; only a broken listener ends the tunnel.

use super::credential::Credential;
use super::relay::{RelayConnector, RelayChannel};
use super::session::SshRelay;
use super::types::{Endpoint, HostKeyPolicy};
use crate::error::{Error, Result};
use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use smol::Task;
use smol::net::{TcpListener, TcpStream};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for a tunnel or a forwarded connection
pub type TunnelId = Uuid;

/// A running tunnel. Dropping it stops the accept loop; connections already
/// being forwarded run until either side disconnects.
pub struct Tunnel {
    id: TunnelId,
    local_host: String,
    local_port: u16,
    target: Endpoint,
    accept_loop: Option<Task<Result<()>>>,
}

impl Tunnel {
    /// Forward `local` to `target` through an ssh session to `relay`.
    ///
    /// The relay's host key is not verified; use [`Tunnel::establish_with`]
    /// and [`SshRelay::with_host_key_policy`] to pin it.
    pub async fn establish(
        local: Endpoint,
        relay: Endpoint,
        target: Endpoint,
        credential: Credential,
    ) -> Result<Self> {
        let connector = SshRelay::new(relay, credential).with_host_key_policy(HostKeyPolicy::AcceptAny);
        Self::establish_with(local, target, connector).await
    }

    /// Forward `local` to `target` through any relay connector.
    ///
    /// The local port is always allocated by the OS; the port in `local` is
    /// ignored.
    pub async fn establish_with<C: RelayConnector>(
        local: Endpoint,
        target: Endpoint,
        connector: C,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let local_port = find_available_port(&local.host).await?;
        let addr = format!("{}:{}", local.host, local_port);

        // Someone else may take the port between the lookup and this bind.
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("SSH tunnel {} listening on {} -> {}", id, addr, target);

        Ok(Self::serve(id, local.host, local_port, target, listener, connector))
    }

    fn serve<L: Incoming, C: RelayConnector>(
        id: TunnelId,
        local_host: String,
        local_port: u16,
        target: Endpoint,
        listener: L,
        connector: C,
    ) -> Self {
        let addr = format!("{}:{}", local_host, local_port);
        let accept_loop = smol::spawn(accept_loop(
            id,
            addr,
            listener,
            Arc::new(connector),
            target.clone(),
        ));

        Self {
            id,
            local_host,
            local_port,
            target,
            accept_loop: Some(accept_loop),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Get the local address to connect to (e.g., "127.0.0.1:12345").
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    /// Wait for the accept loop to end. It only ends on a listener failure,
    /// which is returned as [`Error::Accept`].
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.accept_loop.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.accept_loop = None;
        result
    }

    /// Stop accepting connections and release the local port.
    pub async fn close(mut self) {
        if let Some(task) = self.accept_loop.take() {
            task.cancel().await;
        }
        tracing::info!("SSH tunnel {} closed", self.id);
    }
}

/// Ask the OS for a free port on `bind_host`, then release it.
async fn find_available_port(bind_host: &str) -> Result<u16> {
    let listener = TcpListener::bind(format!("{}:0", bind_host)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Where a tunnel's inbound connections come from.
trait Incoming: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Incoming for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

async fn accept_loop<L: Incoming, C: RelayConnector>(
    tunnel_id: TunnelId,
    addr: String,
    listener: L,
    connector: Arc<C>,
    target: Endpoint,
) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(source) => {
                tracing::error!("SSH tunnel {} listener failed: {}", tunnel_id, source);
                return Err(Error::Accept { addr, source });
            }
        };

        let conn_id = Uuid::new_v4();
        tracing::debug!(
            "SSH tunnel {} accepted {} from {}",
            tunnel_id,
            conn_id,
            peer
        );

        let connector = connector.clone();
        let target = target.clone();
        smol::spawn(async move {
            match connector.open_channel(&target).await {
                Ok(channel) => splice(conn_id, stream, channel).await,
                Err(e) => tracing::warn!("SSH tunnel connection {}: {}", conn_id, e),
            }
        })
        .detach();
    }
}

/// Copy bytes both ways between the local connection and the channel.
///
/// Each direction is its own task and ends when its source disconnects; one
/// direction failing does not stop the other.
async fn splice(conn_id: Uuid, local: TcpStream, channel: RelayChannel) {
    let (remote_reader, remote_writer, keepalive) = channel.into_parts();

    let upstream = smol::spawn(copy_half(local.clone(), remote_writer));
    let downstream = smol::spawn(copy_half(remote_reader, local));

    let (up, down) = futures::join!(upstream, downstream);
    for (direction, result) in [("local -> remote", up), ("remote -> local", down)] {
        match result {
            Ok(bytes) => tracing::debug!("Connection {} {} closed after {} bytes", conn_id, direction, bytes),
            Err(e) => tracing::debug!("Connection {} {} failed: {}", conn_id, direction, e),
        }
    }

    drop(keepalive);
}

async fn copy_half<R, W>(reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let bytes = futures::io::copy(reader, &mut writer).await?;
    writer.close().await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ssh::DirectRelay;
    use futures::AsyncReadExt;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echo server standing in for the private target.
    async fn echo_target() -> (Endpoint, Task<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = smol::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                smol::spawn(async move {
                    let mut writer = stream.clone();
                    let _ = futures::io::copy(stream, &mut writer).await;
                })
                .detach();
            }
        });
        (Endpoint::new("127.0.0.1", port), task)
    }

    async fn round_trip(addr: &str, payload: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut client = TcpStream::connect(addr).await?;
        client.write_all(payload).await?;
        let mut buf = vec![0u8; payload.len()];
        client.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Relay that records every dial and fails the first `failures` of them.
    struct ScriptedRelay {
        failures: usize,
        dials: AtomicUsize,
        targets: Mutex<Vec<Endpoint>>,
    }

    impl ScriptedRelay {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                dials: AtomicUsize::new(0),
                targets: Mutex::new(Vec::new()),
            }
        }
    }

    impl RelayConnector for Arc<ScriptedRelay> {
        async fn open_channel(&self, target: &Endpoint) -> Result<RelayChannel> {
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push(target.clone());
            if n < self.failures {
                return Err(Error::RelayDial {
                    endpoint: "relay:22".to_string(),
                    message: "connection refused".to_string(),
                });
            }
            DirectRelay.open_channel(target).await
        }
    }

    /// Listener that hands out `accepts` connections, then breaks.
    struct BreakingListener {
        inner: TcpListener,
        accepts: AtomicUsize,
    }

    impl Incoming for BreakingListener {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            let left = self.accepts.load(Ordering::SeqCst);
            if left == 0 {
                return Err(io::Error::other("too many open files"));
            }
            self.accepts.store(left - 1, Ordering::SeqCst);
            self.inner.accept().await
        }
    }

    #[test]
    fn test_tunnel_forwards_to_target() {
        smol::block_on(async {
            let (target, _server) = echo_target().await;
            let tunnel = Tunnel::establish_with(Endpoint::new("127.0.0.1", 0), target.clone(), DirectRelay)
                .await
                .unwrap();

            assert!(tunnel.local_port() >= 1);
            assert_eq!(tunnel.local_host(), "127.0.0.1");
            assert_eq!(tunnel.target(), &target);

            let echoed = round_trip(&tunnel.local_addr(), b"select 1;").await.unwrap();
            assert_eq!(echoed, b"select 1;");
        });
    }

    #[test]
    fn test_tunnel_serves_concurrent_connections() {
        smol::block_on(async {
            let (target, _server) = echo_target().await;
            let tunnel = Tunnel::establish_with(Endpoint::new("127.0.0.1", 0), target, DirectRelay)
                .await
                .unwrap();
            let addr = tunnel.local_addr();

            let clients: Vec<_> = (0..8)
                .map(|i| {
                    let addr = addr.clone();
                    smol::spawn(async move {
                        let payload = format!("client-{}", i).into_bytes();
                        let echoed = round_trip(&addr, &payload).await.unwrap();
                        assert_eq!(echoed, payload);
                    })
                })
                .collect();

            for client in clients {
                client.await;
            }
        });
    }

    #[test]
    fn test_dial_failure_does_not_stop_tunnel() {
        smol::block_on(async {
            let (target, _server) = echo_target().await;
            let relay = Arc::new(ScriptedRelay::new(1));
            let tunnel = Tunnel::establish_with(Endpoint::new("127.0.0.1", 0), target.clone(), relay.clone())
                .await
                .unwrap();

            // First connection: the relay dial fails and the socket is closed
            let mut first = TcpStream::connect(tunnel.local_addr()).await.unwrap();
            let mut buf = Vec::new();
            let read = first.read_to_end(&mut buf).await;
            assert!(read.map(|n| n == 0).unwrap_or(true));

            // Second connection goes through
            let echoed = round_trip(&tunnel.local_addr(), b"ping").await.unwrap();
            assert_eq!(echoed, b"ping");

            assert_eq!(relay.dials.load(Ordering::SeqCst), 2);
            assert!(relay.targets.lock().unwrap().iter().all(|t| t == &target));
        });
    }

    #[test]
    fn test_half_close_keeps_other_direction() {
        smol::block_on(async {
            let (target, _server) = echo_target().await;
            let tunnel = Tunnel::establish_with(Endpoint::new("127.0.0.1", 0), target, DirectRelay)
                .await
                .unwrap();

            let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
            client.write_all(b"last words").await.unwrap();
            client.shutdown(std::net::Shutdown::Write).unwrap();

            let mut buf = Vec::new();
            client.read_to_end(&mut buf).await.unwrap();
            assert_eq!(buf, b"last words");
        });
    }

    #[test]
    fn test_close_releases_port() {
        smol::block_on(async {
            let (target, _server) = echo_target().await;
            let tunnel = Tunnel::establish_with(Endpoint::new("127.0.0.1", 0), target, DirectRelay)
                .await
                .unwrap();
            let addr = tunnel.local_addr();

            tunnel.close().await;
            smol::Timer::after(Duration::from_millis(50)).await;
            assert!(TcpStream::connect(&addr).await.is_err());
        });
    }

    #[test]
    fn test_listener_failure_ends_tunnel() {
        smol::block_on(async {
            let (target, _server) = echo_target().await;
            let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = inner.local_addr().unwrap().port();
            let listener = BreakingListener {
                inner,
                accepts: AtomicUsize::new(1),
            };

            let id = Uuid::new_v4();
            let mut tunnel = Tunnel::serve(
                id,
                "127.0.0.1".to_string(),
                port,
                target,
                listener,
                DirectRelay,
            );
            let addr = tunnel.local_addr();
            assert_eq!(tunnel.id(), id);

            // The connection accepted before the failure keeps working
            let echoed = round_trip(&addr, b"before").await.unwrap();
            assert_eq!(echoed, b"before");

            let waited = smol::future::or(async { Some(tunnel.wait().await) }, async {
                smol::Timer::after(Duration::from_secs(5)).await;
                None
            })
            .await;
            let err = waited.expect("accept loop did not end").unwrap_err();
            match err {
                Error::Accept { addr: failed, source } => {
                    assert_eq!(failed, addr);
                    assert_eq!(source.to_string(), "too many open files");
                }
                other => panic!("expected Accept, got {:?}", other),
            }

            // The listener went down with the loop
            assert!(TcpStream::connect(&addr).await.is_err());
            assert!(tunnel.wait().await.is_ok());
            tunnel.close().await;
        });
    }

    #[test]
    fn test_find_available_port() {
        smol::block_on(async {
            let port = find_available_port("127.0.0.1").await.unwrap();
            assert!(port >= 1);
        });
    }

    #[test]
    fn test_unresolvable_local_host() {
        smol::block_on(async {
            let result = Tunnel::establish_with(
                Endpoint::new("host.invalid", 0),
                Endpoint::new("127.0.0.1", 1),
                DirectRelay,
            )
            .await;
            assert!(result.is_err());
        });
    }
}
