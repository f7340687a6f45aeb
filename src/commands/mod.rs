pub mod sync;
pub mod watch;

use anyhow::{Context, Result, bail};
use dbsync::net::resolve_ipv4;
use dbsync::services::database::{ConnectionConfig, Driver};
use dbsync::ssh::{Endpoint, SshRelay, Tunnel};
use dbsync::Config;
use std::future::Future;

/// A configured server and how to reach it.
#[derive(Debug, Clone)]
pub struct Server {
    pub name: String,
    pub connection: ConnectionConfig,
}

/// A server plus the tunnel its connection goes through, if any.
pub struct Store {
    pub server: Server,
    pub tunnel: Option<Tunnel>,
}

impl Store {
    pub async fn open(config: &Config, name: &str) -> Result<Self> {
        let server = config.server(name)?;
        server.validate(name)?;

        let mut connection = server.connection_config();
        let mut tunnel = None;

        if server.ssh.tunnel_required() {
            let credential = server
                .ssh
                .credential()
                .with_context(|| format!("{} ssh credentials", name))?;
            let relay = SshRelay::new(server.ssh.relay(), credential)
                .with_host_key_policy(server.ssh.host_key_policy());

            let t = Tunnel::establish_with(Endpoint::new("127.0.0.1", 0), server.target(), relay)
                .await
                .with_context(|| format!("starting ssh tunnel for {}", name))?;

            tracing::info!(
                "SSH tunnel {} for {} started at {}:{}",
                t.id(),
                name,
                t.local_host(),
                t.local_port()
            );
            connection.redirect(t.local_host(), t.local_port());
            tunnel = Some(t);
        } else if connection.driver != Driver::Sqlite {
            let ip = resolve_ipv4(&connection.host)
                .await
                .with_context(|| format!("resolving {} host {}", name, connection.host))?;
            let port = connection.port;
            connection.redirect(ip.to_string(), port);
        }

        Ok(Self {
            server: Server {
                name: name.to_string(),
                connection,
            },
            tunnel,
        })
    }

    pub async fn close(self) {
        if let Some(tunnel) = self.tunnel {
            tunnel.close().await;
        }
    }
}

pub async fn open_pair(config: &Config, master: &str, slave: &str) -> Result<(Store, Store)> {
    let master = Store::open(config, master).await?;
    let slave = Store::open(config, slave).await?;

    let (m, s) = (&master.server, &slave.server);
    if m.connection.driver != s.connection.driver {
        bail!(
            "{} is {} but {} is {}",
            m.name,
            m.connection.driver,
            s.name,
            s.connection.driver
        );
    }

    Ok((master, slave))
}

/// Run `work` until it finishes or either tunnel's listener dies.
pub async fn until_tunnel_failure<F>(
    master: Option<&mut Tunnel>,
    slave: Option<&mut Tunnel>,
    work: F,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    smol::future::or(work, smol::future::or(tunnel_failure(master), tunnel_failure(slave))).await
}

async fn tunnel_failure(tunnel: Option<&mut Tunnel>) -> Result<()> {
    let Some(tunnel) = tunnel else {
        return std::future::pending().await;
    };
    tunnel
        .wait()
        .await
        .with_context(|| format!("ssh tunnel to {}", tunnel.target()))?;
    bail!("ssh tunnel to {} stopped", tunnel.target())
}
