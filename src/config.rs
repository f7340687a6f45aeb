//! `dbsync` configuration file.
//!
//! ```json
//! {
//!   "servers": {
//!     "prod": {
//!       "driver": "mysql",
//!       "username": "root", "password": "secret",
//!       "host": "10.0.0.5", "port": 3306, "schema": "shop",
//!       "ssh": { "host": "bastion.example.com", "port": 22, "user": "deploy",
//!                "key": "~/.ssh/id_ed25519" }
//!     }
//!   }
//! }
//! ```

use crate::error::{Error, Result};
use crate::services::database::{ConnectionConfig, Driver};
use crate::services::ssh::{Credential, Endpoint, HostKeyPolicy, expand_home};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const LOCAL_CONFIG: &str = ".dbsync.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub driver: Driver,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub schema: String,
    pub ssh: SshConfig,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key: Option<String>,
    pub passphrase: Option<String>,
    pub known_hosts: Option<String>,
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("key", &self.key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("known_hosts", &self.known_hosts)
            .finish()
    }
}

impl Config {
    /// Load from `path`, or from the first of `./.dbsync.json` and
    /// `~/.dbsync/config.json` that exists.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path().ok_or_else(|| {
                Error::ConfigInvalid(vec![format!(
                    "no config file found (looked for ./{} and ~/.dbsync/config.json)",
                    LOCAL_CONFIG
                )])
            })?,
        };

        tracing::debug!("Loading config from {}", path.display());
        let content = async_fs::read_to_string(&path).await?;
        Self::parse(&content).map_err(|e| match e {
            Error::ConfigInvalid(mut problems) => {
                for problem in problems.iter_mut() {
                    *problem = format!("{}: {}", path.display(), problem);
                }
                Error::ConfigInvalid(problems)
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::ConfigInvalid(vec![e.to_string()]))
    }

    fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.is_file() {
            return Some(local);
        }

        let home = dirs::home_dir()?.join(".dbsync").join("config.json");
        home.is_file().then_some(home)
    }

    pub fn server(&self, name: &str) -> Result<&ServerConfig> {
        self.servers
            .get(name)
            .ok_or_else(|| Error::ConfigInvalid(vec![format!("server `{}` not found in config", name)]))
    }
}

impl ServerConfig {
    /// Check every required field, reporting all problems at once.
    pub fn validate(&self, name: &str) -> Result<()> {
        let mut problems = Vec::new();

        if self.driver != Driver::Sqlite {
            if self.username.is_empty() {
                problems.push(format!("{}: username is required", name));
            }
            if self.host.is_empty() {
                problems.push(format!("{}: host is required", name));
            }
            if self.port == 0 {
                problems.push(format!("{}: port is invalid", name));
            }
        }
        if self.schema.is_empty() {
            problems.push(format!("{}: schema is required", name));
        }

        if self.ssh.is_configured() {
            if self.ssh.user.is_empty() {
                problems.push(format!("{}: ssh user is required", name));
            }
            if self.ssh.host.is_empty() {
                problems.push(format!("{}: ssh host is required", name));
            }
            if self.ssh.port == 0 {
                problems.push(format!("{}: ssh port is invalid", name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigInvalid(problems))
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            driver: self.driver,
            username: self.username.clone(),
            password: self.password.clone(),
            host: self.host.clone(),
            port: self.port,
            schema: self.schema.clone(),
        }
    }

    /// Where the tunnel should forward to, as seen from the relay.
    pub fn target(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port)
    }
}

impl SshConfig {
    fn is_configured(&self) -> bool {
        !self.host.is_empty()
            || !self.user.is_empty()
            || self.port > 0
            || self.key.is_some()
            || self.passphrase.is_some()
            || self.known_hosts.is_some()
    }

    pub fn tunnel_required(&self) -> bool {
        !self.host.is_empty() && !self.user.is_empty() && self.port > 0
    }

    pub fn relay(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port).with_user(&self.user)
    }

    /// Key file when `key` is set, otherwise the ssh agent.
    pub fn credential(&self) -> Result<Credential> {
        Credential::resolve(self.key.as_deref(), self.passphrase.clone())
    }

    pub fn host_key_policy(&self) -> HostKeyPolicy {
        match &self.known_hosts {
            Some(path) => HostKeyPolicy::KnownHosts(expand_home(path)),
            None => HostKeyPolicy::AcceptAny,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "servers": {
            "prod": {
                "username": "root", "password": "secret",
                "host": "10.0.0.5", "port": 3306, "schema": "shop",
                "ssh": { "host": "bastion", "port": 22, "user": "deploy", "key": "~/.ssh/id_ed25519" }
            },
            "local": {
                "driver": "postgres",
                "username": "postgres", "password": "",
                "host": "localhost", "port": 5432, "schema": "shop"
            }
        }
    }"#;

    #[test]
    fn test_parse_servers() {
        let config = Config::parse(SAMPLE).unwrap();

        let prod = config.server("prod").unwrap();
        assert_eq!(prod.driver, Driver::MySql);
        assert!(prod.ssh.tunnel_required());
        assert_eq!(prod.ssh.relay().ssh_destination(), "deploy@bastion");
        assert_eq!(prod.target().to_string(), "10.0.0.5:3306");
        prod.validate("prod").unwrap();

        let local = config.server("local").unwrap();
        assert_eq!(local.driver, Driver::Postgres);
        assert!(!local.ssh.tunnel_required());
        assert_eq!(local.ssh.host_key_policy(), HostKeyPolicy::AcceptAny);
        local.validate("local").unwrap();
    }

    #[test]
    fn test_unknown_server() {
        let config = Config::parse(SAMPLE).unwrap();
        let err = config.server("staging").unwrap_err();
        assert!(err.to_string().contains("`staging`"));
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let server = ServerConfig {
            ssh: SshConfig {
                host: "bastion".into(),
                ..Default::default()
            },
            ..Default::default()
        };

        let Err(Error::ConfigInvalid(problems)) = server.validate("slave") else {
            panic!("expected ConfigInvalid");
        };
        assert_eq!(
            problems,
            vec![
                "slave: username is required",
                "slave: host is required",
                "slave: port is invalid",
                "slave: schema is required",
                "slave: ssh user is required",
                "slave: ssh port is invalid",
            ]
        );
    }

    #[test]
    fn test_partial_ssh_block_is_rejected() {
        let base = ServerConfig {
            driver: Driver::Sqlite,
            schema: "/tmp/shop.db".into(),
            ..Default::default()
        };
        let partial = [
            SshConfig {
                key: Some("~/.ssh/id_ed25519".into()),
                ..Default::default()
            },
            SshConfig {
                passphrase: Some("hunter2".into()),
                ..Default::default()
            },
            SshConfig {
                known_hosts: Some("~/.ssh/known_hosts".into()),
                ..Default::default()
            },
        ];

        for ssh in partial {
            let server = ServerConfig { ssh, ..base.clone() };
            let Err(Error::ConfigInvalid(problems)) = server.validate("edge") else {
                panic!("expected ConfigInvalid");
            };
            assert_eq!(
                problems,
                vec![
                    "edge: ssh user is required",
                    "edge: ssh host is required",
                    "edge: ssh port is invalid",
                ]
            );
        }
    }

    #[test]
    fn test_sqlite_needs_only_schema() {
        let server = ServerConfig {
            driver: Driver::Sqlite,
            schema: "/tmp/shop.db".into(),
            ..Default::default()
        };
        server.validate("file").unwrap();
    }

    #[test]
    fn test_known_hosts_policy() {
        let ssh = SshConfig {
            known_hosts: Some("/etc/ssh/ssh_known_hosts".into()),
            ..Default::default()
        };
        assert_eq!(
            ssh.host_key_policy(),
            HostKeyPolicy::KnownHosts(PathBuf::from("/etc/ssh/ssh_known_hosts"))
        );
    }

    #[test]
    fn test_debug_redacts_passphrase() {
        let ssh = SshConfig {
            passphrase: Some("hunter2".into()),
            ..Default::default()
        };
        assert!(!format!("{:?}", ssh).contains("hunter2"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = smol::block_on(Config::load(Some(file.path()))).unwrap();
        assert_eq!(config.servers.len(), 2);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ \"servers\": ").unwrap();

        let err = smol::block_on(Config::load(Some(file.path()))).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
