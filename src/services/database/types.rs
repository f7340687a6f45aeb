use serde::{Deserialize, Serialize};
use std::fmt;

/// Which database engine a store runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[default]
    MySql,
    Postgres,
    Sqlite,
}

impl Driver {
    /// Quote an identifier for this engine.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Driver::MySql => format!("`{}`", ident.replace('`', "``")),
            Driver::Postgres | Driver::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    pub fn drop_table_statement(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_ident(table))
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Driver::MySql => "mysql",
            Driver::Postgres => "postgres",
            Driver::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

/// Where and how to connect to one store. For SQLite, `schema` is the
/// database file path (or `:memory:`).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub driver: Driver,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub schema: String,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("driver", &self.driver)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("schema", &self.schema)
            .finish()
    }
}

impl ConnectionConfig {
    /// Point the connection at a different host and port, e.g. a tunnel.
    pub fn redirect(&mut self, host: impl Into<String>, port: u16) {
        self.host = host.into();
        self.port = port;
    }
}
