//! External dump and restore tools.
//!
//! Dumps are produced by `mysqldump`, `pg_dump` or `sqlite3` and applied with
//! `mysql`, `psql` or `sqlite3`. Their output is opaque SQL text.

use crate::error::{Error, Result};
use crate::services::database::{ConnectionConfig, Driver};
use futures::AsyncWriteExt;
use smol::process::{Command, Output, Stdio};
use std::future::Future;
use std::path::PathBuf;

/// Produces create-equivalent SQL for a set of units.
pub trait DumpSource: Send + Sync {
    fn driver(&self) -> Driver;

    fn dump_tables(&self, tables: &[String]) -> impl Future<Output = Result<String>> + Send;
}

/// Dumps tables of one store with the engine's dump tool.
#[derive(Debug, Clone)]
pub struct Dumper {
    config: ConnectionConfig,
}

impl Dumper {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    fn command(&self, tables: &[String]) -> Result<Command> {
        let mut cmd = Command::new(find_tool(dump_tool(self.config.driver))?);
        cmd.args(dump_args(&self.config, tables));
        set_password(&mut cmd, &self.config);
        cmd.stdin(Stdio::null());
        Ok(cmd)
    }
}

impl DumpSource for Dumper {
    fn driver(&self) -> Driver {
        self.config.driver
    }

    async fn dump_tables(&self, tables: &[String]) -> Result<String> {
        let tool = dump_tool(self.config.driver);
        tracing::debug!("Dumping {} tables with {}", tables.len(), tool);

        let output = self
            .command(tables)?
            .output()
            .await
            .map_err(|e| tool_error(tool, e))?;
        let stdout = check_output(tool, output)?;
        let dump = compress_dump(&stdout);

        // sqlite3 .dump has no DROP before CREATE
        if self.config.driver == Driver::Sqlite {
            let drops: Vec<String> = tables
                .iter()
                .map(|t| format!("{};", self.config.driver.drop_table_statement(t)))
                .collect();
            return Ok(format!("{}\n{}", drops.join("\n"), dump));
        }

        Ok(dump)
    }
}

/// Applies SQL payloads to one store with the engine's client.
#[derive(Debug, Clone)]
pub struct Importer {
    config: ConnectionConfig,
}

impl Importer {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    pub async fn import(&self, payload: &str) -> Result<()> {
        let config = &self.config;
        let tool = import_tool(config.driver);

        let mut cmd = Command::new(find_tool(tool)?);
        cmd.args(import_args(config));
        set_password(&mut cmd, config);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| tool_error(tool, e))?;
        let stdin = child.stdin.take();

        // Feed stdin while the client's output is drained, so neither side
        // blocks on a full pipe.
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            stdin.write_all(payload.as_bytes()).await?;
            stdin.close().await
        };
        let (fed, output) = futures::join!(feed, child.output());

        let output = output.map_err(|e| tool_error(tool, e))?;
        // A client that bails early breaks the pipe; its stderr says why.
        check_output(tool, output)?;
        fed.map_err(|e| tool_error(tool, e))?;

        tracing::info!("Imported {} bytes into {}", payload.len(), config.schema);
        Ok(())
    }
}

fn connection_args(config: &ConnectionConfig) -> Vec<String> {
    let (port_flag, user_flag) = match config.driver {
        Driver::MySql => ("-P", "-u"),
        _ => ("-p", "-U"),
    };
    vec![
        "-h".to_string(),
        config.host.clone(),
        port_flag.to_string(),
        config.port.to_string(),
        user_flag.to_string(),
        config.username.clone(),
    ]
}

fn dump_args(config: &ConnectionConfig, tables: &[String]) -> Vec<String> {
    match config.driver {
        Driver::MySql => {
            let mut args = connection_args(config);
            args.push(config.schema.clone());
            args.extend(tables.iter().cloned());
            args
        }
        Driver::Postgres => {
            let mut args = connection_args(config);
            args.extend(["--clean", "--if-exists", "--no-owner"].map(String::from));
            for table in tables {
                args.push("-t".to_string());
                args.push(config.driver.quote_ident(table));
            }
            args.push(config.schema.clone());
            args
        }
        Driver::Sqlite => {
            let mut args = vec![config.schema.clone()];
            args.extend(
                tables
                    .iter()
                    .map(|t| format!(".dump {}", config.driver.quote_ident(t))),
            );
            args
        }
    }
}

fn import_args(config: &ConnectionConfig) -> Vec<String> {
    match config.driver {
        Driver::MySql => {
            let mut args = connection_args(config);
            args.push(config.schema.clone());
            args
        }
        Driver::Postgres => {
            let mut args = connection_args(config);
            args.extend(["-v", "ON_ERROR_STOP=1", "-q", "-d"].map(String::from));
            args.push(config.schema.clone());
            args
        }
        Driver::Sqlite => vec!["-bail".to_string(), config.schema.clone()],
    }
}

/// Passwords go through the environment, never argv.
fn set_password(cmd: &mut Command, config: &ConnectionConfig) {
    match config.driver {
        Driver::MySql => {
            cmd.env("MYSQL_PWD", &config.password);
        }
        Driver::Postgres => {
            cmd.env("PGPASSWORD", &config.password);
        }
        Driver::Sqlite => {}
    }
}

fn dump_tool(driver: Driver) -> &'static str {
    match driver {
        Driver::MySql => "mysqldump",
        Driver::Postgres => "pg_dump",
        Driver::Sqlite => "sqlite3",
    }
}

fn import_tool(driver: Driver) -> &'static str {
    match driver {
        Driver::MySql => "mysql",
        Driver::Postgres => "psql",
        Driver::Sqlite => "sqlite3",
    }
}

/// Look a tool up on `PATH`, falling back to `./bin/<name>`.
fn find_tool(name: &str) -> Result<PathBuf> {
    let on_path = std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    });
    if let Some(path) = on_path {
        return Ok(path);
    }

    let local = std::env::current_dir()?.join("bin").join(name);
    if local.is_file() {
        return Ok(local);
    }

    Err(Error::ExternalTool {
        tool: name.to_string(),
        message: "not found on PATH or in ./bin".to_string(),
    })
}

fn tool_error(tool: &str, err: std::io::Error) -> Error {
    Error::ExternalTool {
        tool: tool.to_string(),
        message: err.to_string(),
    }
}

fn check_output(tool: &str, output: Output) -> Result<String> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::ExternalTool {
            tool: tool.to_string(),
            message: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Strip `--` comment lines and blank lines from a dump.
pub fn compress_dump(sql: &str) -> String {
    sql.lines()
        .map(|line| line.trim_matches(' '))
        .filter(|line| !line.is_empty() && !line.starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_dump() {
        let dump = "-- MySQL dump 10.13\n--\n\n  DROP TABLE IF EXISTS `users`;  \nCREATE TABLE `users` (\n  `id` int\n);\n\n-- Dump completed\n";
        assert_eq!(
            compress_dump(dump),
            "DROP TABLE IF EXISTS `users`;\nCREATE TABLE `users` (\n`id` int\n);"
        );
        assert_eq!(compress_dump("--\n\n"), "");
    }

    #[test]
    fn test_missing_tool() {
        let err = find_tool("dbsync-no-such-tool").unwrap_err();
        assert!(matches!(err, Error::ExternalTool { ref tool, .. } if tool == "dbsync-no-such-tool"));
    }

    #[test]
    fn test_failed_exit_reports_stderr() {
        let output = Output {
            status: std::process::Command::new("sh")
                .args(["-c", "exit 2"])
                .status()
                .unwrap(),
            stdout: Vec::new(),
            stderr: b"Access denied\n".to_vec(),
        };
        let err = check_output("mysqldump", output).unwrap_err();
        assert!(err.to_string().starts_with("mysqldump: "));
        assert!(err.to_string().ends_with("Access denied"));
    }

    fn remote(driver: Driver) -> ConnectionConfig {
        ConnectionConfig {
            driver,
            username: "sync".to_string(),
            password: "secret".to_string(),
            host: "127.0.0.1".to_string(),
            port: 40123,
            schema: "shop".to_string(),
        }
    }

    fn sqlite_at(path: &std::path::Path) -> ConnectionConfig {
        ConnectionConfig {
            driver: Driver::Sqlite,
            username: String::new(),
            password: String::new(),
            host: String::new(),
            port: 0,
            schema: path.to_string_lossy().to_string(),
        }
    }

    #[test]
    fn test_mysql_args() {
        let config = remote(Driver::MySql);
        let tables = ["users".to_string(), "orders".to_string()];
        assert_eq!(
            dump_args(&config, &tables),
            ["-h", "127.0.0.1", "-P", "40123", "-u", "sync", "shop", "users", "orders"]
        );
        assert_eq!(
            import_args(&config),
            ["-h", "127.0.0.1", "-P", "40123", "-u", "sync", "shop"]
        );
    }

    #[test]
    fn test_postgres_args_use_role_flag() {
        let config = remote(Driver::Postgres);
        assert_eq!(
            dump_args(&config, &["users".to_string()]),
            [
                "-h", "127.0.0.1", "-p", "40123", "-U", "sync", "--clean", "--if-exists",
                "--no-owner", "-t", "\"users\"", "shop",
            ]
        );
        assert_eq!(
            import_args(&config),
            [
                "-h", "127.0.0.1", "-p", "40123", "-U", "sync", "-v", "ON_ERROR_STOP=1", "-q",
                "-d", "shop",
            ]
        );
        assert!(!dump_args(&config, &[]).contains(&"-u".to_string()));
    }

    #[test]
    fn test_sqlite_args() {
        let config = sqlite_at(std::path::Path::new("/tmp/shop.db"));
        assert_eq!(
            dump_args(&config, &["users".to_string()]),
            ["/tmp/shop.db", ".dump \"users\""]
        );
        assert_eq!(import_args(&config), ["-bail", "/tmp/shop.db"]);
    }

    #[test]
    fn test_import_with_large_output_completes() {
        if find_tool("sqlite3").is_err() {
            return;
        }

        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let importer = Importer::new(sqlite_at(&dir.path().join("chatty.db")));

            // Far more output than a pipe buffer holds
            let line = format!("SELECT '{}';\n", "x".repeat(200));
            let payload = line.repeat(20_000);

            let finished = smol::future::or(
                async { Some(importer.import(&payload).await) },
                async {
                    smol::Timer::after(std::time::Duration::from_secs(60)).await;
                    None
                },
            )
            .await;
            finished.expect("import stalled").unwrap();
        });
    }

    #[test]
    fn test_import_bail_reports_stderr() {
        if find_tool("sqlite3").is_err() {
            return;
        }

        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let importer = Importer::new(sqlite_at(&dir.path().join("bail.db")));

            // The client exits on the first statement and stops reading
            let mut payload = "INSERT INTO missing VALUES (1);\n".to_string();
            payload.push_str(&"SELECT 1;\n".repeat(400_000));

            let err = importer.import(&payload).await.unwrap_err();
            assert!(matches!(err, Error::ExternalTool { ref tool, .. } if tool == "sqlite3"));
            assert!(err.to_string().contains("no such table"), "{}", err);
        });
    }

    #[test]
    fn test_sqlite_dump_and_import() {
        if find_tool("sqlite3").is_err() {
            return;
        }

        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let master = dir.path().join("master.db");
            let slave = dir.path().join("slave.db");
            let config = sqlite_at;

            Importer::new(config(&master))
                .import("CREATE TABLE users (id INTEGER, name TEXT); INSERT INTO users VALUES (1, 'ada');")
                .await
                .unwrap();

            let dumper = Dumper::new(config(&master));
            let sql = dumper.dump_tables(&["users".to_string()]).await.unwrap();
            assert!(sql.contains("CREATE TABLE"));
            assert!(sql.contains("'ada'"));
            assert!(sql.starts_with("DROP TABLE IF EXISTS \"users\";"));

            // Applying twice re-creates the table instead of failing
            let importer = Importer::new(config(&slave));
            importer.import(&sql).await.unwrap();
            importer.import(&sql).await.unwrap();
        });
    }
}
