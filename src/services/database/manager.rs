use super::checksum::{ChecksumSource, EMPTY_CHECKSUM};
use super::types::{ConnectionConfig, Driver};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Row};
use std::str::FromStr;
use std::time::Duration;

/// An open pool to one store.
#[derive(Debug, Clone)]
pub enum StorePool {
    MySql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// One store connection, opened once and reused for every checksum pass.
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    pool: StorePool,
}

impl DatabaseManager {
    pub fn new(pool: StorePool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let pool = match config.driver {
            Driver::MySql => {
                let options = MySqlConnectOptions::new()
                    .host(&config.host)
                    .port(config.port)
                    .username(&config.username)
                    .password(&config.password)
                    .database(&config.schema);

                let pool = MySqlPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(Duration::from_secs(5))
                    .after_connect(|conn, _meta| {
                        Box::pin(async move {
                            // GROUP_CONCAT silently truncates at 1024 bytes by default.
                            // max_allowed_packet still caps the result.
                            conn.execute("SET SESSION group_concat_max_len = 18446744073709551615")
                                .await?;
                            Ok(())
                        })
                    })
                    .connect_with(options)
                    .await?;
                StorePool::MySql(pool)
            }
            Driver::Postgres => {
                let options = PgConnectOptions::new()
                    .host(&config.host)
                    .port(config.port)
                    .username(&config.username)
                    .password(&config.password)
                    .database(&config.schema);

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect_with(options)
                    .await?;
                StorePool::Postgres(pool)
            }
            Driver::Sqlite => {
                let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.schema))?;
                StorePool::Sqlite(Self::sqlite_pool(options).await?)
            }
        };

        tracing::info!(
            "Connected to {} store {} at {}:{}",
            config.driver,
            config.schema,
            config.host,
            config.port
        );

        Ok(Self { pool })
    }

    /// A single-connection in-memory SQLite store.
    pub async fn sqlite_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Ok(Self::new(StorePool::Sqlite(Self::sqlite_pool(options).await?)))
    }

    async fn sqlite_pool(options: SqliteConnectOptions) -> Result<SqlitePool> {
        // One long-lived connection, otherwise an in-memory database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    pub fn driver(&self) -> Driver {
        match self.pool {
            StorePool::MySql(_) => Driver::MySql,
            StorePool::Postgres(_) => Driver::Postgres,
            StorePool::Sqlite(_) => Driver::Sqlite,
        }
    }

    pub async fn test_connection(&self) -> Result<()> {
        match &self.pool {
            StorePool::MySql(pool) => {
                sqlx::query("SELECT 1").fetch_one(pool).await?;
            }
            StorePool::Postgres(pool) => {
                sqlx::query("SELECT 1").fetch_one(pool).await?;
            }
            StorePool::Sqlite(pool) => {
                sqlx::query("SELECT 1").fetch_one(pool).await?;
            }
        }
        Ok(())
    }

    /// Run a statement that returns no rows.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let affected = match &self.pool {
            StorePool::MySql(pool) => sqlx::raw_sql(sql).execute(pool).await?.rows_affected(),
            StorePool::Postgres(pool) => sqlx::raw_sql(sql).execute(pool).await?.rows_affected(),
            StorePool::Sqlite(pool) => sqlx::raw_sql(sql).execute(pool).await?.rows_affected(),
        };
        Ok(affected)
    }

    pub async fn close(&self) {
        match &self.pool {
            StorePool::MySql(pool) => pool.close().await,
            StorePool::Postgres(pool) => pool.close().await,
            StorePool::Sqlite(pool) => pool.close().await,
        }
    }

    async fn get_tables(&self) -> Result<Vec<String>> {
        let tables = match &self.pool {
            StorePool::MySql(pool) => {
                let query = r#"
                    SELECT CAST(table_name AS CHAR) AS name
                    FROM information_schema.tables
                    WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'
                    ORDER BY table_name
                "#;
                sqlx::query(query)
                    .fetch_all(pool)
                    .await?
                    .into_iter()
                    .map(|row| row.try_get("name"))
                    .collect::<std::result::Result<_, _>>()?
            }
            StorePool::Postgres(pool) => {
                let query = r#"
                    SELECT table_name::text AS name
                    FROM information_schema.tables
                    WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'
                    ORDER BY table_name
                "#;
                sqlx::query(query)
                    .fetch_all(pool)
                    .await?
                    .into_iter()
                    .map(|row| row.try_get("name"))
                    .collect::<std::result::Result<_, _>>()?
            }
            StorePool::Sqlite(pool) => {
                let query = r#"
                    SELECT name
                    FROM sqlite_master
                    WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                    ORDER BY name
                "#;
                sqlx::query(query)
                    .fetch_all(pool)
                    .await?
                    .into_iter()
                    .map(|row| row.try_get("name"))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        Ok(tables)
    }

    async fn get_table_columns(&self, table: &str) -> Result<Vec<String>> {
        let columns = match &self.pool {
            StorePool::MySql(pool) => {
                let query = r#"
                    SELECT CAST(column_name AS CHAR) AS name
                    FROM information_schema.columns
                    WHERE table_schema = DATABASE() AND table_name = ?
                    ORDER BY ordinal_position
                "#;
                sqlx::query(query)
                    .bind(table)
                    .fetch_all(pool)
                    .await?
                    .into_iter()
                    .map(|row| row.try_get("name"))
                    .collect::<std::result::Result<Vec<String>, _>>()?
            }
            StorePool::Sqlite(pool) => {
                sqlx::query("SELECT name FROM pragma_table_info(?) ORDER BY cid")
                    .bind(table)
                    .fetch_all(pool)
                    .await?
                    .into_iter()
                    .map(|row| row.try_get("name"))
                    .collect::<std::result::Result<Vec<String>, _>>()?
            }
            StorePool::Postgres(_) => {
                return Err(Error::Unsupported(
                    "postgres checksums hash whole rows".to_string(),
                ));
            }
        };

        if columns.is_empty() {
            return Err(Error::UnitNotFound(table.to_string()));
        }
        Ok(columns)
    }

    async fn table_checksum(&self, table: &str) -> Result<String> {
        let driver = self.driver();
        let quoted = driver.quote_ident(table);

        match &self.pool {
            StorePool::MySql(pool) => {
                let columns = self.get_table_columns(table).await?;
                let query = mysql_checksum_query(table, &columns);
                let row = sqlx::query(&query).fetch_one(pool).await?;
                mysql_hash(table, row.try_get("row_count")?, row.try_get("hash")?)
            }
            StorePool::Postgres(pool) => {
                let query = format!(
                    "SELECT COALESCE(MD5(STRING_AGG(t::text, ',')), '') AS hash FROM {} AS t",
                    quoted
                );
                let row = sqlx::query(&query).fetch_one(pool).await?;
                Ok(row.try_get("hash")?)
            }
            StorePool::Sqlite(pool) => {
                let columns = self.get_table_columns(table).await?;
                let row_expr = columns
                    .iter()
                    .map(|c| format!("QUOTE({})", driver.quote_ident(c)))
                    .collect::<Vec<_>>()
                    .join(" || ");
                let query = format!(
                    "SELECT GROUP_CONCAT({}, ',') AS agg FROM {}",
                    row_expr, quoted
                );
                let row = sqlx::query(&query).fetch_one(pool).await?;
                let aggregate: Option<String> = row.try_get("agg")?;
                Ok(aggregate.map_or_else(|| EMPTY_CHECKSUM.to_string(), |a| sha256_hex(&a)))
            }
        }
    }
}

/// GROUP_CONCAT skips rows where any argument is NULL, so every column is
/// passed through QUOTE(), which renders NULL as the bare word `NULL`.
fn mysql_checksum_query(table: &str, columns: &[String]) -> String {
    let row_expr = columns
        .iter()
        .map(|c| format!("QUOTE({})", Driver::MySql.quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT COUNT(*) AS row_count, CAST(MD5(GROUP_CONCAT(CONCAT_WS(',', {}))) AS CHAR) AS hash FROM {}",
        row_expr,
        Driver::MySql.quote_ident(table)
    )
}

/// With every column quoted, a NULL aggregate over a non-empty table means
/// the result hit `max_allowed_packet`.
fn mysql_hash(table: &str, row_count: i64, hash: Option<String>) -> Result<String> {
    match hash {
        Some(hash) => Ok(hash),
        None if row_count == 0 => Ok(EMPTY_CHECKSUM.to_string()),
        None => Err(Error::ChecksumOverflow(table.to_string())),
    }
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

impl ChecksumSource for DatabaseManager {
    async fn list_units(&self) -> Result<Vec<String>> {
        self.get_tables().await
    }

    async fn unit_checksum(&self, unit: &str) -> Result<String> {
        self.table_checksum(unit).await
    }
}
