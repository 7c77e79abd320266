//! Warehouse access for the books pipeline: credentials, a scoped session,
//! idempotent provisioning, staged bulk load and full-table reads.
//!
//! The warehouse is PostgreSQL. A "compute allocation" is realised as the
//! session `application_name`, a "staging area" as an unlogged table whose
//! text columns use server-side `pglz` compression (PostgreSQL 14+).

use std::path::Path;
use std::time::Duration;

use books_core::{ConversionError, ErrorKind, Listing, Price, Rating};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolCopyExt, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "books-warehouse";

pub const DEFAULT_COMPUTE: &str = "Book_WAREHOUSE";
pub const DEFAULT_DATABASE: &str = "book_db";
pub const DEFAULT_SCHEMA: &str = "book_schema";
pub const DEFAULT_TABLE: &str = "Books";
pub const DEFAULT_STAGE: &str = "books_staging";
pub const DEFAULT_PORT: u16 = 5432;

/// Header rows skipped by the bulk copy out of the staging area.
pub const SKIP_HEADER_ROWS: i64 = 1;

/// Database the session lands in before the target database exists.
const MAINTENANCE_DATABASE: &str = "postgres";

const COPY_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("credential {0} is not set")]
    MissingCredential(&'static str),
    #[error("invalid account identifier {0:?}")]
    InvalidAccount(String),
    #[error("connection failed ({step}): {source}")]
    Connection {
        step: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("provisioning failed ({step}): {source}")]
    Provisioning {
        step: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("load failed ({step}): {source}")]
    Load {
        step: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("reading {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("load verification failed: copied {copied} rows but {table} holds {counted}")]
    RowCountMismatch {
        table: String,
        copied: u64,
        counted: i64,
    },
    #[error("query failed ({step}): {source}")]
    Query {
        step: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("row {row}: column {column} is null")]
    NullColumn { row: usize, column: &'static str },
    #[error("row {row}: {source}")]
    Decode {
        row: usize,
        #[source]
        source: ConversionError,
    },
}

impl WarehouseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WarehouseError::MissingCredential(_)
            | WarehouseError::InvalidAccount(_)
            | WarehouseError::Connection { .. } => ErrorKind::Connection,
            WarehouseError::Provisioning { .. } => ErrorKind::Provisioning,
            WarehouseError::Load { .. }
            | WarehouseError::ReadFile { .. }
            | WarehouseError::RowCountMismatch { .. } => ErrorKind::Load,
            WarehouseError::Query { .. }
            | WarehouseError::NullColumn { .. }
            | WarehouseError::Decode { .. } => ErrorKind::Query,
        }
    }
}

/// Static credentials: account identifier (`host[:port]`), principal, secret.
#[derive(Clone, Serialize, Deserialize)]
pub struct WarehouseCredentials {
    pub account: String,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for WarehouseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseCredentials")
            .field("account", &self.account)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl WarehouseCredentials {
    /// Read `ACCOUNT`, `USER_NAME` and `PASSWORD`.
    pub fn from_env() -> Result<Self, WarehouseError> {
        fn required(name: &'static str) -> Result<String, WarehouseError> {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or(WarehouseError::MissingCredential(name))
        }
        Ok(Self {
            account: required("ACCOUNT")?,
            user: required("USER_NAME")?,
            password: required("PASSWORD")?,
        })
    }

    /// Split the account identifier into host and port.
    pub fn host_port(&self) -> Result<(String, u16), WarehouseError> {
        let account = self.account.trim();
        if account.is_empty() {
            return Err(WarehouseError::InvalidAccount(self.account.clone()));
        }
        match account.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => port
                .parse::<u16>()
                .map(|port| (host.to_string(), port))
                .map_err(|_| WarehouseError::InvalidAccount(self.account.clone())),
            Some(_) => Err(WarehouseError::InvalidAccount(self.account.clone())),
            None => Ok((account.to_string(), DEFAULT_PORT)),
        }
    }

    fn connect_options(&self, database: &str) -> Result<PgConnectOptions, WarehouseError> {
        let (host, port) = self.host_port()?;
        Ok(PgConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&self.user)
            .password(&self.password)
            .database(database))
    }
}

/// Names of the warehouse objects the jobs provision and read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseTarget {
    pub compute: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub stage: String,
}

impl Default for WarehouseTarget {
    fn default() -> Self {
        Self {
            compute: DEFAULT_COMPUTE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
            table: DEFAULT_TABLE.to_string(),
            stage: DEFAULT_STAGE.to_string(),
        }
    }
}

impl WarehouseTarget {
    /// Defaults overridden by `BOOKS_WAREHOUSE`, `BOOKS_DATABASE`, `BOOKS_SCHEMA`.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            compute: var("BOOKS_WAREHOUSE").unwrap_or(defaults.compute),
            database: var("BOOKS_DATABASE").unwrap_or(defaults.database),
            schema: var("BOOKS_SCHEMA").unwrap_or(defaults.schema),
            table: defaults.table,
            stage: defaults.stage,
        }
    }
}

/// Quote an identifier the way an unquoted warehouse name resolves:
/// case-folded to lower case, embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.to_ascii_lowercase().replace('"', "\"\""))
}

pub fn create_database_sql(database: &str) -> String {
    format!("CREATE DATABASE {}", quote_ident(database))
}

pub fn create_schema_sql(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema))
}

pub fn use_schema_sql(schema: &str) -> String {
    format!("SET search_path TO {}", quote_ident(schema))
}

pub fn replace_table_sql(table: &str) -> String {
    let table = quote_ident(table);
    format!(
        "DROP TABLE IF EXISTS {table}; \
         CREATE TABLE {table} (\
         title TEXT, \
         rating INTEGER, \
         price DOUBLE PRECISION, \
         availability BOOLEAN)"
    )
}

pub fn replace_stage_sql(stage: &str) -> String {
    let stage = quote_ident(stage);
    format!(
        "DROP TABLE IF EXISTS {stage}; \
         CREATE UNLOGGED TABLE {stage} (\
         line_no BIGINT GENERATED ALWAYS AS IDENTITY, \
         title TEXT COMPRESSION pglz, \
         rating TEXT COMPRESSION pglz, \
         price TEXT COMPRESSION pglz, \
         availability TEXT COMPRESSION pglz)"
    )
}

pub fn put_sql(stage: &str) -> String {
    format!(
        "COPY {} (title, rating, price, availability) FROM STDIN \
         WITH (FORMAT csv, DELIMITER ',', FORCE_NOT_NULL (title))",
        quote_ident(stage)
    )
}

pub fn copy_into_sql(table: &str, stage: &str) -> String {
    format!(
        "INSERT INTO {} (title, rating, price, availability) \
         SELECT title, rating::integer, price::double precision, availability::boolean \
         FROM {} WHERE line_no > $1 ORDER BY line_no",
        quote_ident(table),
        quote_ident(stage)
    )
}

pub fn select_all_sql(table: &str) -> String {
    format!("SELECT * FROM {}", quote_ident(table))
}

/// A single warehouse connection, held as a one-connection pool so session
/// settings (`application_name`, `search_path`) stay on the same backend.
/// Close it with [`WarehouseSession::close`].
pub struct WarehouseSession {
    pool: PgPool,
    credentials: WarehouseCredentials,
    compute: Option<String>,
}

impl WarehouseSession {
    /// Connect to `database`, or the maintenance database when `None`.
    pub async fn connect(
        credentials: &WarehouseCredentials,
        database: Option<&str>,
    ) -> Result<Self, WarehouseError> {
        let database = database.unwrap_or(MAINTENANCE_DATABASE);
        let options = credentials.connect_options(&quote_free_name(database))?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .map_err(|source| WarehouseError::Connection {
                step: "connect",
                source,
            })?;
        debug!(account = %credentials.account, database, "warehouse session opened");
        Ok(Self {
            pool,
            credentials: credentials.clone(),
            compute: None,
        })
    }

    pub async fn close(self) -> Result<(), WarehouseError> {
        self.pool.close().await;
        Ok(())
    }

    /// Close after a failure, logging instead of masking the original error.
    pub async fn close_quietly(self) {
        if let Err(err) = self.close().await {
            warn!(error = %err, "closing warehouse session after failure");
        }
    }

    /// Bind the session to a named compute allocation.
    pub async fn ensure_compute(&mut self, name: &str) -> Result<(), WarehouseError> {
        sqlx::query("SELECT set_config('application_name', $1, false)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|source| WarehouseError::Provisioning {
                step: format!("compute {name}"),
                source,
            })?;
        self.compute = Some(name.to_string());
        Ok(())
    }

    /// Create the database when absent. Returns whether it was created.
    pub async fn ensure_database(&self, name: &str) -> Result<bool, WarehouseError> {
        let step = || format!("database {name}");
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(quote_free_name(name))
                .fetch_one(&self.pool)
                .await
                .map_err(|source| WarehouseError::Provisioning {
                    step: step(),
                    source,
                })?;
        if exists {
            return Ok(false);
        }
        sqlx::raw_sql(&create_database_sql(name))
            .execute(&self.pool)
            .await
            .map_err(|source| WarehouseError::Provisioning {
                step: step(),
                source,
            })?;
        Ok(true)
    }

    /// Reconnect to `name`, carrying the compute binding over.
    pub async fn use_database(self, name: &str) -> Result<Self, WarehouseError> {
        let credentials = self.credentials.clone();
        let compute = self.compute.clone();
        self.close().await?;
        let mut session = Self::connect(&credentials, Some(name)).await?;
        if let Some(compute) = compute {
            if let Err(err) = session.ensure_compute(&compute).await {
                session.close_quietly().await;
                return Err(err);
            }
        }
        Ok(session)
    }

    pub async fn ensure_schema(&self, name: &str) -> Result<(), WarehouseError> {
        let step = || format!("schema {name}");
        sqlx::raw_sql(&create_schema_sql(name))
            .execute(&self.pool)
            .await
            .map_err(|source| WarehouseError::Provisioning {
                step: step(),
                source,
            })?;
        self.use_schema(name).await
    }

    pub async fn use_schema(&self, name: &str) -> Result<(), WarehouseError> {
        sqlx::raw_sql(&use_schema_sql(name))
            .execute(&self.pool)
            .await
            .map_err(|source| WarehouseError::Provisioning {
                step: format!("use schema {name}"),
                source,
            })?;
        Ok(())
    }

    /// Drop and recreate the destination table, discarding prior rows.
    pub async fn replace_table(&self, table: &str) -> Result<(), WarehouseError> {
        sqlx::raw_sql(&replace_table_sql(table))
            .execute(&self.pool)
            .await
            .map_err(|source| WarehouseError::Provisioning {
                step: format!("table {table}"),
                source,
            })?;
        Ok(())
    }

    pub async fn replace_stage(&self, stage: &str) -> Result<(), WarehouseError> {
        sqlx::raw_sql(&replace_stage_sql(stage))
            .execute(&self.pool)
            .await
            .map_err(|source| WarehouseError::Provisioning {
                step: format!("stage {stage}"),
                source,
            })?;
        Ok(())
    }

    /// Stream a CSV file into the staging area. Every line, header included,
    /// becomes one staged row. Returns the staged row count.
    pub async fn put_file(&self, stage: &str, path: &Path) -> Result<u64, WarehouseError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| WarehouseError::ReadFile {
                path: path.display().to_string(),
                source,
            })?;
        let step = || format!("put {} -> {stage}", path.display());

        let mut copy = self
            .pool
            .copy_in_raw(&put_sql(stage))
            .await
            .map_err(|source| WarehouseError::Load {
                step: step(),
                source,
            })?;
        for chunk in bytes.chunks(COPY_CHUNK_BYTES) {
            let sent = copy.send(chunk).await.map(|_| ());
            if let Err(source) = sent {
                let _ = copy.abort("upload interrupted").await;
                return Err(WarehouseError::Load {
                    step: step(),
                    source,
                });
            }
        }
        let staged = copy.finish().await.map_err(|source| WarehouseError::Load {
            step: step(),
            source,
        })?;
        debug!(stage, staged, bytes = bytes.len(), "file staged");
        Ok(staged)
    }

    /// Bulk copy staged rows into the table, skipping the header rows.
    pub async fn copy_into_table(
        &self,
        table: &str,
        stage: &str,
        skip_header: i64,
    ) -> Result<u64, WarehouseError> {
        let result = sqlx::query(&copy_into_sql(table, stage))
            .bind(skip_header)
            .execute(&self.pool)
            .await
            .map_err(|source| WarehouseError::Load {
                step: format!("copy {stage} -> {table}"),
                source,
            })?;
        Ok(result.rows_affected())
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64, WarehouseError> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&self.pool)
            .await
            .map_err(|source| WarehouseError::Query {
                step: format!("count {table}"),
                source,
            })
    }

    /// Unfiltered read of every row in `table`.
    pub async fn fetch_all_listings(&self, table: &str) -> Result<Vec<Listing>, WarehouseError> {
        let rows = sqlx::query(&select_all_sql(table))
            .fetch_all(&self.pool)
            .await
            .map_err(|source| WarehouseError::Query {
                step: format!("select {table}"),
                source,
            })?;

        let mut out = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let query_err = |source| WarehouseError::Query {
                step: format!("decode {table} row {idx}"),
                source,
            };
            let title: Option<String> = row.try_get("title").map_err(query_err)?;
            let rating: Option<i32> = row.try_get("rating").map_err(query_err)?;
            let price: Option<f64> = row.try_get("price").map_err(query_err)?;
            let availability: Option<bool> = row.try_get("availability").map_err(query_err)?;

            let null = |column| WarehouseError::NullColumn { row: idx, column };
            let decode = |source| WarehouseError::Decode { row: idx, source };
            out.push(Listing {
                title: title.ok_or_else(|| null("title"))?,
                rating: Rating::try_from(rating.ok_or_else(|| null("rating"))?).map_err(decode)?,
                price: Price::new(price.ok_or_else(|| null("price"))?).map_err(decode)?,
                availability: availability.ok_or_else(|| null("availability"))?,
            });
        }
        Ok(out)
    }
}

/// Catalogue names compare case-folded, matching [`quote_ident`].
fn quote_free_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Open a session on the target, read the whole table, and close the session
/// on every path.
pub async fn fetch_table(
    credentials: &WarehouseCredentials,
    target: &WarehouseTarget,
) -> Result<Vec<Listing>, WarehouseError> {
    let mut session = WarehouseSession::connect(credentials, Some(target.database.as_str())).await?;
    let result = read_table(&mut session, target).await;
    let closed = session.close().await;
    let listings = result?;
    closed?;
    info!(table = %target.table, rows = listings.len(), "table fetched");
    Ok(listings)
}

async fn read_table(
    session: &mut WarehouseSession,
    target: &WarehouseTarget,
) -> Result<Vec<Listing>, WarehouseError> {
    session.ensure_compute(&target.compute).await?;
    session.use_schema(&target.schema).await?;
    session.fetch_all_listings(&target.table).await
}
