//! Database abstraction, PostgreSQL backend, TLS support and connection retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_postgres::{Client, SimpleQueryMessage};

use crate::change::Statement;
use crate::config::{DatabaseConfig, SslMode};
use crate::error::{Result, TidemarkError};

/// Quote a SQL identifier to prevent SQL injection.
///
/// Doubles any embedded double-quotes and wraps in double-quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate that a SQL identifier contains only safe characters.
///
/// Returns an error for names with characters outside `[a-zA-Z0-9_]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TidemarkError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(TidemarkError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}

/// Capabilities reported by a backend once it is connected.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    /// Dialect name matched by `dbms` filters and preconditions (e.g. `postgresql`).
    pub dialect: String,
    pub version: String,
    pub default_schema: String,
    /// Whether DDL statements participate in transactions.
    pub supports_ddl_transactions: bool,
}

/// A target database the engine can execute statements against.
///
/// `begin`, `commit` and `rollback` bracket one transaction on the
/// underlying session. `rollback` is a no-op when no transaction is open.
#[async_trait]
pub trait Database: Send + Sync {
    fn info(&self) -> &DatabaseInfo;

    async fn execute(&self, statement: &Statement) -> Result<()>;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn current_user(&self) -> Result<String>;

    async fn table_exists(&self, schema: Option<&str>, table: &str) -> Result<bool>;

    async fn column_exists(&self, schema: Option<&str>, table: &str, column: &str)
        -> Result<bool>;

    async fn view_exists(&self, schema: Option<&str>, view: &str) -> Result<bool>;

    async fn index_exists(&self, schema: Option<&str>, index: &str) -> Result<bool>;

    async fn sequence_exists(&self, schema: Option<&str>, sequence: &str) -> Result<bool>;

    async fn row_count(&self, schema: Option<&str>, table: &str) -> Result<i64>;

    /// Run a query and return the first column of the first row as text.
    async fn query_scalar(&self, sql: &str) -> Result<Option<String>>;

    /// Verify the session is still usable.
    async fn check_connection(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL backend
// ---------------------------------------------------------------------------

/// PostgreSQL implementation of [`Database`] over one client session.
pub struct PostgresDatabase {
    client: Arc<Client>,
    info: DatabaseInfo,
    in_transaction: AtomicBool,
}

impl PostgresDatabase {
    /// Connect using the database section of the configuration and verify the server responds.
    pub async fn connect(config: &DatabaseConfig, conn_string: &str) -> Result<Self> {
        let client = connect_with_full_config(
            conn_string,
            &config.ssl_mode,
            config.connect_retries,
            config.connect_timeout_secs,
            config.statement_timeout_secs,
            config.keepalive_secs,
        )
        .await?;
        Self::from_client(Arc::new(client)).await
    }

    /// Wrap an existing client, probing version and default schema.
    pub async fn from_client(client: Arc<Client>) -> Result<Self> {
        let row = client.query_one("SHOW server_version", &[]).await?;
        let version: String = row.get(0);
        let row = client.query_one("SELECT current_schema()", &[]).await?;
        let default_schema: Option<String> = row.get(0);
        let info = DatabaseInfo {
            dialect: "postgresql".to_string(),
            version,
            default_schema: default_schema.unwrap_or_else(|| "public".to_string()),
            supports_ddl_transactions: true,
        };
        log::debug!(
            "Connected to database; dialect={}, version={}, schema={}",
            info.dialect,
            info.version,
            info.default_schema
        );
        Ok(Self {
            client,
            info,
            in_transaction: AtomicBool::new(false),
        })
    }

    /// The shared client, for the ledger and lock stores.
    pub fn client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }

    fn schema<'a>(&'a self, schema: Option<&'a str>) -> &'a str {
        schema.unwrap_or(&self.info.default_schema)
    }

    async fn exists(&self, sql: &str, params: &[&str]) -> Result<bool> {
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params
            .iter()
            .map(|s| s as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();
        let row = self.client.query_one(sql, &params).await?;
        Ok(row.get::<_, bool>(0))
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn info(&self) -> &DatabaseInfo {
        &self.info
    }

    async fn execute(&self, statement: &Statement) -> Result<()> {
        log::debug!("Executing statement; sql={}", statement.sql());
        self.client.batch_execute(statement.sql()).await?;
        Ok(())
    }

    async fn begin(&self) -> Result<()> {
        self.client.batch_execute("BEGIN").await?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.in_transaction.store(false, Ordering::SeqCst);
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            self.client.batch_execute("ROLLBACK").await?;
        }
        Ok(())
    }

    async fn current_user(&self) -> Result<String> {
        let row = self.client.query_one("SELECT current_user", &[]).await?;
        Ok(row.get::<_, String>(0))
    }

    async fn check_connection(&self) -> Result<()> {
        check_connection(&self.client).await
    }

    async fn table_exists(&self, schema: Option<&str>, table: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2 AND table_type = 'BASE TABLE')",
            &[self.schema(schema), table],
        )
        .await
    }

    async fn column_exists(
        &self,
        schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 AND column_name = $3)",
            &[self.schema(schema), table, column],
        )
        .await
    }

    async fn view_exists(&self, schema: Option<&str>, view: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM information_schema.views \
             WHERE table_schema = $1 AND table_name = $2)",
            &[self.schema(schema), view],
        )
        .await
    }

    async fn index_exists(&self, schema: Option<&str>, index: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM pg_indexes WHERE schemaname = $1 AND indexname = $2)",
            &[self.schema(schema), index],
        )
        .await
    }

    async fn sequence_exists(&self, schema: Option<&str>, sequence: &str) -> Result<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM information_schema.sequences \
             WHERE sequence_schema = $1 AND sequence_name = $2)",
            &[self.schema(schema), sequence],
        )
        .await
    }

    async fn row_count(&self, schema: Option<&str>, table: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.{}",
            quote_ident(self.schema(schema)),
            quote_ident(table)
        );
        let row = self.client.query_one(&sql, &[]).await?;
        Ok(row.get::<_, i64>(0))
    }

    async fn query_scalar(&self, sql: &str) -> Result<Option<String>> {
        for message in self.client.simple_query(sql).await? {
            if let SimpleQueryMessage::Row(row) = message {
                return Ok(row.get(0).map(str::to_string));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Connection setup
// ---------------------------------------------------------------------------

/// Build a rustls ClientConfig using the Mozilla CA bundle and ring crypto provider.
fn make_rustls_config() -> Result<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TidemarkError::ConfigError(format!("TLS setup failed: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

/// Check if a postgres error is a permanent authentication failure that should not be retried.
fn is_permanent_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        return code == "28P01" || code == "28000";
    }
    false
}

/// Inject TCP keepalive parameters into a connection string if not already present.
///
/// For URL-style strings (`postgres://...`), appends `?keepalives=1&keepalives_idle=N`
/// (or `&` if `?` already exists). For key=value style, appends ` keepalives=1 keepalives_idle=N`.
/// Returns the string unchanged if `keepalive_secs == 0` or keepalive params already exist.
pub fn inject_keepalive(conn_string: &str, keepalive_secs: u32) -> String {
    if keepalive_secs == 0 {
        return conn_string.to_string();
    }
    let lower = conn_string.to_lowercase();
    if lower.contains("keepalives") {
        return conn_string.to_string();
    }
    let params = format!("keepalives=1&keepalives_idle={}", keepalive_secs);
    if conn_string.starts_with("postgres://") || conn_string.starts_with("postgresql://") {
        if conn_string.contains('?') {
            format!("{}&{}", conn_string, params)
        } else {
            format!("{}?{}", conn_string, params)
        }
    } else {
        format!(
            "{} keepalives=1 keepalives_idle={}",
            conn_string, keepalive_secs
        )
    }
}

/// Run the connection driver on the tokio runtime, logging errors.
fn spawn_connection_task<F>(connection: F)
where
    F: std::future::Future<Output = std::result::Result<(), tokio_postgres::Error>>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::error!("Database connection error: {}", e);
        }
    });
}

async fn connect_once(
    conn_string: &str,
    ssl_mode: &SslMode,
    tls_config: Option<&rustls::ClientConfig>,
    connect_timeout_secs: u32,
) -> std::result::Result<Client, tokio_postgres::Error> {
    let connect_fut = async {
        match (ssl_mode, tls_config) {
            (SslMode::Require, Some(tls_config)) => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config.clone());
                let (client, connection) = tokio_postgres::connect(conn_string, tls).await?;
                spawn_connection_task(connection);
                Ok(client)
            }
            (SslMode::Prefer, Some(tls_config)) => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config.clone());
                match tokio_postgres::connect(conn_string, tls).await {
                    Ok((client, connection)) => {
                        spawn_connection_task(connection);
                        Ok(client)
                    }
                    Err(_) => {
                        log::debug!("TLS connection failed, falling back to plaintext");
                        let (client, connection) =
                            tokio_postgres::connect(conn_string, tokio_postgres::NoTls).await?;
                        spawn_connection_task(connection);
                        Ok(client)
                    }
                }
            }
            _ => {
                let (client, connection) =
                    tokio_postgres::connect(conn_string, tokio_postgres::NoTls).await?;
                spawn_connection_task(connection);
                Ok(client)
            }
        }
    };

    if connect_timeout_secs > 0 {
        match tokio::time::timeout(
            std::time::Duration::from_secs(connect_timeout_secs as u64),
            connect_fut,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(tokio_postgres::Error::__private_api_timeout()),
        }
    } else {
        connect_fut.await
    }
}

/// Connect to the database, retrying up to `retries` times with exponential backoff + jitter.
///
/// Each retry waits `min(2^attempt, 30) + rand(0..1000ms)` before the next attempt.
/// Permanent errors (authentication failures) are not retried.
pub async fn connect_with_full_config(
    conn_string: &str,
    ssl_mode: &SslMode,
    retries: u32,
    connect_timeout_secs: u32,
    statement_timeout_secs: u32,
    keepalive_secs: u32,
) -> Result<Client> {
    let conn_string = inject_keepalive(conn_string, keepalive_secs);
    let tls_config = match ssl_mode {
        SslMode::Disable => None,
        SslMode::Prefer | SslMode::Require => Some(make_rustls_config()?),
    };
    let mut last_err = None;

    for attempt in 0..=retries {
        if attempt > 0 {
            let base_delay = std::cmp::min(1u64 << attempt, 30);
            let jitter_ms = fastrand::u64(0..1000);
            let delay = std::time::Duration::from_secs(base_delay)
                + std::time::Duration::from_millis(jitter_ms);
            log::info!(
                "Connection attempt failed, retrying; attempt={}, max_attempts={}, delay_ms={}",
                attempt + 1,
                retries + 1,
                delay.as_millis() as u64
            );
            tokio::time::sleep(delay).await;
        }

        match connect_once(
            &conn_string,
            ssl_mode,
            tls_config.as_ref(),
            connect_timeout_secs,
        )
        .await
        {
            Ok(client) => {
                if attempt > 0 {
                    log::info!(
                        "Connected successfully after retry; attempt={}, max_attempts={}",
                        attempt + 1,
                        retries + 1
                    );
                }

                if statement_timeout_secs > 0 {
                    let timeout_sql =
                        format!("SET statement_timeout = '{}s'", statement_timeout_secs);
                    client.batch_execute(&timeout_sql).await?;
                }

                return Ok(client);
            }
            Err(e) => {
                if is_permanent_error(&e) {
                    log::error!("Permanent connection error, not retrying: {}", e);
                    return Err(TidemarkError::DatabaseError(e));
                }
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(TidemarkError::DatabaseError(e)),
        None => Err(TidemarkError::ConnectionLost {
            operation: "connect".to_string(),
            detail: "no connection attempt was made".to_string(),
        }),
    }
}

/// Check if an error is a transient connection error that may be retried.
///
/// Detects PostgreSQL server shutdown codes, connection exception codes,
/// closed connections, and common network error message patterns.
pub fn is_transient_error(e: &TidemarkError) -> bool {
    match e {
        TidemarkError::DatabaseError(pg_err) => {
            if pg_err.is_closed() {
                return true;
            }
            if let Some(db_err) = pg_err.as_db_error() {
                let code = db_err.code().code();
                // 57P01 = admin_shutdown, 57P02 = crash_shutdown, 57P03 = cannot_connect_now
                // 08000 = connection_exception, 08003 = connection_does_not_exist,
                // 08006 = connection_failure
                return matches!(
                    code,
                    "57P01" | "57P02" | "57P03" | "08000" | "08003" | "08006"
                );
            }
            let msg = pg_err.to_string().to_lowercase();
            msg.contains("connection reset")
                || msg.contains("broken pipe")
                || msg.contains("connection closed")
                || msg.contains("unexpected eof")
        }
        TidemarkError::ConnectionLost { .. } => true,
        _ => false,
    }
}

/// Verify the database connection is still alive with a minimal round-trip.
pub async fn check_connection(client: &Client) -> Result<()> {
    client
        .simple_query("")
        .await
        .map_err(|e| TidemarkError::ConnectionLost {
            operation: "health check".to_string(),
            detail: e.to_string(),
        })?;
    Ok(())
}
