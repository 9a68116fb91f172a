use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, DriverError, OptsBuilder, Row, SslOpts};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AdminSession, CollationRow, ConnectionConfig, Connector, SchemaInfo, TlsMode};
use crate::error::{Error, Result};
use crate::ledger::{Claim, LedgerTable};
use crate::sql;

/// MySQL error code for a duplicate key on insert
const ER_DUP_ENTRY: u16 = 1062;

const SCHEMA_QUERY: &str = "SELECT SCHEMA_NAME, DEFAULT_CHARACTER_SET_NAME, DEFAULT_COLLATION_NAME \
     FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = ?";
const USER_QUERY: &str = "SELECT COUNT(*) FROM mysql.user WHERE User = ?";
const COLLATION_QUERY: &str = "SHOW COLLATION WHERE Charset IS NOT NULL";

/// Opens single `mysql_async` connections, each bounded by a timeout
pub struct MySqlConnector {
    timeout: Duration,
}

impl MySqlConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn open(
        &self,
        config: &ConnectionConfig,
        tls: bool,
    ) -> Result<std::result::Result<Conn, mysql_async::Error>> {
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.database.clone()));
        if tls {
            opts = opts.ssl_opts(Some(SslOpts::default()));
        }

        tokio::time::timeout(self.timeout, Conn::new(opts))
            .await
            .map_err(|_| Error::timeout(format!("connect to {}", config.address())))
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn AdminSession>> {
        let attempt = match config.tls {
            TlsMode::Disabled => self.open(config, false).await?,
            TlsMode::Required => self.open(config, true).await?,
            TlsMode::Preferred => match self.open(config, true).await? {
                Err(mysql_async::Error::Driver(DriverError::NoClientSslFlagFromServer)) => {
                    debug!(
                        "Server {} does not offer TLS, connecting without it",
                        config.address()
                    );
                    self.open(config, false).await?
                }
                other => other,
            },
        };

        let conn = attempt.map_err(|e| {
            Error::Connectivity(format!("failed to connect to {}: {}", config.address(), e))
        })?;

        Ok(Arc::new(MySqlSession {
            conn: Mutex::new(Some(conn)),
            timeout: self.timeout,
        }))
    }
}

/// One server connection; statements on it are serialised
pub struct MySqlSession {
    conn: Mutex<Option<Conn>>,
    timeout: Duration,
}

impl MySqlSession {
    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::timeout(operation))
    }
}

fn closed() -> Error {
    Error::Connectivity("connection already closed".to_string())
}

fn query_error(statement: &str, err: mysql_async::Error) -> Error {
    match err {
        mysql_async::Error::Io(e) => Error::Connectivity(e.to_string()),
        other => Error::sql(statement, other),
    }
}

#[async_trait]
impl AdminSession for MySqlSession {
    async fn ping(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        self.bounded("ping", conn.ping())
            .await?
            .map_err(|e| Error::Connectivity(format!("ping failed: {}", e)))
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        self.bounded(statement, conn.query_drop(statement))
            .await?
            .map_err(|e| query_error(statement, e))
    }

    async fn schema(&self, name: &str) -> Result<Option<SchemaInfo>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let row: Option<(String, String, String)> = self
            .bounded(SCHEMA_QUERY, conn.exec_first(SCHEMA_QUERY, (name,)))
            .await?
            .map_err(|e| query_error(SCHEMA_QUERY, e))?;
        Ok(row.map(|(name, character_set, collation)| SchemaInfo {
            name,
            character_set,
            collation,
        }))
    }

    async fn user_exists(&self, username: &str) -> Result<bool> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let count: Option<i64> = self
            .bounded(USER_QUERY, conn.exec_first(USER_QUERY, (username,)))
            .await?
            .map_err(|e| query_error(USER_QUERY, e))?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn show_grants(&self, username: &str) -> Result<Vec<String>> {
        let statement = sql::show_grants(username);
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        self.bounded(&statement, conn.query::<String, _>(statement.as_str()))
            .await?
            .map_err(|e| query_error(&statement, e))
    }

    async fn server_variable(&self, name: &str) -> Result<Option<String>> {
        let statement = format!("SHOW VARIABLES LIKE {}", sql::quote_string(name));
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let row: Option<(String, String)> = self
            .bounded(&statement, conn.query_first(statement.as_str()))
            .await?
            .map_err(|e| query_error(&statement, e))?;
        Ok(row.map(|(_, value)| value))
    }

    async fn collations(&self) -> Result<Vec<CollationRow>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let rows: Vec<Row> = self
            .bounded(COLLATION_QUERY, conn.query(COLLATION_QUERY))
            .await?
            .map_err(|e| query_error(COLLATION_QUERY, e))?;

        let column = |row: &Row, name: &str| -> Option<String> {
            row.get_opt::<String, _>(name).and_then(|v| v.ok())
        };
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(CollationRow {
                    collation: column(row, "Collation")?,
                    charset: column(row, "Charset")?,
                    is_default: column(row, "Default").as_deref() == Some("Yes"),
                })
            })
            .collect())
    }

    async fn find_claim(&self, table: LedgerTable, object_name: &str) -> Result<Option<Claim>> {
        let statement = format!(
            "SELECT uuid, namespace, name, {col} FROM {tbl} WHERE {col} = ?",
            col = table.object_column(),
            tbl = table.qualified_name()
        );
        self.select_claim(statement, object_name).await
    }

    async fn find_claim_by_uid(&self, table: LedgerTable, uid: &str) -> Result<Option<Claim>> {
        let statement = format!(
            "SELECT uuid, namespace, name, {col} FROM {tbl} WHERE uuid = ?",
            col = table.object_column(),
            tbl = table.qualified_name()
        );
        self.select_claim(statement, uid).await
    }

    async fn insert_claim(&self, table: LedgerTable, claim: &Claim) -> Result<bool> {
        let statement = format!(
            "INSERT INTO {} (uuid, namespace, name, {}, created_at, updated_at) \
             VALUES (?, ?, ?, ?, NOW(), NOW())",
            table.qualified_name(),
            table.object_column()
        );
        let params = (
            claim.uid.as_str(),
            claim.namespace.as_str(),
            claim.name.as_str(),
            claim.object_name.as_str(),
        );
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        match self
            .bounded(&statement, conn.exec_drop(statement.as_str(), params))
            .await?
        {
            Ok(()) => Ok(true),
            Err(mysql_async::Error::Server(e)) if e.code == ER_DUP_ENTRY => Ok(false),
            Err(e) => Err(query_error(&statement, e)),
        }
    }

    async fn delete_claim(&self, table: LedgerTable, uid: &str) -> Result<()> {
        let statement = format!("DELETE FROM {} WHERE uuid = ?", table.qualified_name());
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        self.bounded(&statement, conn.exec_drop(statement.as_str(), (uid,)))
            .await?
            .map_err(|e| query_error(&statement, e))
    }

    async fn close(&self) -> Result<()> {
        let Some(conn) = self.conn.lock().await.take() else {
            return Ok(());
        };
        self.bounded("disconnect", conn.disconnect())
            .await?
            .map_err(|e| Error::Connectivity(format!("disconnect failed: {}", e)))
    }
}

impl MySqlSession {
    async fn select_claim(&self, statement: String, key: &str) -> Result<Option<Claim>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let row: Option<(String, String, String, String)> = self
            .bounded(&statement, conn.exec_first(statement.as_str(), (key,)))
            .await?
            .map_err(|e| query_error(&statement, e))?;
        Ok(row.map(|(uid, namespace, name, object_name)| Claim {
            uid,
            namespace,
            name,
            object_name,
        }))
    }
}
