//! Live connections to an admin endpoint.
//!
//! Controllers talk to a server only through [`AdminSession`]; connections
//! are built by a [`Connector`] and cached by the
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry).

pub mod mysql;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::ledger::{Claim, LedgerTable};

pub use self::mysql::MySqlConnector;

/// Database selected when a connection is first opened.
pub const BOOTSTRAP_DATABASE: &str = "mysql";

/// Transport security preference for admin connections
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum TlsMode {
    Disabled,
    #[default]
    Preferred,
    Required,
}

/// Every field that determines which server and identity a connection uses.
///
/// Structural equality decides whether a cached connection may be reused.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionConfig {
    pub network: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub tls: TlsMode,
}

impl ConnectionConfig {
    pub fn tcp(host: impl Into<String>, port: u16, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            network: "tcp".to_string(),
            host: host.into(),
            port,
            database: BOOTSTRAP_DATABASE.to_string(),
            user: user.into(),
            password: password.into(),
            tls: TlsMode::default(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("network", &self.network)
            .field("address", &self.address())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Row of INFORMATION_SCHEMA.SCHEMATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaInfo {
    pub name: String,
    pub character_set: String,
    pub collation: String,
}

/// Row of SHOW COLLATION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollationRow {
    pub collation: String,
    pub charset: String,
    pub is_default: bool,
}

/// A validated live connection to one server
#[async_trait]
pub trait AdminSession: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Execute a statement that returns no rows.
    async fn execute(&self, statement: &str) -> Result<()>;

    async fn schema(&self, name: &str) -> Result<Option<SchemaInfo>>;

    async fn user_exists(&self, username: &str) -> Result<bool>;

    /// Raw `SHOW GRANTS` output, baseline entry included.
    async fn show_grants(&self, username: &str) -> Result<Vec<String>>;

    async fn server_variable(&self, name: &str) -> Result<Option<String>>;

    async fn collations(&self) -> Result<Vec<CollationRow>>;

    async fn find_claim(&self, table: LedgerTable, object_name: &str) -> Result<Option<Claim>>;

    async fn find_claim_by_uid(&self, table: LedgerTable, uid: &str) -> Result<Option<Claim>>;

    /// Returns `false` when a uniqueness constraint rejected the row.
    async fn insert_claim(&self, table: LedgerTable, claim: &Claim) -> Result<bool>;

    async fn delete_claim(&self, table: LedgerTable, uid: &str) -> Result<()>;

    /// Release the underlying connection; later calls fail with a connectivity error.
    async fn close(&self) -> Result<()>;
}

/// Builds sessions from a connection configuration
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn AdminSession>>;
}
