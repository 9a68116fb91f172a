use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::session::TlsMode;

/// AdminConnection describes an admin-level endpoint of a MySQL-compatible server
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "dba.mysql.operator.dev",
    version = "v1alpha1",
    kind = "AdminConnection",
    plural = "adminconnections",
    namespaced
)]
#[kube(status = "AdminConnectionStatus")]
#[kube(shortname = "adminconn")]
#[serde(rename_all = "camelCase")]
pub struct AdminConnectionSpec {
    /// Server hostname
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Admin username, defaults to root
    #[serde(default)]
    pub admin_user: Option<SecretKeySource>,

    /// Admin password, defaults to empty
    #[serde(default)]
    pub admin_password: Option<SecretKeySource>,

    /// Namespaces allowed to reference this connection (exact or trailing `*`)
    #[serde(default)]
    pub allowed_namespaces: Vec<String>,

    /// Transport security preference
    #[serde(default)]
    pub tls_mode: TlsMode,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminConnectionStatus {
    /// Last time the connection was validated
    pub sync_time: Option<DateTime<Utc>>,

    /// Indicates current state, phase or issue
    pub message: Option<String>,

    /// Control database holding the ownership ledger
    pub control_database: Option<String>,

    /// Server default character set
    pub character_set: Option<String>,

    /// Server default collation
    pub collation: Option<String>,

    /// Character sets and collations known to the server
    #[serde(default)]
    pub available_charsets: Vec<Charset>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct Charset {
    pub name: String,
    pub collations: Vec<Collation>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct Collation {
    pub name: String,
    pub default: bool,
}

/// Reference to an AdminConnection; namespace defaults to the referrer's
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct AdminConnectionRef {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
}

impl AdminConnectionRef {
    pub fn namespace_or<'a>(&'a self, caller_namespace: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => caller_namespace,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySource {
    pub secret_key_ref: SecretKeyRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

impl AdminConnection {
    /// Own namespace, exact matches and trailing-wildcard prefixes are allowed.
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        if self.namespace().as_deref() == Some(namespace) {
            return true;
        }
        self.spec.allowed_namespaces.iter().any(|allowed| {
            allowed == namespace
                || allowed
                    .strip_suffix('*')
                    .is_some_and(|prefix| namespace.starts_with(prefix))
        })
    }

    /// Identity used to key the connection cache.
    pub fn identity(&self) -> String {
        self.uid().unwrap_or_else(|| {
            format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
        })
    }
}

/// Database represents a schema on the server behind an AdminConnection
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "dba.mysql.operator.dev",
    version = "v1alpha1",
    kind = "Database",
    plural = "databases",
    namespaced
)]
#[kube(status = "DatabaseStatus")]
#[kube(shortname = "mydb")]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    pub admin_connection: AdminConnectionRef,

    /// Live database name, immutable after creation
    pub name: String,

    #[serde(default)]
    pub character_set: Option<String>,

    #[serde(default)]
    pub collation: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// When the database was created by this operator
    pub creation_time: Option<DateTime<Utc>>,

    pub sync_time: Option<DateTime<Utc>>,

    pub character_set: Option<String>,

    pub collation: Option<String>,

    /// Resolved server host
    pub host: Option<String>,

    /// Resolved server port
    pub port: Option<u16>,

    /// Resolved live database name
    pub name: Option<String>,

    pub message: Option<String>,
}

impl Database {
    /// Live database name, as resolved on the first registered pass.
    pub fn live_name(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.name.as_deref())
            .unwrap_or(&self.spec.name)
    }

    pub fn status_mut(&mut self) -> &mut DatabaseStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// DatabaseUser represents an account on the server behind an AdminConnection
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "dba.mysql.operator.dev",
    version = "v1alpha1",
    kind = "DatabaseUser",
    plural = "databaseusers",
    namespaced
)]
#[kube(status = "DatabaseUserStatus")]
#[kube(shortname = "myuser")]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUserSpec {
    pub admin_connection: AdminConnectionRef,

    pub username: String,

    #[serde(default)]
    pub identification: Option<Identification>,

    /// Per-database grants; an empty privilege list means all privileges
    #[serde(default)]
    pub database_permissions: Vec<DatabasePermission>,

    #[serde(default)]
    pub tls: Option<TlsRequirement>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatabasePermission {
    /// Name of a Database resource in the user's namespace
    pub database_name: String,

    #[serde(default)]
    pub grants: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    /// Authentication plugin, see MySQL CREATE USER
    #[serde(default)]
    pub auth_plugin: Option<String>,

    /// Secret holding the auth string
    #[serde(default)]
    pub auth_string: Option<SecretKeySource>,

    /// The stored auth string is not hashed
    #[serde(default = "default_clear_text")]
    pub clear_text: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct TlsRequirement {
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub x509: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUserStatus {
    /// Username currently in effect on the server
    pub username: Option<String>,

    pub creation_time: Option<DateTime<Utc>>,

    pub sync_time: Option<DateTime<Utc>>,

    pub message: Option<String>,

    /// Identification last applied
    pub identification: Option<Identification>,

    /// Resource version of the secret the identification was derived from
    pub identification_resource_version: Option<String>,

    /// TLS requirement last applied
    pub tls: Option<TlsRequirement>,

    /// Grants as reported by SHOW GRANTS, baseline entry excluded
    #[serde(default)]
    pub grants: Vec<String>,

    /// Permission list last applied
    #[serde(default)]
    pub database_permissions: Vec<DatabasePermission>,
}

impl DatabaseUser {
    /// Username in effect on the server, falling back to the declared one.
    pub fn live_username(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.username.as_deref())
            .unwrap_or(&self.spec.username)
    }

    pub fn status_mut(&mut self) -> &mut DatabaseUserStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// The single in-sync condition for grants.
    pub fn permissions_in_sync(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return self.spec.database_permissions.is_empty();
        };
        status.grants.len() == self.spec.database_permissions.len()
            && status.database_permissions == self.spec.database_permissions
    }
}

fn default_port() -> u16 {
    3306
}

fn default_clear_text() -> bool {
    true
}
