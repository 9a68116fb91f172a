//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cluster::{Cluster, ResourceKind, SecretData};
use crate::config::OperatorConfig;
use crate::controllers::Context;
use crate::crd::{
    AdminConnection, AdminConnectionRef, AdminConnectionSpec, AdminConnectionStatus, Database,
    DatabaseSpec, DatabaseStatus, DatabaseUser, DatabaseUserSpec, DatabaseUserStatus,
};
use crate::error::{Error, Result};
use crate::ledger::{Claim, LedgerTable};
use crate::session::{AdminSession, CollationRow, ConnectionConfig, Connector, SchemaInfo};

pub const NAMESPACE: &str = "apps";
pub const ADMIN_CONNECTION: &str = "server";

const COLLATIONS: &[(&str, &str, bool)] = &[
    ("latin1_bin", "latin1", false),
    ("latin1_swedish_ci", "latin1", true),
    ("utf8mb4_0900_ai_ci", "utf8mb4", true),
    ("utf8mb4_bin", "utf8mb4", false),
];

const SERVER_CHARSET: &str = "utf8mb4";

fn default_collation(charset: &str) -> Option<&'static str> {
    COLLATIONS
        .iter()
        .find(|(_, cs, default)| *cs == charset && *default)
        .map(|(name, _, _)| *name)
}

fn charset_of(collation: &str) -> Option<&'static str> {
    COLLATIONS
        .iter()
        .find(|(name, _, _)| *name == collation)
        .map(|(_, cs, _)| *cs)
}

#[derive(Debug, Clone, Default)]
pub struct FakeUser {
    /// Everything after the username in the last CREATE/ALTER USER
    pub details: String,
    grants: BTreeMap<String, Vec<String>>,
}

struct ServerState {
    reachable: bool,
    databases: BTreeMap<String, (String, String)>,
    users: BTreeMap<String, FakeUser>,
    claims: BTreeMap<LedgerTable, Vec<Claim>>,
    statements: Vec<String>,
    failing: Vec<String>,
    fail_collations: bool,
    refused_claims: Vec<String>,
    hanging: bool,
    closes: usize,
}

/// A MySQL server that understands exactly the statements this crate emits
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                reachable: true,
                databases: BTreeMap::new(),
                users: BTreeMap::new(),
                claims: BTreeMap::new(),
                statements: Vec::new(),
                failing: Vec::new(),
                fail_collations: false,
                refused_claims: Vec::new(),
                hanging: false,
                closes: 0,
            })),
        }
    }

    pub fn session(&self) -> Arc<dyn AdminSession> {
        Arc::new(FakeSession {
            server: self.clone(),
            open: AtomicBool::new(true),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    /// Statements starting with `prefix` fail with a SQL error.
    pub fn fail_statements(&self, prefix: &str) {
        self.state.lock().unwrap().failing.push(prefix.to_string());
    }

    /// Ledger inserts for `object_name` report a lost race.
    pub fn refuse_claims(&self, object_name: &str) {
        self.state.lock().unwrap().refused_claims.push(object_name.to_string());
    }

    /// Sessions closed through [`AdminSession::close`].
    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// Connects never complete while set.
    pub fn set_hanging(&self, hanging: bool) {
        self.state.lock().unwrap().hanging = hanging;
    }

    pub fn fail_collations(&self) {
        self.state.lock().unwrap().fail_collations = true;
    }

    /// Statements executed since the last [`FakeServer::clear_statements`], control schema DDL excluded.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .statements
            .iter()
            .filter(|s| {
                !(s.starts_with("CREATE DATABASE IF NOT EXISTS")
                    || s.starts_with("CREATE TABLE IF NOT EXISTS")
                    || s.starts_with("USE "))
            })
            .cloned()
            .collect()
    }

    pub fn clear_statements(&self) {
        self.state.lock().unwrap().statements.clear();
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().unwrap().databases.contains_key(name)
    }

    /// (character set, collation)
    pub fn database(&self, name: &str) -> Option<(String, String)> {
        self.state.lock().unwrap().databases.get(name).cloned()
    }

    pub fn add_database(&self, name: &str) {
        self.state.lock().unwrap().databases.insert(
            name.to_string(),
            (SERVER_CHARSET.to_string(), "utf8mb4_0900_ai_ci".to_string()),
        );
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.state.lock().unwrap().users.contains_key(name)
    }

    pub fn user(&self, name: &str) -> Option<FakeUser> {
        self.state.lock().unwrap().users.get(name).cloned()
    }

    pub fn add_user(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .users
            .insert(name.to_string(), FakeUser::default());
    }

    pub fn claims(&self, table: LedgerTable) -> Vec<Claim> {
        self.state
            .lock()
            .unwrap()
            .claims
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_claim(&self, table: LedgerTable, claim: Claim) {
        self.state
            .lock()
            .unwrap()
            .claims
            .entry(table)
            .or_default()
            .push(claim);
    }

    fn grant_lines(username: &str, user: &FakeUser) -> Vec<String> {
        let mut lines = vec![format!("GRANT USAGE ON *.* TO `{}`@`%`", username)];
        for (database, privileges) in &user.grants {
            lines.push(format!(
                "GRANT {} ON `{}`.* TO `{}`@`%`",
                privileges.join(", "),
                database,
                username
            ));
        }
        lines
    }
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn keyword(&mut self, keyword: &str) -> bool {
        let trimmed = self.rest.trim_start();
        match trimmed.strip_prefix(keyword) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn identifier(&mut self) -> Option<String> {
        let body = self.rest.trim_start().strip_prefix('`')?;
        let mut chars = body.char_indices().peekable();
        let mut value = String::new();
        while let Some((i, c)) = chars.next() {
            if c == '`' {
                if matches!(chars.peek(), Some((_, '`'))) {
                    chars.next();
                    value.push('`');
                } else {
                    self.rest = &body[i + 1..];
                    return Some(value);
                }
            } else {
                value.push(c);
            }
        }
        None
    }

    fn string(&mut self) -> Option<String> {
        let body = self.rest.trim_start().strip_prefix('\'')?;
        let mut chars = body.char_indices();
        let mut value = String::new();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    let (_, escaped) = chars.next()?;
                    value.push(match escaped {
                        '0' => '\0',
                        'n' => '\n',
                        'r' => '\r',
                        'Z' => '\x1a',
                        other => other,
                    });
                }
                '\'' => {
                    self.rest = &body[i + 1..];
                    return Some(value);
                }
                c => value.push(c),
            }
        }
        None
    }

    /// Optional `CHARACTER SET` and `COLLATE` clauses
    fn charset_clauses(&mut self) -> Option<(Option<String>, Option<String>)> {
        let character_set = if self.keyword("CHARACTER SET") {
            Some(self.identifier()?)
        } else {
            None
        };
        let collation = if self.keyword("COLLATE") {
            Some(self.identifier()?)
        } else {
            None
        };
        Some((character_set, collation))
    }
}

fn resolve_charset(
    current: Option<&(String, String)>,
    character_set: Option<String>,
    collation: Option<String>,
) -> std::result::Result<(String, String), String> {
    match (character_set, collation) {
        (cs, Some(co)) => {
            let owner = charset_of(&co).ok_or_else(|| format!("Unknown collation: '{}'", co))?;
            if cs.as_deref().is_some_and(|cs| cs != owner) {
                return Err(format!("COLLATION '{}' is not valid for CHARACTER SET", co));
            }
            Ok((owner.to_string(), co))
        }
        (Some(cs), None) => {
            let co = default_collation(&cs).ok_or_else(|| format!("Unknown character set: '{}'", cs))?;
            Ok((cs, co.to_string()))
        }
        (None, None) => Ok(current.cloned().unwrap_or_else(|| {
            (SERVER_CHARSET.to_string(), "utf8mb4_0900_ai_ci".to_string())
        })),
    }
}

fn apply(state: &mut ServerState, statement: &str) -> std::result::Result<(), String> {
    let mut c = Cursor { rest: statement };
    let syntax = || "You have an error in your SQL syntax".to_string();

    if c.keyword("CREATE DATABASE IF NOT EXISTS") {
        let name = c.identifier().ok_or_else(syntax)?;
        state
            .databases
            .entry(name)
            .or_insert_with(|| (SERVER_CHARSET.to_string(), "utf8mb4_0900_ai_ci".to_string()));
    } else if c.keyword("USE") || c.keyword("CREATE TABLE IF NOT EXISTS") {
    } else if c.keyword("CREATE DATABASE") {
        let name = c.identifier().ok_or_else(syntax)?;
        if state.databases.contains_key(&name) {
            return Err(format!("Can't create database '{}'; database exists", name));
        }
        let (cs, co) = c.charset_clauses().ok_or_else(syntax)?;
        let resolved = resolve_charset(None, cs, co)?;
        state.databases.insert(name, resolved);
    } else if c.keyword("ALTER DATABASE") {
        let name = c.identifier().ok_or_else(syntax)?;
        let (cs, co) = c.charset_clauses().ok_or_else(syntax)?;
        let current = state
            .databases
            .get(&name)
            .ok_or_else(|| format!("Unknown database '{}'", name))?;
        let resolved = resolve_charset(Some(current), cs, co)?;
        state.databases.insert(name, resolved);
    } else if c.keyword("DROP DATABASE IF EXISTS") {
        let name = c.identifier().ok_or_else(syntax)?;
        state.databases.remove(&name);
    } else if c.keyword("CREATE USER") {
        let name = c.string().ok_or_else(syntax)?;
        if state.users.contains_key(&name) {
            return Err(format!("Operation CREATE USER failed for '{}'", name));
        }
        let details = c.rest.to_string();
        state.users.insert(
            name,
            FakeUser {
                details,
                grants: BTreeMap::new(),
            },
        );
    } else if c.keyword("ALTER USER") {
        let name = c.string().ok_or_else(syntax)?;
        let details = c.rest.to_string();
        let user = state
            .users
            .get_mut(&name)
            .ok_or_else(|| format!("Operation ALTER USER failed for '{}'", name))?;
        user.details = details;
    } else if c.keyword("RENAME USER") {
        let from = c.string().ok_or_else(syntax)?;
        if !c.keyword("TO") {
            return Err(syntax());
        }
        let to = c.string().ok_or_else(syntax)?;
        if state.users.contains_key(&to) || !state.users.contains_key(&from) {
            return Err(format!("Operation RENAME USER failed for '{}'", from));
        }
        if let Some(user) = state.users.remove(&from) {
            state.users.insert(to, user);
        }
    } else if c.keyword("DROP USER IF EXISTS") {
        let name = c.string().ok_or_else(syntax)?;
        state.users.remove(&name);
    } else if c.keyword("REVOKE ALL PRIVILEGES, GRANT OPTION FROM") {
        let name = c.string().ok_or_else(syntax)?;
        let user = state
            .users
            .get_mut(&name)
            .ok_or_else(|| format!("There is no such grant defined for user '{}'", name))?;
        user.grants.clear();
    } else if c.keyword("GRANT") {
        let (privileges, rest) = c.rest.trim_start().split_once(" ON ").ok_or_else(syntax)?;
        c.rest = rest;
        let database = c.identifier().ok_or_else(syntax)?;
        if !c.keyword(".*") || !c.keyword("TO") {
            return Err(syntax());
        }
        let name = c.string().ok_or_else(syntax)?;
        let user = state
            .users
            .get_mut(&name)
            .ok_or_else(|| format!("You are not allowed to create a user with GRANT: '{}'", name))?;
        let granted = user.grants.entry(database).or_default();
        for privilege in privileges.split(", ") {
            if !granted.iter().any(|p| p == privilege) {
                granted.push(privilege.to_string());
            }
        }
    } else {
        return Err(syntax());
    }
    Ok(())
}

struct FakeSession {
    server: FakeServer,
    open: AtomicBool,
}

impl FakeSession {
    fn state(&self) -> Result<std::sync::MutexGuard<'_, ServerState>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Connectivity("connection already closed".into()));
        }
        let state = self.server.state.lock().unwrap();
        if !state.reachable {
            return Err(Error::Connectivity("server unreachable".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl AdminSession for FakeSession {
    async fn ping(&self) -> Result<()> {
        self.state().map(|_| ())
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        let mut state = self.state()?;
        state.statements.push(statement.to_string());
        if state.failing.iter().any(|p| statement.starts_with(p.as_str())) {
            return Err(Error::sql(statement, "Access denied"));
        }
        apply(&mut state, statement).map_err(|reason| Error::sql(statement, reason))
    }

    async fn schema(&self, name: &str) -> Result<Option<SchemaInfo>> {
        Ok(self.state()?.databases.get(name).map(|(cs, co)| SchemaInfo {
            name: name.to_string(),
            character_set: cs.clone(),
            collation: co.clone(),
        }))
    }

    async fn user_exists(&self, username: &str) -> Result<bool> {
        Ok(self.state()?.users.contains_key(username))
    }

    async fn show_grants(&self, username: &str) -> Result<Vec<String>> {
        let state = self.state()?;
        let user = state.users.get(username).ok_or_else(|| {
            Error::sql(
                format!("SHOW GRANTS FOR '{}'", username),
                "There is no such grant defined",
            )
        })?;
        Ok(FakeServer::grant_lines(username, user))
    }

    async fn server_variable(&self, name: &str) -> Result<Option<String>> {
        let _state = self.state()?;
        Ok(match name {
            "character_set_server" => Some(SERVER_CHARSET.to_string()),
            "collation_server" => Some("utf8mb4_0900_ai_ci".to_string()),
            _ => None,
        })
    }

    async fn collations(&self) -> Result<Vec<CollationRow>> {
        let state = self.state()?;
        if state.fail_collations {
            return Err(Error::sql("SHOW COLLATION", "Access denied"));
        }
        Ok(COLLATIONS
            .iter()
            .map(|(collation, charset, is_default)| CollationRow {
                collation: collation.to_string(),
                charset: charset.to_string(),
                is_default: *is_default,
            })
            .collect())
    }

    async fn find_claim(&self, table: LedgerTable, object_name: &str) -> Result<Option<Claim>> {
        let state = self.state()?;
        Ok(state
            .claims
            .get(&table)
            .and_then(|rows| rows.iter().find(|c| c.object_name == object_name).cloned()))
    }

    async fn find_claim_by_uid(&self, table: LedgerTable, uid: &str) -> Result<Option<Claim>> {
        let state = self.state()?;
        Ok(state
            .claims
            .get(&table)
            .and_then(|rows| rows.iter().find(|c| c.uid == uid).cloned()))
    }

    async fn insert_claim(&self, table: LedgerTable, claim: &Claim) -> Result<bool> {
        let mut state = self.state()?;
        if state.refused_claims.contains(&claim.object_name) {
            return Ok(false);
        }
        let rows = state.claims.entry(table).or_default();
        if rows
            .iter()
            .any(|c| c.uid == claim.uid || c.object_name == claim.object_name)
        {
            return Ok(false);
        }
        rows.push(claim.clone());
        Ok(true)
    }

    async fn delete_claim(&self, table: LedgerTable, uid: &str) -> Result<()> {
        let mut state = self.state()?;
        if let Some(rows) = state.claims.get_mut(&table) {
            rows.retain(|c| c.uid != uid);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.server.state.lock().unwrap().closes += 1;
        }
        Ok(())
    }
}

/// Connector handing out sessions on a [`FakeServer`]
pub struct FakeConnector {
    server: FakeServer,
    connects: AtomicUsize,
    last_config: Mutex<Option<ConnectionConfig>>,
}

impl FakeConnector {
    pub fn new(server: FakeServer) -> Self {
        Self {
            server,
            connects: AtomicUsize::new(0),
            last_config: Mutex::new(None),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<ConnectionConfig> {
        self.last_config.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn AdminSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config.clone());
        let hanging = self.server.state.lock().unwrap().hanging;
        if hanging {
            std::future::pending::<()>().await;
        }
        if !self.server.state.lock().unwrap().reachable {
            return Err(Error::Connectivity(format!(
                "failed to connect to {}",
                config.address()
            )));
        }
        Ok(self.server.session())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub reason: String,
    pub note: String,
    pub warning: bool,
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ClusterState {
    admin_connections: BTreeMap<Key, AdminConnection>,
    databases: BTreeMap<Key, Database>,
    secrets: BTreeMap<Key, SecretData>,
    finalizers: BTreeMap<(ResourceKind, String, String), Vec<String>>,
    admin_statuses: BTreeMap<Key, AdminConnectionStatus>,
    database_statuses: BTreeMap<Key, DatabaseStatus>,
    user_statuses: BTreeMap<Key, DatabaseUserStatus>,
    events: Vec<RecordedEvent>,
    secret_version: u64,
}

impl ClusterState {
    fn next_version(&mut self) -> String {
        self.secret_version += 1;
        self.secret_version.to_string()
    }
}

/// [`Cluster`] that keeps everything in memory
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<ClusterState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_admin_connection(&self, connection: AdminConnection) {
        let k = key(
            connection.metadata.namespace.as_deref().unwrap_or_default(),
            connection.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state.lock().unwrap().admin_connections.insert(k, connection);
    }

    pub fn remove_admin_connection(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .admin_connections
            .remove(&key(namespace, name));
    }

    pub fn add_database(&self, database: Database) {
        let k = key(
            database.metadata.namespace.as_deref().unwrap_or_default(),
            database.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state.lock().unwrap().databases.insert(k, database);
    }

    pub fn add_secret(&self, namespace: &str, name: &str, key_name: &str, value: &str, controller_uid: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        state.secrets.insert(
            key(namespace, name),
            SecretData {
                data: BTreeMap::from([(key_name.to_string(), value.as_bytes().to_vec())]),
                resource_version: Some(version),
                controller_uid: controller_uid.map(str::to_string),
            },
        );
    }

    /// Replace a secret value, bumping its resource version.
    pub fn rotate_secret(&self, namespace: &str, name: &str, key_name: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        if let Some(secret) = state.secrets.get_mut(&key(namespace, name)) {
            secret
                .data
                .insert(key_name.to_string(), value.as_bytes().to_vec());
            secret.resource_version = Some(version);
        }
    }

    pub fn secret_data(&self, namespace: &str, name: &str) -> Option<SecretData> {
        self.state.lock().unwrap().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn finalizers(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .finalizers
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn admin_status(&self, namespace: &str, name: &str) -> Option<AdminConnectionStatus> {
        self.state.lock().unwrap().admin_statuses.get(&key(namespace, name)).cloned()
    }

    pub fn database_status(&self, namespace: &str, name: &str) -> Option<DatabaseStatus> {
        self.state.lock().unwrap().database_statuses.get(&key(namespace, name)).cloned()
    }

    pub fn user_status(&self, namespace: &str, name: &str) -> Option<DatabaseUserStatus> {
        self.state.lock().unwrap().user_statuses.get(&key(namespace, name)).cloned()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn admin_connection(&self, namespace: &str, name: &str) -> Result<Option<AdminConnection>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .admin_connections
            .get(&key(namespace, name))
            .cloned())
    }

    async fn database(&self, namespace: &str, name: &str) -> Result<Option<Database>> {
        Ok(self.state.lock().unwrap().databases.get(&key(namespace, name)).cloned())
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        Ok(self.secret_data(namespace, name))
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        key_name: &str,
        value: &str,
        owner: OwnerReference,
    ) -> Result<SecretData> {
        self.add_secret(namespace, name, key_name, value, Some(&owner.uid));
        self.secret_data(namespace, name)
            .ok_or_else(|| Error::not_found("Secret", name))
    }

    async fn claim_secret(&self, namespace: &str, name: &str, owner: OwnerReference) -> Result<SecretData> {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let secret = state
            .secrets
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::not_found("Secret", name))?;
        secret.controller_uid = Some(owner.uid);
        secret.resource_version = Some(version);
        Ok(secret.clone())
    }

    async fn set_finalizers(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .finalizers
            .insert((kind, namespace.to_string(), name.to_string()), finalizers);
        Ok(())
    }

    async fn update_admin_connection_status(&self, connection: &AdminConnection) -> Result<()> {
        let k = key(
            connection.metadata.namespace.as_deref().unwrap_or_default(),
            connection.metadata.name.as_deref().unwrap_or_default(),
        );
        let mut state = self.state.lock().unwrap();
        state
            .admin_statuses
            .insert(k.clone(), connection.status.clone().unwrap_or_default());
        if let Some(stored) = state.admin_connections.get_mut(&k) {
            stored.status = connection.status.clone();
        }
        Ok(())
    }

    async fn update_database_status(&self, database: &Database) -> Result<()> {
        let k = key(
            database.metadata.namespace.as_deref().unwrap_or_default(),
            database.metadata.name.as_deref().unwrap_or_default(),
        );
        let mut state = self.state.lock().unwrap();
        state
            .database_statuses
            .insert(k.clone(), database.status.clone().unwrap_or_default());
        if let Some(stored) = state.databases.get_mut(&k) {
            stored.status = database.status.clone();
        }
        Ok(())
    }

    async fn update_user_status(&self, user: &DatabaseUser) -> Result<()> {
        let k = key(
            user.metadata.namespace.as_deref().unwrap_or_default(),
            user.metadata.name.as_deref().unwrap_or_default(),
        );
        self.state
            .lock()
            .unwrap()
            .user_statuses
            .insert(k, user.status.clone().unwrap_or_default());
        Ok(())
    }

    async fn record_event(&self, object: ObjectReference, reason: &str, note: &str, warning: bool) {
        self.state.lock().unwrap().events.push(RecordedEvent {
            object: object.name.unwrap_or_default(),
            reason: reason.to_string(),
            note: note.to_string(),
            warning,
        });
    }
}

pub fn context(server: &FakeServer, cluster: &Arc<MockCluster>) -> Arc<Context> {
    Arc::new(Context::new(
        cluster.clone(),
        Arc::new(FakeConnector::new(server.clone())),
        OperatorConfig::default(),
    ))
}

fn meta(name: &str, uid: &str, finalizers: &[&str]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(uid.to_string()),
        finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
        ..Default::default()
    }
}

fn admin_ref() -> AdminConnectionRef {
    AdminConnectionRef {
        namespace: None,
        name: ADMIN_CONNECTION.to_string(),
    }
}

/// AdminConnection `apps/server` with default credentials
pub fn admin_connection() -> AdminConnection {
    let mut connection = AdminConnection::new(
        ADMIN_CONNECTION,
        AdminConnectionSpec {
            host: "mysql.db-system".into(),
            port: 3306,
            admin_user: None,
            admin_password: None,
            allowed_namespaces: vec![],
            tls_mode: Default::default(),
        },
    );
    connection.metadata = meta(ADMIN_CONNECTION, "admin-uid", &[]);
    connection
}

/// Database resource `apps/<name>` with no finalizer and no status
pub fn database(name: &str, uid: &str, live_name: &str) -> Database {
    let mut database = Database::new(
        name,
        DatabaseSpec {
            admin_connection: admin_ref(),
            name: live_name.to_string(),
            character_set: None,
            collation: None,
        },
    );
    database.metadata = meta(name, uid, &[]);
    database
}

/// DatabaseUser resource `apps/<name>` with no finalizer and no status
pub fn user(name: &str, uid: &str, username: &str) -> DatabaseUser {
    let mut user = DatabaseUser::new(
        name,
        DatabaseUserSpec {
            admin_connection: admin_ref(),
            username: username.to_string(),
            identification: None,
            database_permissions: vec![],
            tls: None,
        },
    );
    user.metadata = meta(name, uid, &[]);
    user
}

