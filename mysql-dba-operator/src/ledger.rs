//! Control ledger: which managed resource owns which live database or user.
//!
//! A row is the proof of ownership. The live-object name column is unique, so
//! the first requester to insert a row for a name holds the claim.

use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::session::AdminSession;
use crate::sql::quote_identifier;

/// Control database created on every admin endpoint.
pub const CONTROL_DATABASE: &str = "zz_dba_operator";

/// Schemas the server or the ledger itself depend on
const RESERVED_DATABASES: &[&str] = &[
    "mysql",
    "sys",
    "performance_schema",
    "information_schema",
    CONTROL_DATABASE,
];

/// Accounts the server ships with
const RESERVED_USERS: &[&str] = &["root", "mysql.sys", "mysql.session", "mysql.infoschema"];

/// Objects that are never created, claimed or dropped for a managed resource.
pub fn is_reserved(table: LedgerTable, object_name: &str) -> bool {
    let reserved = match table {
        LedgerTable::Databases => RESERVED_DATABASES,
        LedgerTable::Users => RESERVED_USERS,
    };
    reserved.iter().any(|r| r.eq_ignore_ascii_case(object_name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LedgerTable {
    Databases,
    Users,
}

impl LedgerTable {
    pub fn table_name(self) -> &'static str {
        match self {
            LedgerTable::Databases => "managed_databases",
            LedgerTable::Users => "managed_users",
        }
    }

    pub fn object_column(self) -> &'static str {
        match self {
            LedgerTable::Databases => "database_name",
            LedgerTable::Users => "username",
        }
    }

    pub fn qualified_name(self) -> String {
        format!(
            "{}.{}",
            quote_identifier(CONTROL_DATABASE),
            quote_identifier(self.table_name())
        )
    }

    fn object_size(self) -> u32 {
        match self {
            LedgerTable::Databases => 64,
            LedgerTable::Users => 32,
        }
    }

    fn create_statement(self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             uuid VARCHAR(36) NOT NULL PRIMARY KEY, \
             namespace VARCHAR(64) NOT NULL, \
             name VARCHAR(64) NOT NULL, \
             {} VARCHAR({}) NOT NULL UNIQUE, \
             created_at DATETIME NOT NULL, \
             updated_at DATETIME NOT NULL)",
            self.qualified_name(),
            self.object_column(),
            self.object_size()
        )
    }
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub object_name: String,
}

/// The managed resource asking about a live object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

impl Requester {
    pub fn of<K: Resource>(resource: &K) -> Self {
        Self {
            uid: resource.uid().unwrap_or_default(),
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name_any(),
        }
    }

    fn claim(&self, object_name: &str) -> Claim {
        Claim {
            uid: self.uid.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            object_name: object_name.to_string(),
        }
    }

    /// Identity, name and namespace must all match the row.
    fn holds(&self, claim: &Claim) -> bool {
        claim.uid == self.uid && claim.namespace == self.namespace && claim.name == self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// No row names the object; anyone may claim it.
    Unclaimed,
    Mine,
    Theirs(Claim),
}

/// Ledger operations over a validated session
pub struct Ledger<'a> {
    session: &'a dyn AdminSession,
}

impl<'a> Ledger<'a> {
    pub fn new(session: &'a dyn AdminSession) -> Self {
        Self { session }
    }

    /// Create the control database and tables, and select the control database.
    pub async fn ensure_schema(&self) -> Result<()> {
        let db = quote_identifier(CONTROL_DATABASE);
        self.session
            .execute(&format!("CREATE DATABASE IF NOT EXISTS {}", db))
            .await?;
        self.session.execute(&format!("USE {}", db)).await?;
        for table in [LedgerTable::Databases, LedgerTable::Users] {
            self.session.execute(&table.create_statement()).await?;
        }
        debug!("Control schema {} ready", CONTROL_DATABASE);
        Ok(())
    }

    pub async fn ownership(
        &self,
        table: LedgerTable,
        object_name: &str,
        requester: &Requester,
    ) -> Result<Ownership> {
        Ok(match self.session.find_claim(table, object_name).await? {
            None => Ownership::Unclaimed,
            Some(claim) if requester.holds(&claim) => Ownership::Mine,
            Some(claim) => Ownership::Theirs(claim),
        })
    }

    /// Insert a row for `object_name`; `false` when another requester got there first.
    pub async fn claim(
        &self,
        table: LedgerTable,
        object_name: &str,
        requester: &Requester,
    ) -> Result<bool> {
        if is_reserved(table, object_name) {
            warn!("Refusing to claim reserved name {}", object_name);
            return Ok(false);
        }
        let claimed = self
            .session
            .insert_claim(table, &requester.claim(object_name))
            .await?;
        if claimed {
            info!(
                "Claimed {} for {}/{}",
                object_name, requester.namespace, requester.name
            );
        }
        Ok(claimed)
    }

    /// Move the requester's claim onto a new object name. When the new name
    /// cannot be claimed the previous claim is put back and `false` returned.
    pub async fn transfer(
        &self,
        table: LedgerTable,
        object_name: &str,
        requester: &Requester,
    ) -> Result<bool> {
        if is_reserved(table, object_name) {
            return Ok(false);
        }
        let previous = self.session.find_claim_by_uid(table, &requester.uid).await?;
        self.session.delete_claim(table, &requester.uid).await?;
        if self.claim(table, object_name, requester).await? {
            return Ok(true);
        }
        if let Some(previous) = previous {
            if !self.session.insert_claim(table, &previous).await? {
                warn!("Lost claim on {} while moving it to {}", previous.object_name, object_name);
            }
        }
        Ok(false)
    }

    pub async fn release(&self, table: LedgerTable, requester: &Requester) -> Result<()> {
        self.session.delete_claim(table, &requester.uid).await
    }

    /// Claim an unclaimed object and report whether the requester now owns it.
    pub async fn adopt(
        &self,
        table: LedgerTable,
        object_name: &str,
        requester: &Requester,
    ) -> Result<bool> {
        if is_reserved(table, object_name) {
            return Ok(false);
        }
        match self.ownership(table, object_name, requester).await? {
            Ownership::Mine => Ok(true),
            Ownership::Theirs(_) => Ok(false),
            Ownership::Unclaimed => {
                // A stale row under our identity would block the insert.
                if let Some(stale) = self.session.find_claim_by_uid(table, &requester.uid).await? {
                    if stale.object_name != object_name {
                        return self.transfer(table, object_name, requester).await;
                    }
                }
                self.claim(table, object_name, requester).await
            }
        }
    }
}
