//! Grant reconciliation: revoke everything, then grant the declared list.
//!
//! Partial diffs are not attempted; `ALL` and enumerated privileges overlap in
//! ways `SHOW GRANTS` does not report faithfully.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::crd::{AdminConnection, DatabasePermission, DatabaseUser};
use crate::error::Result;
use crate::ledger::{Ledger, LedgerTable, Ownership, Requester};
use crate::session::AdminSession;
use crate::sql;

/// Grants reported by the server, baseline entry excluded
pub async fn observed_grants(session: &dyn AdminSession, username: &str) -> Result<Vec<String>> {
    Ok(session
        .show_grants(username)
        .await?
        .into_iter()
        .filter(|g| !sql::is_baseline_grant(g))
        .collect())
}

/// Converge the user's grants; returns whether anything was changed.
pub async fn reconcile(
    session: &dyn AdminSession,
    cluster: &dyn Cluster,
    admin: &AdminConnection,
    user: &mut DatabaseUser,
) -> Result<bool> {
    let username = user.live_username().to_string();
    user.status_mut().grants = observed_grants(session, &username).await?;
    if user.permissions_in_sync() {
        return Ok(false);
    }

    let status = user.status_mut();
    if !status.grants.is_empty() {
        session.execute(&sql::revoke_all(&username)).await?;
    }
    status.grants.clear();
    status.database_permissions.clear();

    let namespace = user.namespace().unwrap_or_default();
    let permissions = user.spec.database_permissions.clone();
    for permission in &permissions {
        let Some(target) = resolve_target(session, cluster, admin, &namespace, permission).await? else {
            continue;
        };
        session
            .execute(&sql::grant(&target, &permission.grants, &username)?)
            .await?;
        info!("Granted {:?} on {} to {}", permission.grants, target, username);
    }

    let status = user.status_mut();
    status.grants = observed_grants(session, &username).await?;
    status.database_permissions = permissions;
    Ok(true)
}

/// Live database name for a permission, when it is ours to grant on.
async fn resolve_target(
    session: &dyn AdminSession,
    cluster: &dyn Cluster,
    admin: &AdminConnection,
    namespace: &str,
    permission: &DatabasePermission,
) -> Result<Option<String>> {
    let Some(database) = cluster.database(namespace, &permission.database_name).await? else {
        warn!(
            "Database {}/{} not found, skipping grant",
            namespace, permission.database_name
        );
        return Ok(None);
    };

    let reference = &database.spec.admin_connection;
    let same_server = reference.name == admin.name_any()
        && Some(reference.namespace_or(namespace)) == admin.namespace().as_deref();
    if !same_server {
        warn!(
            "Database {}/{} uses a different admin connection, skipping grant",
            namespace, permission.database_name
        );
        return Ok(None);
    }

    let live_name = database.live_name().to_string();
    let ownership = Ledger::new(session)
        .ownership(LedgerTable::Databases, &live_name, &Requester::of(&database))
        .await?;
    if ownership != Ownership::Mine {
        debug!("Database {} is not owned by {}/{}, skipping grant", live_name, namespace, database.name_any());
        return Ok(None);
    }
    Ok(Some(live_name))
}
