use chrono::Utc;
use futures::StreamExt;
use kube::{
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use std::sync::Arc;
use tracing::{info, warn};

use super::{error_policy, publish_outcome, resolve_admin_connection, Context, CONNECT_FAILED, NAMESPACE_NOT_ALLOWED};
use crate::cluster::ResourceKind;
use crate::crd::Database;
use crate::error::{Error, Result};
use crate::ledger::{is_reserved, Ledger, LedgerTable, Ownership, Requester};
use crate::lifecycle::{with_finalizer, without_finalizer, Phase, DATABASE_FINALIZER};
use crate::session::SchemaInfo;
use crate::sql;
use crate::validation::{self, CharsetCheck};

pub const CREATED: &str = "Created database";
pub const ALTERED: &str = "Altered database";
pub const IN_SYNC: &str = "Database in sync";
pub const NO_PERMISSION: &str = "No permission to this database.";
pub const CREATE_FAILED: &str = "Failed to create database";
pub const ALTER_FAILED: &str = "Failed to alter database";

pub struct DatabaseController {
    client: Client,
    context: Arc<Context>,
    namespace: Option<String>,
}

impl DatabaseController {
    pub fn new(client: Client, context: Arc<Context>, namespace: Option<String>) -> Self {
        Self {
            client,
            context,
            namespace,
        }
    }

    pub async fn run(self) {
        let databases = super::watched_api::<Database>(self.client.clone(), self.namespace.as_deref());

        info!("Starting Database controller");

        Controller::new(databases, Config::default().any_semantic())
            .shutdown_on_signal()
            .run(reconcile, error_policy::<Database>, self.context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .await;
    }
}

pub async fn reconcile(database: Arc<Database>, ctx: Arc<Context>) -> Result<Action> {
    let mut database = (*database).clone();
    let initialized = database.status.as_ref().is_some_and(|s| s.name.is_some());
    let phase = Phase::of(&database, DATABASE_FINALIZER, initialized);

    info!(
        "Reconciling Database {}/{} ({:?})",
        database.namespace().unwrap_or_default(),
        database.name_any(),
        phase
    );

    match phase {
        Phase::Unregistered => register(&database, &ctx).await,
        Phase::Registered => initialize(&mut database, &ctx).await,
        Phase::Converging => converge_and_report(&mut database, &ctx).await,
        Phase::Deleting => teardown(&database, &ctx).await,
        Phase::Finalized => Ok(Action::await_change()),
    }
}

async fn register(database: &Database, ctx: &Context) -> Result<Action> {
    ctx.cluster
        .set_finalizers(
            ResourceKind::Database,
            &database.namespace().unwrap_or_default(),
            &database.name_any(),
            with_finalizer(database, DATABASE_FINALIZER),
        )
        .await?;
    Ok(Action::await_change())
}

/// Resolve the live identity once; it is never re-derived from the spec.
async fn initialize(database: &mut Database, ctx: &Context) -> Result<Action> {
    let namespace = database.namespace().unwrap_or_default();
    let admin = resolve_admin_connection(ctx.cluster.as_ref(), &namespace, &database.spec.admin_connection).await?;

    let name = database.spec.name.clone();
    let status = database.status_mut();
    status.host = Some(admin.spec.host.clone());
    status.port = Some(admin.spec.port);
    status.name = Some(name);
    ctx.cluster.update_database_status(database).await?;
    Ok(Action::requeue(ctx.config.phase_requeue))
}

async fn converge_and_report(database: &mut Database, ctx: &Context) -> Result<Action> {
    let result = converge(database, ctx).await;
    if result.is_ok() {
        database.status_mut().sync_time = Some(Utc::now());
    }

    if let Err(e) = ctx.cluster.update_database_status(database).await {
        if result.is_ok() {
            return Err(e);
        }
        warn!("Failed to update status of Database {}: {}", database.name_any(), e);
    }

    let message = database.status_mut().message.clone().unwrap_or_default();
    publish_outcome(ctx, database, &message, &result).await;
    result.map(|()| Action::requeue(ctx.config.resync_interval))
}

fn record(database: &mut Database, info: Option<&SchemaInfo>, message: &str) {
    let status = database.status_mut();
    if let Some(info) = info {
        status.character_set = Some(info.character_set.clone());
        status.collation = Some(info.collation.clone());
    }
    status.message = Some(message.to_string());
}

/// Bring the live database in line with the spec, recording the outcome in status.
pub async fn converge(database: &mut Database, ctx: &Context) -> Result<()> {
    validation::validate_database_name(&database.spec.name)?;
    validation::validate_database_update(database.live_name(), &database.spec)?;

    let namespace = database.namespace().unwrap_or_default();
    let admin = resolve_admin_connection(ctx.cluster.as_ref(), &namespace, &database.spec.admin_connection).await?;
    if !admin.allows_namespace(&namespace) {
        record(database, None, NAMESPACE_NOT_ALLOWED);
        return Ok(());
    }
    if is_reserved(LedgerTable::Databases, database.live_name()) {
        info!("Database {} is reserved, refusing to manage it", database.live_name());
        record(database, None, NO_PERMISSION);
        return Ok(());
    }

    let character_set = database.spec.character_set.clone().filter(|s| !s.is_empty());
    let collation = database.spec.collation.clone().filter(|s| !s.is_empty());
    match validation::validate_charset_collation(&admin, character_set.as_deref(), collation.as_deref()) {
        CharsetCheck::Ok => {}
        CharsetCheck::Warning(w) => warn!("Database {}: {}", database.name_any(), w),
        CharsetCheck::Rejected(r) => return Err(Error::InvalidSpec(r.to_string())),
    }

    let status = database.status_mut();
    status.host = Some(admin.spec.host.clone());
    status.port = Some(admin.spec.port);

    let session = match ctx.session(&admin).await {
        Ok(session) => session,
        Err(e) => {
            record(database, None, CONNECT_FAILED);
            return Err(e);
        }
    };
    let ledger = Ledger::new(session.as_ref());
    let requester = Requester::of(&*database);
    let name = database.live_name().to_string();

    let Some(existing) = session.schema(&name).await? else {
        if let Ownership::Theirs(claim) = ledger.ownership(LedgerTable::Databases, &name, &requester).await? {
            info!("Database {} is claimed by {}/{}", name, claim.namespace, claim.name);
            record(database, None, NO_PERMISSION);
            return Ok(());
        }

        let statement = sql::create_database(&name, character_set.as_deref(), collation.as_deref());
        if let Err(e) = session.execute(&statement).await {
            record(database, None, CREATE_FAILED);
            return Err(e);
        }
        if !ledger.adopt(LedgerTable::Databases, &name, &requester).await? {
            record(database, None, NO_PERMISSION);
            return Ok(());
        }
        info!("Created database {}", name);

        let created = session.schema(&name).await?;
        database.status_mut().creation_time = Some(Utc::now());
        record(database, created.as_ref(), CREATED);
        return Ok(());
    };

    let owned = match ledger.ownership(LedgerTable::Databases, &name, &requester).await? {
        Ownership::Mine => true,
        Ownership::Unclaimed => ledger.adopt(LedgerTable::Databases, &name, &requester).await?,
        Ownership::Theirs(_) => false,
    };
    if !owned {
        record(database, Some(&existing), NO_PERMISSION);
        return Ok(());
    }

    let charset_change = character_set.filter(|cs| *cs != existing.character_set);
    let collation_change = collation.filter(|co| *co != existing.collation);
    let Some(statement) = sql::alter_database(&name, charset_change.as_deref(), collation_change.as_deref()) else {
        record(database, Some(&existing), IN_SYNC);
        return Ok(());
    };

    if let Err(e) = session.execute(&statement).await {
        record(database, Some(&existing), ALTER_FAILED);
        return Err(e);
    }
    info!("Altered database {}", name);
    let altered = session.schema(&name).await?;
    record(database, altered.as_ref(), ALTERED);
    Ok(())
}

/// Drop the live database if it is provably ours, then release the finalizer.
async fn teardown(database: &Database, ctx: &Context) -> Result<Action> {
    let namespace = database.namespace().unwrap_or_default();
    let name = database.live_name();

    match resolve_admin_connection(ctx.cluster.as_ref(), &namespace, &database.spec.admin_connection).await {
        Err(e) if e.is_not_found() => {
            info!("Admin connection for Database {}/{} is gone, skipping drop", namespace, database.name_any());
        }
        Err(e) => return Err(e),
        Ok(admin) if !admin.allows_namespace(&namespace) => {
            info!("Namespace {} not allowed by admin connection, skipping drop", namespace);
        }
        Ok(admin) => {
            let session = ctx.session(&admin).await?;
            let ledger = Ledger::new(session.as_ref());
            let requester = Requester::of(database);
            match ledger.ownership(LedgerTable::Databases, name, &requester).await? {
                Ownership::Mine if !is_reserved(LedgerTable::Databases, name) => {
                    session.execute(&sql::drop_database(name)).await?;
                    ledger.release(LedgerTable::Databases, &requester).await?;
                    info!("Dropped database {}", name);
                }
                _ => info!("Database {} is not ours, skipping drop", name),
            }
        }
    }

    ctx.cluster
        .set_finalizers(
            ResourceKind::Database,
            &namespace,
            &database.name_any(),
            without_finalizer(database, DATABASE_FINALIZER),
        )
        .await?;
    Ok(Action::await_change())
}
