use chrono::Utc;
use futures::StreamExt;
use kube::{
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    admin_username, decode_key, error_policy, grants, publish_outcome, resolve_admin_connection, Context, CONNECT_FAILED,
    NAMESPACE_NOT_ALLOWED,
};
use crate::cluster::ResourceKind;
use crate::crd::{AdminConnection, DatabaseUser, Identification};
use crate::error::{Error, Result};
use crate::ledger::{is_reserved, Ledger, LedgerTable, Ownership, Requester};
use crate::lifecycle::{with_finalizer, without_finalizer, Phase, USER_FINALIZER};
use crate::password::generate_password;
use crate::session::AdminSession;
use crate::sql;
use crate::validation;

pub const CREATED: &str = "Created user";
pub const RENAMED: &str = "User renamed";
pub const USER_ALTERED: &str = "User altered";
pub const ALTERED: &str = "Altered user";
pub const IN_SYNC: &str = "Database in sync";
pub const UPDATE_OWNERSHIP_FAILED: &str = "Ownership failed. Unable to update user.";
pub const CREATE_OWNERSHIP_FAILED: &str = "Ownership failed. Unable to create user.";
pub const SECRET_OWNERSHIP_FAILED: &str = "Ownership failed. Unable to claim identification secret.";
pub const RECONCILE_FAILED: &str = "Failed to reconcile user";

pub struct UserController {
    client: Client,
    context: Arc<Context>,
    namespace: Option<String>,
}

impl UserController {
    pub fn new(client: Client, context: Arc<Context>, namespace: Option<String>) -> Self {
        Self {
            client,
            context,
            namespace,
        }
    }

    pub async fn run(self) {
        let users = super::watched_api::<DatabaseUser>(self.client.clone(), self.namespace.as_deref());

        info!("Starting DatabaseUser controller");

        Controller::new(users, Config::default().any_semantic())
            .shutdown_on_signal()
            .run(reconcile, error_policy::<DatabaseUser>, self.context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .await;
    }
}

/// The auth string a user is identified with, and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
struct Credential {
    value: String,
    version: Option<String>,
}

enum SecretOutcome {
    /// The spec does not reference a secret.
    Absent,
    Ready(Credential),
    Conflict { owner: String },
}

pub async fn reconcile(user: Arc<DatabaseUser>, ctx: Arc<Context>) -> Result<Action> {
    let mut user = (*user).clone();
    let initialized = user.status.as_ref().is_some_and(|s| s.username.is_some());
    let phase = Phase::of(&user, USER_FINALIZER, initialized);

    info!(
        "Reconciling DatabaseUser {}/{} ({:?})",
        user.namespace().unwrap_or_default(),
        user.name_any(),
        phase
    );

    match phase {
        Phase::Unregistered => {
            ctx.cluster
                .set_finalizers(
                    ResourceKind::DatabaseUser,
                    &user.namespace().unwrap_or_default(),
                    &user.name_any(),
                    with_finalizer(&user, USER_FINALIZER),
                )
                .await?;
            Ok(Action::await_change())
        }
        Phase::Registered => {
            let username = user.spec.username.clone();
            user.status_mut().username = Some(username);
            ctx.cluster.update_user_status(&user).await?;
            Ok(Action::requeue(ctx.config.phase_requeue))
        }
        Phase::Converging => converge_and_report(&mut user, &ctx).await,
        Phase::Deleting => teardown(&user, &ctx).await,
        Phase::Finalized => Ok(Action::await_change()),
    }
}

async fn converge_and_report(user: &mut DatabaseUser, ctx: &Context) -> Result<Action> {
    let result = converge(user, ctx).await;
    if result.is_ok() {
        user.status_mut().sync_time = Some(Utc::now());
    }

    if let Err(e) = ctx.cluster.update_user_status(user).await {
        if result.is_ok() {
            return Err(e);
        }
        warn!("Failed to update status of DatabaseUser {}: {}", user.name_any(), e);
    }

    let message = user.status_mut().message.clone().unwrap_or_default();
    publish_outcome(ctx, user, &message, &result).await;
    result.map(|()| Action::requeue(ctx.config.resync_interval))
}

fn record(user: &mut DatabaseUser, message: &str) {
    user.status_mut().message = Some(message.to_string());
}

/// Pass `result` through, recording `message` if it failed.
fn recorded<T>(user: &mut DatabaseUser, message: &str, result: Result<T>) -> Result<T> {
    if result.is_err() {
        record(user, message);
    }
    result
}

/// Bring the live account in line with the spec, recording the outcome in status.
pub async fn converge(user: &mut DatabaseUser, ctx: &Context) -> Result<()> {
    validation::validate_username(&user.spec.username)?;
    validation::validate_permissions(&user.spec.database_permissions)?;

    let namespace = user.namespace().unwrap_or_default();
    let admin = resolve_admin_connection(ctx.cluster.as_ref(), &namespace, &user.spec.admin_connection).await?;
    if !admin.allows_namespace(&namespace) {
        record(user, NAMESPACE_NOT_ALLOWED);
        return Ok(());
    }

    let credential = match identification_secret(user, ctx, &namespace).await? {
        SecretOutcome::Absent => None,
        SecretOutcome::Ready(credential) => Some(credential),
        SecretOutcome::Conflict { owner } => {
            info!("Identification secret of {}/{} is controlled by {}", namespace, user.name_any(), owner);
            record(user, SECRET_OWNERSHIP_FAILED);
            return Ok(());
        }
    };

    let session = recorded(user, CONNECT_FAILED, ctx.session(&admin).await)?;
    let current = user.live_username().to_string();
    let exists = session.user_exists(&current).await?;

    let admin_user = admin_username(ctx.cluster.as_ref(), &admin).await?;
    let reserved = [&current, &user.spec.username]
        .into_iter()
        .find(|name| protected_user(&admin_user, name))
        .cloned();
    if let Some(name) = reserved {
        info!("User {} is reserved, refusing to manage it", name);
        record(user, if exists { UPDATE_OWNERSHIP_FAILED } else { CREATE_OWNERSHIP_FAILED });
        return Ok(());
    }

    if exists {
        update(user, session.as_ref(), ctx, &admin, &current, credential.as_ref()).await
    } else {
        create(user, session.as_ref(), ctx, &admin, credential.as_ref()).await
    }
}

async fn create(
    user: &mut DatabaseUser,
    session: &dyn AdminSession,
    ctx: &Context,
    admin: &AdminConnection,
    credential: Option<&Credential>,
) -> Result<()> {
    let ledger = Ledger::new(session);
    let requester = Requester::of(&*user);
    let username = user.spec.username.clone();

    if let Ownership::Theirs(claim) = ledger.ownership(LedgerTable::Users, &username, &requester).await? {
        info!("User {} is claimed by {}/{}", username, claim.namespace, claim.name);
        record(user, CREATE_OWNERSHIP_FAILED);
        return Ok(());
    }

    let mut details = sql::identified_clause(
        user.spec.identification.as_ref(),
        credential.map(|c| c.value.as_str()),
    );
    if user.spec.tls.is_some() {
        details.push_str(&sql::require_clause(user.spec.tls.as_ref()));
    }
    let created = session.execute(&sql::create_user(&username, &details)).await;
    recorded(user, RECONCILE_FAILED, created)?;
    if !ledger.adopt(LedgerTable::Users, &username, &requester).await? {
        record(user, CREATE_OWNERSHIP_FAILED);
        return Ok(());
    }
    info!("Created user {}", username);

    let identification = user.spec.identification.clone();
    let tls = user.spec.tls.clone();
    let status = user.status_mut();
    status.username = Some(username);
    status.creation_time = Some(Utc::now());
    status.identification = identification;
    status.identification_resource_version = credential.and_then(|c| c.version.clone());
    status.tls = tls;
    status.grants.clear();
    status.database_permissions.clear();

    let granted = grants::reconcile(session, ctx.cluster.as_ref(), admin, user).await;
    recorded(user, RECONCILE_FAILED, granted)?;
    record(user, CREATED);
    Ok(())
}

/// Ordered update: ownership, rename, identification/TLS drift, then grants.
/// The first step that changes something ends the pass.
async fn update(
    user: &mut DatabaseUser,
    session: &dyn AdminSession,
    ctx: &Context,
    admin: &AdminConnection,
    current: &str,
    credential: Option<&Credential>,
) -> Result<()> {
    let ledger = Ledger::new(session);
    let requester = Requester::of(&*user);

    let owned = match ledger.ownership(LedgerTable::Users, current, &requester).await? {
        Ownership::Mine => true,
        Ownership::Unclaimed => ledger.adopt(LedgerTable::Users, current, &requester).await?,
        Ownership::Theirs(_) => false,
    };
    if !owned {
        record(user, UPDATE_OWNERSHIP_FAILED);
        return Ok(());
    }

    let desired = user.spec.username.clone();
    if desired != current {
        let taken = session.user_exists(&desired).await?
            || matches!(
                ledger.ownership(LedgerTable::Users, &desired, &requester).await?,
                Ownership::Theirs(_)
            );
        if taken {
            info!("Cannot rename {} to {}: name is taken", current, desired);
            record(user, UPDATE_OWNERSHIP_FAILED);
            return Ok(());
        }
        if !ledger.transfer(LedgerTable::Users, &desired, &requester).await? {
            info!("Cannot rename {} to {}: claim on the new name was refused", current, desired);
            record(user, UPDATE_OWNERSHIP_FAILED);
            return Ok(());
        }
        if let Err(e) = session.execute(&sql::rename_user(current, &desired)).await {
            if let Err(restore) = ledger.transfer(LedgerTable::Users, current, &requester).await {
                warn!("Failed to move claim back to {}: {}", current, restore);
            }
            record(user, RECONCILE_FAILED);
            return Err(e);
        }
        info!("Renamed user {} to {}", current, desired);
        user.status_mut().username = Some(desired);
        record(user, RENAMED);
        return Ok(());
    }

    let applied = user.status.clone().unwrap_or_default();
    let version_changed =
        credential.is_some_and(|c| c.version != applied.identification_resource_version);
    let plugin = |i: Option<&Identification>| i.and_then(|i| i.auth_plugin.clone());
    let plugin_changed =
        plugin(user.spec.identification.as_ref()) != plugin(applied.identification.as_ref());
    let tls_changed = user.spec.tls != applied.tls;

    if version_changed || plugin_changed || tls_changed {
        let mut details = String::new();
        if version_changed || plugin_changed {
            details = sql::alter_identified_clause(
                user.spec.identification.as_ref(),
                credential.map(|c| c.value.as_str()),
            );
            if details.is_empty() && credential.is_some() {
                warn!("User {} has a hashed password without a plugin, it cannot be altered", current);
            }
        }
        if tls_changed {
            details.push_str(&sql::require_clause(user.spec.tls.as_ref()));
        }

        if !details.is_empty() {
            let altered = session.execute(&sql::alter_user(current, &details)).await;
            recorded(user, RECONCILE_FAILED, altered)?;
        }
        let identification = user.spec.identification.clone();
        let tls = user.spec.tls.clone();
        let status = user.status_mut();
        status.identification = identification;
        status.identification_resource_version = credential.and_then(|c| c.version.clone());
        status.tls = tls;
        if !details.is_empty() {
            info!("Altered user {}", current);
            record(user, USER_ALTERED);
            return Ok(());
        }
    }

    let granted = grants::reconcile(session, ctx.cluster.as_ref(), admin, user).await;
    let changed = recorded(user, RECONCILE_FAILED, granted)?;
    record(user, if changed { ALTERED } else { IN_SYNC });
    Ok(())
}

/// Built-in accounts and the admin login itself are off limits.
fn protected_user(admin_user: &str, username: &str) -> bool {
    username == admin_user || is_reserved(LedgerTable::Users, username)
}

/// Take control of the identification secret before anything else is touched.
async fn identification_secret(user: &DatabaseUser, ctx: &Context, namespace: &str) -> Result<SecretOutcome> {
    let Some(identification) = user.spec.identification.as_ref() else {
        return Ok(SecretOutcome::Absent);
    };
    let Some(source) = identification.auth_string.as_ref() else {
        return Ok(SecretOutcome::Absent);
    };
    let reference = &source.secret_key_ref;
    let owner = user
        .controller_owner_ref(&())
        .ok_or_else(|| Error::InvalidSpec(format!("DatabaseUser {} has no uid", user.name_any())))?;

    let secret = match ctx.cluster.secret(namespace, &reference.name).await? {
        Some(secret) => match secret.controller_uid.as_deref() {
            Some(controller) if controller == owner.uid => secret,
            Some(controller) => {
                return Ok(SecretOutcome::Conflict {
                    owner: controller.to_string(),
                })
            }
            None => ctx.cluster.claim_secret(namespace, &reference.name, owner).await?,
        },
        None if identification.clear_text => {
            debug!("Generating password for {}/{}", namespace, user.name_any());
            let password = generate_password(&ctx.config.password_policy);
            ctx.cluster
                .create_secret(namespace, &reference.name, &reference.key, &password, owner)
                .await?
        }
        None => {
            return Err(Error::not_found(
                "Secret",
                format!("{}/{}", namespace, reference.name),
            ))
        }
    };

    let value = decode_key(&secret.data, namespace, &reference.name, &reference.key)?;
    Ok(SecretOutcome::Ready(Credential {
        value,
        version: secret.resource_version,
    }))
}

/// Drop the live account if it is provably ours, then release the finalizer.
async fn teardown(user: &DatabaseUser, ctx: &Context) -> Result<Action> {
    let namespace = user.namespace().unwrap_or_default();
    let username = user.live_username();

    match resolve_admin_connection(ctx.cluster.as_ref(), &namespace, &user.spec.admin_connection).await {
        Err(e) if e.is_not_found() => {
            info!("Admin connection for DatabaseUser {}/{} is gone, skipping drop", namespace, user.name_any());
        }
        Err(e) => return Err(e),
        Ok(admin) if !admin.allows_namespace(&namespace) => {
            info!("Namespace {} not allowed by admin connection, skipping drop", namespace);
        }
        Ok(admin) => {
            let session = ctx.session(&admin).await?;
            let admin_user = admin_username(ctx.cluster.as_ref(), &admin).await?;
            let ledger = Ledger::new(session.as_ref());
            let requester = Requester::of(user);
            match ledger.ownership(LedgerTable::Users, username, &requester).await? {
                Ownership::Mine if !protected_user(&admin_user, username) => {
                    session.execute(&sql::drop_user(username)).await?;
                    ledger.release(LedgerTable::Users, &requester).await?;
                    info!("Dropped user {}", username);
                }
                _ => info!("User {} is not ours, skipping drop", username),
            }
        }
    }

    ctx.cluster
        .set_finalizers(
            ResourceKind::DatabaseUser,
            &namespace,
            &user.name_any(),
            without_finalizer(user, USER_FINALIZER),
        )
        .await?;
    Ok(Action::await_change())
}
