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
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{error_policy, publish_outcome, Context, CONNECT_FAILED};
use crate::cluster::ResourceKind;
use crate::crd::{AdminConnection, Charset, Collation};
use crate::error::{Error, Result};
use crate::ledger::CONTROL_DATABASE;
use crate::lifecycle::{with_finalizer, without_finalizer, Phase, ADMIN_CONNECTION_FINALIZER};
use crate::session::CollationRow;

pub const PINGED: &str = "Successfully pinged database";
pub const CHARSET_FAILED: &str = "Failed to retrieve default server character set";
pub const COLLATION_FAILED: &str = "Failed to retrieve default server collation";
pub const CHARSETS_FAILED: &str = "Failed to retrieve available character sets";

pub struct AdminConnectionController {
    client: Client,
    context: Arc<Context>,
    namespace: Option<String>,
}

impl AdminConnectionController {
    pub fn new(client: Client, context: Arc<Context>, namespace: Option<String>) -> Self {
        Self {
            client,
            context,
            namespace,
        }
    }

    pub async fn run(self) {
        let connections =
            super::watched_api::<AdminConnection>(self.client.clone(), self.namespace.as_deref());

        info!("Starting AdminConnection controller");

        Controller::new(connections, Config::default().any_semantic())
            .shutdown_on_signal()
            .run(reconcile, error_policy::<AdminConnection>, self.context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .await;
    }
}

pub async fn reconcile(connection: Arc<AdminConnection>, ctx: Arc<Context>) -> Result<Action> {
    let mut connection = (*connection).clone();
    let phase = Phase::of(&connection, ADMIN_CONNECTION_FINALIZER, true);

    info!(
        "Reconciling AdminConnection {}/{} ({:?})",
        connection.namespace().unwrap_or_default(),
        connection.name_any(),
        phase
    );

    match phase {
        Phase::Unregistered => {
            set_finalizers(&connection, &ctx, with_finalizer(&connection, ADMIN_CONNECTION_FINALIZER)).await
        }
        Phase::Registered | Phase::Converging => inspect_and_report(&mut connection, &ctx).await,
        Phase::Deleting => {
            ctx.registry.evict(&connection.identity()).await;
            set_finalizers(&connection, &ctx, without_finalizer(&connection, ADMIN_CONNECTION_FINALIZER)).await
        }
        Phase::Finalized => Ok(Action::await_change()),
    }
}

async fn set_finalizers(connection: &AdminConnection, ctx: &Context, finalizers: Vec<String>) -> Result<Action> {
    ctx.cluster
        .set_finalizers(
            ResourceKind::AdminConnection,
            &connection.namespace().unwrap_or_default(),
            &connection.name_any(),
            finalizers,
        )
        .await?;
    Ok(Action::await_change())
}

async fn inspect_and_report(connection: &mut AdminConnection, ctx: &Context) -> Result<Action> {
    let result = inspect(connection, ctx).await;
    if let Err(e) = ctx.cluster.update_admin_connection_status(connection).await {
        if result.is_ok() {
            return Err(e);
        }
        warn!("Failed to update status of AdminConnection {}: {}", connection.name_any(), e);
    }

    let message = connection
        .status
        .as_ref()
        .and_then(|s| s.message.clone())
        .unwrap_or_default();
    publish_outcome(ctx, connection, &message, &result).await;
    result.map(|()| Action::requeue(ctx.config.resync_interval))
}

/// Validate the connection and read the server's charset defaults and table.
async fn inspect(connection: &mut AdminConnection, ctx: &Context) -> Result<()> {
    let status = connection.status.get_or_insert_with(Default::default);
    status.control_database = Some(CONTROL_DATABASE.to_string());

    let fail = |connection: &mut AdminConnection, message: &str, e: Error| -> Result<()> {
        if let Some(status) = connection.status.as_mut() {
            status.message = Some(message.to_string());
        }
        Err(e)
    };

    let session = match ctx.session(connection).await {
        Ok(session) => session,
        Err(e) => return fail(connection, CONNECT_FAILED, e),
    };

    let character_set = match session.server_variable("character_set_server").await {
        Ok(value) => value,
        Err(e) => return fail(connection, CHARSET_FAILED, e),
    };
    let collation = match session.server_variable("collation_server").await {
        Ok(value) => value,
        Err(e) => return fail(connection, COLLATION_FAILED, e),
    };
    let rows = match session.collations().await {
        Ok(rows) => rows,
        Err(e) => return fail(connection, CHARSETS_FAILED, e),
    };

    let status = connection.status.get_or_insert_with(Default::default);
    status.character_set = character_set;
    status.collation = collation;
    status.available_charsets = charset_table(rows);
    status.sync_time = Some(Utc::now());
    status.message = Some(PINGED.to_string());
    Ok(())
}

/// Group SHOW COLLATION rows by charset, both levels sorted by name.
fn charset_table(rows: Vec<CollationRow>) -> Vec<Charset> {
    let mut by_charset: BTreeMap<String, Vec<Collation>> = BTreeMap::new();
    for row in rows {
        by_charset.entry(row.charset).or_default().push(Collation {
            name: row.collation,
            default: row.is_default,
        });
    }
    by_charset
        .into_iter()
        .map(|(name, mut collations)| {
            collations.sort_by(|a, b| a.name.cmp(&b.name));
            Charset { name, collations }
        })
        .collect()
}
