//! Convergence controllers and the plumbing they share.

pub mod admin_connection;
pub mod database;
pub mod grants;
pub mod user;

use kube::{
    api::Api,
    runtime::controller::Action,
    Client, Resource, ResourceExt,
};
use std::sync::Arc;
use tracing::{error, warn};

use crate::cluster::Cluster;
use crate::config::OperatorConfig;
use crate::crd::{AdminConnection, AdminConnectionRef, SecretKeySource};
use crate::error::{Error, Result};
use crate::registry::ConnectionRegistry;
use crate::session::{AdminSession, ConnectionConfig, Connector};

pub const NAMESPACE_NOT_ALLOWED: &str = "Namespace not allowed by admin connection";
pub const CONNECT_FAILED: &str = "Failed to connect or ping database";

const DEFAULT_ADMIN_USER: &str = "root";

/// Shared by every controller
pub struct Context {
    pub cluster: Arc<dyn Cluster>,
    pub registry: ConnectionRegistry,
    pub config: OperatorConfig,
}

impl Context {
    pub fn new(cluster: Arc<dyn Cluster>, connector: Arc<dyn Connector>, config: OperatorConfig) -> Self {
        Self {
            cluster,
            registry: ConnectionRegistry::new(connector, config.sql_timeout),
            config,
        }
    }

    /// Validated session for `admin`, built from its current credentials.
    pub async fn session(&self, admin: &AdminConnection) -> Result<Arc<dyn AdminSession>> {
        let config = connection_config(self.cluster.as_ref(), admin).await?;
        self.registry.obtain(&admin.identity(), config).await
    }
}

/// Watch one namespace, or all of them.
pub fn watched_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

pub async fn resolve_admin_connection(
    cluster: &dyn Cluster,
    caller_namespace: &str,
    reference: &AdminConnectionRef,
) -> Result<AdminConnection> {
    let namespace = reference.namespace_or(caller_namespace);
    cluster
        .admin_connection(namespace, &reference.name)
        .await?
        .ok_or_else(|| Error::not_found("AdminConnection", format!("{}/{}", namespace, reference.name)))
}

/// Read one key of a Secret as UTF-8, with the Secret's resource version.
pub async fn secret_value(
    cluster: &dyn Cluster,
    namespace: &str,
    source: &SecretKeySource,
) -> Result<(String, Option<String>)> {
    let reference = &source.secret_key_ref;
    let secret = cluster
        .secret(namespace, &reference.name)
        .await?
        .ok_or_else(|| Error::not_found("Secret", format!("{}/{}", namespace, reference.name)))?;
    let value = decode_key(&secret.data, namespace, &reference.name, &reference.key)?;
    Ok((value, secret.resource_version))
}

pub(crate) fn decode_key(
    data: &std::collections::BTreeMap<String, Vec<u8>>,
    namespace: &str,
    secret: &str,
    key: &str,
) -> Result<String> {
    let bytes = data
        .get(key)
        .ok_or_else(|| Error::not_found("Secret key", format!("{}/{}[{}]", namespace, secret, key)))?;
    String::from_utf8(bytes.clone())
        .map_err(|_| Error::InvalidSpec(format!("Secret {}/{} key {} is not UTF-8", namespace, secret, key)))
}

/// Account the operator logs in as on `admin`'s server.
pub async fn admin_username(cluster: &dyn Cluster, admin: &AdminConnection) -> Result<String> {
    match &admin.spec.admin_user {
        Some(source) => Ok(secret_value(cluster, &admin.namespace().unwrap_or_default(), source).await?.0),
        None => Ok(DEFAULT_ADMIN_USER.to_string()),
    }
}

/// Fresh connection settings for `admin`; each credential defaults on its own.
pub async fn connection_config(cluster: &dyn Cluster, admin: &AdminConnection) -> Result<ConnectionConfig> {
    let namespace = admin.namespace().unwrap_or_default();
    let user = admin_username(cluster, admin).await?;
    let password = match &admin.spec.admin_password {
        Some(source) => secret_value(cluster, &namespace, source).await?.0,
        None => String::new(),
    };

    let mut config = ConnectionConfig::tcp(admin.spec.host.clone(), admin.spec.port, user, password);
    config.tls = admin.spec.tls_mode;
    Ok(config)
}

pub fn error_policy<K>(resource: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    let namespace = resource.namespace().unwrap_or_default();
    if error.is_transient() {
        warn!("Reconcile failed for {} {}/{}: {}", kind, namespace, resource.name_any(), error);
    } else {
        error!("Reconcile failed for {} {}/{}: {}", kind, namespace, resource.name_any(), error);
    }
    Action::requeue(ctx.config.error_requeue)
}

/// Publish the outcome of a converging pass as an event.
pub(crate) async fn publish_outcome<K>(ctx: &Context, resource: &K, message: &str, result: &Result<()>)
where
    K: Resource<DynamicType = ()>,
{
    let object = resource.object_ref(&());
    match result {
        Ok(()) => ctx.cluster.record_event(object, "Reconciled", message, false).await,
        Err(e) => {
            let note = format!("{}: {}", message, e);
            ctx.cluster.record_event(object, "ReconcileFailed", &note, true).await
        }
    }
}
