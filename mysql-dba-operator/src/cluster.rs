//! Kubernetes-side collaborators of the controllers.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    client::Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::crd::{AdminConnection, Database, DatabaseUser};
use crate::error::Result;

/// Resources this operator places finalizers on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    AdminConnection,
    Database,
    DatabaseUser,
}

/// The parts of a Secret the controllers read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretData {
    pub data: BTreeMap<String, Vec<u8>>,
    pub resource_version: Option<String>,
    /// UID of the controlling owner, if any
    pub controller_uid: Option<String>,
}

impl SecretData {
    fn from_secret(secret: Secret) -> Self {
        let controller_uid = secret
            .metadata
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .find(|o| o.controller == Some(true))
            .map(|o| o.uid);
        Self {
            data: secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect(),
            resource_version: secret.metadata.resource_version,
            controller_uid,
        }
    }
}

#[async_trait]
pub trait Cluster: Send + Sync {
    async fn admin_connection(&self, namespace: &str, name: &str) -> Result<Option<AdminConnection>>;

    async fn database(&self, namespace: &str, name: &str) -> Result<Option<Database>>;

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;

    /// Create a single-key Secret controlled by `owner`.
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
        owner: OwnerReference,
    ) -> Result<SecretData>;

    /// Add `owner` as the controller of an existing, uncontrolled Secret.
    async fn claim_secret(&self, namespace: &str, name: &str, owner: OwnerReference) -> Result<SecretData>;

    async fn set_finalizers(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;

    async fn update_admin_connection_status(&self, connection: &AdminConnection) -> Result<()>;

    async fn update_database_status(&self, database: &Database) -> Result<()>;

    async fn update_user_status(&self, user: &DatabaseUser) -> Result<()>;

    /// Best effort; failures are logged.
    async fn record_event(&self, object: ObjectReference, reason: &str, note: &str, warning: bool);
}

/// [`Cluster`] backed by the API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    reporter: Reporter,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: "mysql-dba-operator".into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    async fn patch_status<K>(&self, namespace: &str, name: &str, status: &impl serde::Serialize) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await?;
        Ok(())
    }

    async fn patch_finalizers<K>(&self, namespace: &str, name: &str, finalizers: Vec<String>) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn admin_connection(&self, namespace: &str, name: &str) -> Result<Option<AdminConnection>> {
        let api: Api<AdminConnection> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn database(&self, namespace: &str, name: &str) -> Result<Option<Database>> {
        let api: Api<Database> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(SecretData::from_secret))
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
        owner: OwnerReference,
    ) -> Result<SecretData> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                key.to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Default::default()
        };
        let created = api.create(&PostParams::default(), &secret).await?;
        info!("Created Secret {}/{}", namespace, name);
        Ok(SecretData::from_secret(created))
    }

    async fn claim_secret(&self, namespace: &str, name: &str, owner: OwnerReference) -> Result<SecretData> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let current = api.get(name).await?;
        let mut owners = current.metadata.owner_references.clone().unwrap_or_default();
        owners.retain(|o| o.uid != owner.uid);
        owners.push(owner);

        // resourceVersion makes the patch fail if someone else changed the owners meanwhile
        let patch = json!({
            "metadata": {
                "ownerReferences": owners,
                "resourceVersion": current.metadata.resource_version,
            }
        });
        let patched = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!("Claimed Secret {}/{}", namespace, name);
        Ok(SecretData::from_secret(patched))
    }

    async fn set_finalizers(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        debug!("Setting finalizers on {:?} {}/{}: {:?}", kind, namespace, name, finalizers);
        match kind {
            ResourceKind::AdminConnection => {
                self.patch_finalizers::<AdminConnection>(namespace, name, finalizers).await
            }
            ResourceKind::Database => self.patch_finalizers::<Database>(namespace, name, finalizers).await,
            ResourceKind::DatabaseUser => {
                self.patch_finalizers::<DatabaseUser>(namespace, name, finalizers).await
            }
        }
    }

    async fn update_admin_connection_status(&self, connection: &AdminConnection) -> Result<()> {
        self.patch_status::<AdminConnection>(
            &connection.metadata.namespace.clone().unwrap_or_default(),
            connection.metadata.name.as_deref().unwrap_or_default(),
            &connection.status,
        )
        .await
    }

    async fn update_database_status(&self, database: &Database) -> Result<()> {
        self.patch_status::<Database>(
            &database.metadata.namespace.clone().unwrap_or_default(),
            database.metadata.name.as_deref().unwrap_or_default(),
            &database.status,
        )
        .await
    }

    async fn update_user_status(&self, user: &DatabaseUser) -> Result<()> {
        self.patch_status::<DatabaseUser>(
            &user.metadata.namespace.clone().unwrap_or_default(),
            user.metadata.name.as_deref().unwrap_or_default(),
            &user.status,
        )
        .await
    }

    async fn record_event(&self, object: ObjectReference, reason: &str, note: &str, warning: bool) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object);
        let event = Event {
            type_: if warning { EventType::Warning } else { EventType::Normal },
            reason: reason.into(),
            note: Some(note.into()),
            action: "Reconciling".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!("Failed to publish event {}: {}", reason, e);
        }
    }
}
