//! Finalizer-gated lifecycle shared by the controllers.

use kube::{Resource, ResourceExt};

pub const DATABASE_FINALIZER: &str = "database.dba.mysql.operator.dev/finalizer";
pub const USER_FINALIZER: &str = "databaseuser.dba.mysql.operator.dev/finalizer";
pub const ADMIN_CONNECTION_FINALIZER: &str = "adminconnection.dba.mysql.operator.dev/finalizer";

/// Where a resource is in its lifecycle.
///
/// ```text
/// Unregistered -> Registered -> Converging -> Deleting -> Finalized
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No finalizer yet; nothing may be created on the server.
    Unregistered,
    /// Finalizer recorded, observed identity not yet initialised.
    Registered,
    Converging,
    /// Marked for deletion with our finalizer still present.
    Deleting,
    /// Marked for deletion and our finalizer is gone.
    Finalized,
}

impl Phase {
    pub fn of<K: Resource>(resource: &K, finalizer: &str, initialized: bool) -> Self {
        let registered = has_finalizer(resource, finalizer);
        let deleting = resource.meta().deletion_timestamp.is_some();
        match (deleting, registered) {
            (true, true) => Phase::Deleting,
            (true, false) => Phase::Finalized,
            (false, false) => Phase::Unregistered,
            (false, true) if initialized => Phase::Converging,
            (false, true) => Phase::Registered,
        }
    }
}

pub fn has_finalizer<K: Resource>(resource: &K, finalizer: &str) -> bool {
    resource.finalizers().iter().any(|f| f == finalizer)
}

/// The resource's finalizers with `finalizer` appended once.
pub fn with_finalizer<K: Resource>(resource: &K, finalizer: &str) -> Vec<String> {
    let mut finalizers = resource.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

pub fn without_finalizer<K: Resource>(resource: &K, finalizer: &str) -> Vec<String> {
    resource
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect()
}
