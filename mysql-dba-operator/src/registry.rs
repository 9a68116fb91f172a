use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::session::{AdminSession, ConnectionConfig, Connector};

/// A live session plus the exact configuration it was built from
pub struct ConnectionDefinition {
    pub session: Arc<dyn AdminSession>,
    pub config: ConnectionConfig,
}

type Slot = Arc<Mutex<Option<ConnectionDefinition>>>;

/// Cache of validated sessions keyed by AdminConnection identity.
///
/// The check/close/rebuild/insert sequence for one identity runs under that
/// identity's lock; different identities proceed independently.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    slots: DashMap<String, Slot>,
    timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
            timeout,
        }
    }

    /// Return a validated session for `identity`, rebuilding it when `fresh`
    /// differs from the cached configuration or the cached session fails a ping.
    pub async fn obtain(
        &self,
        identity: &str,
        fresh: ConnectionConfig,
    ) -> Result<Arc<dyn AdminSession>> {
        let slot = self.slots.entry(identity.to_string()).or_default().clone();
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.config == fresh {
                match self.bounded("ping", cached.session.ping()).await {
                    Ok(()) => return Ok(cached.session.clone()),
                    Err(e) => warn!("Cached connection {} failed ping: {}", identity, e),
                }
            } else {
                info!("Connection configuration for {} changed, reconnecting", identity);
            }
        }

        if let Some(stale) = entry.take() {
            retire(identity, stale).await;
        }

        let session = self
            .bounded("connect", self.connector.connect(&fresh))
            .await?;
        if let Err(e) = self.validate(session.as_ref()).await {
            if let Err(close_err) = session.close().await {
                warn!("Failed to close rejected connection {}: {}", identity, close_err);
            }
            return Err(e);
        }

        info!("Connected to {} for {}", fresh.address(), identity);
        *entry = Some(ConnectionDefinition {
            session: session.clone(),
            config: fresh,
        });
        Ok(session)
    }

    /// Drop and close the cached session for `identity`, if any.
    pub async fn evict(&self, identity: &str) {
        let Some((_, slot)) = self.slots.remove(identity) else {
            return;
        };
        let stale = slot.lock().await.take();
        if let Some(stale) = stale {
            retire(identity, stale).await;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    async fn validate(&self, session: &dyn AdminSession) -> Result<()> {
        self.bounded("ping", session.ping()).await?;
        Ledger::new(session).ensure_schema().await
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::timeout(operation))?
    }
}

/// Close a session that left the cache. A session still held by an in-flight
/// pass is left to close when its last handle drops.
async fn retire(identity: &str, stale: ConnectionDefinition) {
    if Arc::strong_count(&stale.session) > 1 {
        debug!("Connection {} is still in use, releasing it to its holders", identity);
        return;
    }
    if let Err(e) = stale.session.close().await {
        warn!("Failed to close stale connection {}: {}", identity, e);
    }
}
