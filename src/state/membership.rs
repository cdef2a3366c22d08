//! Service Registry
//!
//! Publishes this process's address as an ephemeral node under the
//! registry path and keeps a snapshot of every registered member's
//! address, rebuilt whenever the registry's child set changes.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::coordination::{
    ensure_path, path, CoordinationClient, CreateMode, WatchedEvent, Watcher,
};
use crate::error::{Error, Result};

/// Which election outcome publishes this process in the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishPolicy {
    /// Only the elected leader is registered
    #[default]
    Leader,
    /// Only workers are registered; the leader watches them
    Workers,
    /// Every participant is registered
    All,
}

impl PublishPolicy {
    pub fn publishes_leader(&self) -> bool {
        matches!(self, PublishPolicy::Leader | PublishPolicy::All)
    }

    pub fn publishes_workers(&self) -> bool {
        matches!(self, PublishPolicy::Workers | PublishPolicy::All)
    }
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Parent of all registry nodes
    pub registry_path: String,
    /// Name prefix of registry nodes (the service appends the sequence)
    pub node_prefix: String,
    /// Which role registers itself
    pub publish: PublishPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_path: "/service_registry".to_string(),
            node_prefix: "n_".to_string(),
            publish: PublishPolicy::default(),
        }
    }
}

/// Point-in-time view of the registered members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    /// Member metadata in discovery order
    members: Vec<String>,
    /// When the snapshot was built
    refreshed_at: chrono::DateTime<chrono::Utc>,
}

impl MembershipSnapshot {
    fn new(members: Vec<String>) -> Self {
        Self {
            members,
            refreshed_at: chrono::Utc::now(),
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn refreshed_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.refreshed_at
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.members.iter().any(|m| m == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }
}

/// Service registry backed by the coordination service
pub struct MembershipRegistry {
    /// Coordination session
    client: Arc<dyn CoordinationClient>,
    /// Registry configuration
    config: RegistryConfig,
    /// Path of our registry node, if registered
    registered: Mutex<Option<String>>,
    /// Latest snapshot; the lock also serializes refreshes
    snapshot: Mutex<Option<Arc<MembershipSnapshot>>>,
    /// Child watch on the registry path
    watch: Arc<dyn Watcher>,
}

impl MembershipRegistry {
    /// Create the registry, making sure its root exists
    pub async fn new(client: Arc<dyn CoordinationClient>, config: RegistryConfig) -> Result<Arc<Self>> {
        let registry = Arc::new_cyclic(|this| Self {
            client,
            config,
            registered: Mutex::new(None),
            snapshot: Mutex::new(None),
            watch: Arc::new(RegistryWatch {
                registry: this.clone(),
            }),
        });
        registry.ensure_registry_root().await?;
        Ok(registry)
    }

    /// Registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create the persistent registry root (and its parents) if absent
    pub async fn ensure_registry_root(&self) -> Result<()> {
        ensure_path(self.client.as_ref(), &self.config.registry_path).await
    }

    /// Publish `metadata` as an ephemeral sequential node
    pub async fn register(&self, metadata: &[u8]) -> Result<String> {
        let mut registered = self.registered.lock().await;

        if let Some(existing) = registered.as_ref() {
            if self.client.exists(existing, None).await?.is_some() {
                tracing::debug!("Already registered as {}", existing);
                return Ok(existing.clone());
            }
        }

        let prefix = path::join(&self.config.registry_path, &self.config.node_prefix);
        let full_path = self
            .client
            .create(&prefix, metadata, CreateMode::EphemeralSequential)
            .await
            .map_err(|e| {
                if e.is_unavailable() {
                    e
                } else {
                    Error::CoordinationUnavailable(format!(
                        "cannot register under {}: {}",
                        self.config.registry_path, e
                    ))
                }
            })?;

        tracing::info!("Registered to service registry as {}", full_path);
        *registered = Some(full_path.clone());
        Ok(full_path)
    }

    /// Remove our registry node; a no-op when there is none
    pub async fn unregister(&self) -> Result<()> {
        let mut registered = self.registered.lock().await;
        let Some(full_path) = registered.take() else {
            return Ok(());
        };

        if self.client.exists(&full_path, None).await?.is_some() {
            match self.client.delete(&full_path, None).await {
                Ok(()) => tracing::info!("Unregistered {} from service registry", full_path),
                // Removed between the check and the delete
                Err(Error::NoNode(_)) => {}
                Err(e) => {
                    *registered = Some(full_path);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Whether we hold a registry node
    pub async fn is_registered(&self) -> bool {
        self.registered.lock().await.is_some()
    }

    /// Path of our registry node
    pub async fn registered_path(&self) -> Option<String> {
        self.registered.lock().await.clone()
    }

    /// Build the first snapshot and keep it current from then on
    pub async fn subscribe_to_updates(&self) -> Result<()> {
        self.refresh().await.map(|_| ())
    }

    /// Latest snapshot, building one first if none exists
    pub async fn current_members(&self) -> Result<Arc<MembershipSnapshot>> {
        let mut snapshot = self.snapshot.lock().await;
        if let Some(current) = snapshot.as_ref() {
            return Ok(Arc::clone(current));
        }
        self.rebuild(&mut snapshot).await
    }

    /// Re-read the registry and re-arm the child watch
    pub async fn refresh(&self) -> Result<Arc<MembershipSnapshot>> {
        let mut snapshot = self.snapshot.lock().await;
        self.rebuild(&mut snapshot).await
    }

    async fn rebuild(&self, slot: &mut Option<Arc<MembershipSnapshot>>) -> Result<Arc<MembershipSnapshot>> {
        let children = self
            .client
            .get_children(&self.config.registry_path, Some(Arc::clone(&self.watch)))
            .await?;

        let mut members = Vec::with_capacity(children.len());
        for child in children {
            let child_path = path::join(&self.config.registry_path, &child);
            match self.client.get_data(&child_path).await {
                Ok((data, _)) => members.push(String::from_utf8_lossy(&data).into_owned()),
                Err(Error::NoNode(_)) => {
                    tracing::debug!("Registry node {} vanished during refresh", child_path);
                }
                Err(e) => return Err(e),
            }
        }

        let fresh = Arc::new(MembershipSnapshot::new(members));
        tracing::info!("The cluster addresses are: {:?}", fresh.members());
        *slot = Some(Arc::clone(&fresh));
        Ok(fresh)
    }
}

/// Refreshes the registry whenever its child set changes
struct RegistryWatch {
    registry: Weak<MembershipRegistry>,
}

#[async_trait]
impl Watcher for RegistryWatch {
    async fn process(&self, event: WatchedEvent) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        tracing::debug!("Registry changed ({} on {})", event.kind, event.path);
        if let Err(e) = registry.refresh().await {
            tracing::error!("Failed to refresh service registry: {}", e);
        }
    }
}
