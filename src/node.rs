//! Node Bootstrap
//!
//! Wires one coordination session to a service registry and an election
//! coordinator, and decides what each election outcome does to this
//! node's registry entry.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::WolfCoordConfig;
use crate::coordination::{ensure_path, CoordinationClient, SessionMonitor, SessionState};
use crate::error::Result;
use crate::state::{
    ElectionCallback, ElectionCoordinator, ElectionState, MembershipRegistry, MembershipSnapshot,
};

/// Registry side effects of election outcomes
pub struct OnElectionAction {
    registry: Arc<MembershipRegistry>,
    address: String,
}

impl OnElectionAction {
    pub fn new(registry: Arc<MembershipRegistry>, address: String) -> Self {
        Self { registry, address }
    }
}

#[async_trait]
impl ElectionCallback for OnElectionAction {
    async fn on_elected_leader(&self) -> crate::Result<()> {
        if self.registry.config().publish.publishes_leader() {
            self.registry.register(self.address.as_bytes()).await?;
        } else {
            self.registry.unregister().await?;
        }
        self.registry.subscribe_to_updates().await?;

        let members = self.registry.current_members().await?;
        tracing::info!("Leading a cluster of {} registered members", members.len());
        Ok(())
    }

    async fn on_worker(&self) -> crate::Result<()> {
        if self.registry.config().publish.publishes_workers() {
            if !self.registry.is_registered().await {
                self.registry.register(self.address.as_bytes()).await?;
            }
        } else {
            self.registry.unregister().await?;
        }
        Ok(())
    }
}

/// A running election participant
pub struct Node {
    client: Arc<dyn CoordinationClient>,
    monitor: SessionMonitor,
    registry: Arc<MembershipRegistry>,
    election: Arc<ElectionCoordinator>,
    address: String,
}

impl Node {
    /// Join the election and registry over an established session
    pub async fn start(
        config: &WolfCoordConfig,
        client: Arc<dyn CoordinationClient>,
        monitor: SessionMonitor,
    ) -> Result<Self> {
        let address = config.advertise_address();
        tracing::info!(
            "Starting node {} on session {}",
            address,
            client.session_id()
        );

        if config.coordination.create_election_root {
            ensure_path(client.as_ref(), &config.election.path).await?;
        }

        let registry = MembershipRegistry::new(Arc::clone(&client), config.registry_config()).await?;
        let action = Arc::new(OnElectionAction::new(Arc::clone(&registry), address.clone()));
        let election = ElectionCoordinator::new(Arc::clone(&client), action, config.election_config());

        election.volunteer().await?;
        let state = election.evaluate().await?;
        tracing::info!("Node {} started as {}", address, state);

        Ok(Self {
            client,
            monitor,
            registry,
            election,
            address,
        })
    }

    /// Address this node advertises
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current election state
    pub async fn election_state(&self) -> ElectionState {
        self.election.state().await
    }

    /// Current registered members
    pub async fn members(&self) -> Result<Arc<MembershipSnapshot>> {
        self.registry.current_members().await
    }

    /// Block until the session ends
    pub async fn wait_for_disconnect(&self) -> SessionState {
        self.monitor.wait_for_disconnect().await
    }

    /// Leave the registry and close the session
    pub async fn shutdown(&self) -> Result<()> {
        if self.monitor.state() == SessionState::Connected {
            if let Err(e) = self.registry.unregister().await {
                tracing::warn!("Failed to unregister {}: {}", self.address, e);
            }
        }
        self.client.close().await
    }
}
