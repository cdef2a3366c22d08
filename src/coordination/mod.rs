//! Coordination Service Interface
//!
//! The capability every component consumes: a hierarchical namespace of
//! persistent and ephemeral nodes with sequential name allocation and
//! one-shot watches. Components receive an explicit client handle; there
//! is no global session.

pub mod path;
pub mod dispatch;
pub mod memory;
pub mod zookeeper;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, WolfCoordConfig};
use crate::error::{Error, Result};

pub use dispatch::{EventDispatcher, NotificationReceiver, SessionMonitor};
pub use memory::{MemoryClient, MemoryEnsemble};
pub use zookeeper::ZooKeeperClient;

/// Identifier of a coordination session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Persistent, with a unique increasing suffix appended to the name
    PersistentSequential,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral, with a unique increasing suffix appended to the name
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata returned by `exists`, `get_data` and `set_data`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeStat {
    /// Number of data changes
    pub version: i32,
    /// Number of child changes
    pub cversion: i32,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<SessionId>,
    /// Current number of children
    pub num_children: usize,
    /// Payload length in bytes
    pub data_length: usize,
}

/// Kind of change reported to a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::NodeCreated => write!(f, "NODE_CREATED"),
            EventKind::NodeDeleted => write!(f, "NODE_DELETED"),
            EventKind::NodeDataChanged => write!(f, "NODE_DATA_CHANGED"),
            EventKind::NodeChildrenChanged => write!(f, "NODE_CHILDREN_CHANGED"),
        }
    }
}

/// A fired watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

impl SessionState {
    /// Whether the host should stop waiting and release the connection
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Connected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::Expired => write!(f, "EXPIRED"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Receiver of one-shot watch notifications
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn process(&self, event: WatchedEvent);
}

/// Message on a session's notification channel
pub enum Notification {
    /// A watch fired; deliver `event` to `watcher`
    Node {
        watcher: Arc<dyn Watcher>,
        event: WatchedEvent,
    },
    /// The session changed state
    Session(SessionState),
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::Node { event, .. } => f.debug_struct("Node").field("event", event).finish(),
            Notification::Session(state) => f.debug_tuple("Session").field(state).finish(),
        }
    }
}

/// Client side of a coordination session
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Session this client speaks for
    fn session_id(&self) -> SessionId;

    /// Create a node, returning its actual path (with suffix for sequential modes)
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Delete a node; `None` matches any version
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// Stat a node, optionally leaving a watch on it
    async fn exists(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Option<NodeStat>>;

    /// List child names, optionally leaving a watch on the child set
    async fn get_children(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Vec<String>>;

    /// Read a node's payload
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)>;

    /// Replace a node's payload; `None` matches any version
    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<NodeStat>;

    /// Drop every watch `watcher` left on `path` that has not fired yet
    async fn remove_watch(&self, path: &str, watcher: &Arc<dyn Watcher>) -> Result<()>;

    /// End the session
    async fn close(&self) -> Result<()>;
}

/// Where new sessions are opened
pub enum Backend {
    /// One in-process service shared by every session of this backend
    Embedded(Arc<MemoryEnsemble>),
    /// An external ZooKeeper ensemble
    ZooKeeper {
        connect_string: String,
        session_timeout: Duration,
    },
}

impl Backend {
    pub fn from_config(config: &WolfCoordConfig) -> Self {
        match config.coordination.backend {
            BackendKind::Embedded => Backend::Embedded(MemoryEnsemble::new()),
            BackendKind::Zookeeper => Backend::ZooKeeper {
                connect_string: config.coordination.connect_string.clone(),
                session_timeout: config.session_timeout(),
            },
        }
    }

    /// Open a new session
    pub async fn open_session(&self) -> Result<(Arc<dyn CoordinationClient>, NotificationReceiver)> {
        match self {
            Backend::Embedded(ensemble) => {
                let (client, events) = ensemble.connect();
                let client: Arc<dyn CoordinationClient> = client;
                Ok((client, events))
            }
            Backend::ZooKeeper {
                connect_string,
                session_timeout,
            } => {
                let (client, events) = ZooKeeperClient::connect(connect_string, *session_timeout).await?;
                let client: Arc<dyn CoordinationClient> = client;
                Ok((client, events))
            }
        }
    }
}

/// Create every missing persistent component of `path`
pub async fn ensure_path(client: &dyn CoordinationClient, path: &str) -> Result<()> {
    path::validate(path)?;

    for prefix in path::ancestors_and_self(path) {
        if client.exists(&prefix, None).await?.is_some() {
            continue;
        }
        match client.create(&prefix, &[], CreateMode::Persistent).await {
            Ok(_) => tracing::debug!("Created {}", prefix),
            // Another session got there first
            Err(Error::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_path_creates_missing_components() {
        let ensemble = MemoryEnsemble::new();
        let (client, _rx) = ensemble.connect();

        ensure_path(&*client, "/services/billing/registry").await.unwrap();
        assert!(client.exists("/services", None).await.unwrap().is_some());
        assert!(client.exists("/services/billing", None).await.unwrap().is_some());
        assert!(client.exists("/services/billing/registry", None).await.unwrap().is_some());

        // Second call is a no-op
        ensure_path(&*client, "/services/billing/registry").await.unwrap();
        let stat = client.exists("/services/billing/registry", None).await.unwrap().unwrap();
        assert_eq!(stat.ephemeral_owner, None);
    }

    #[tokio::test]
    async fn test_ensure_path_rejects_bad_path() {
        let ensemble = MemoryEnsemble::new();
        let (client, _rx) = ensemble.connect();

        let err = ensure_path(&*client, "services").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_embedded_backend_shares_one_namespace() {
        let backend = Backend::from_config(&WolfCoordConfig::default());
        let (first, _rx1) = backend.open_session().await.unwrap();
        let (second, _rx2) = backend.open_session().await.unwrap();
        assert_ne!(first.session_id(), second.session_id());

        first.create("/shared", b"x", CreateMode::Ephemeral).await.unwrap();
        assert!(second.exists("/shared", None).await.unwrap().is_some());
    }

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(SessionState::Expired.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
    }
}
