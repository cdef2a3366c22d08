//! ZooKeeper Backend
//!
//! `CoordinationClient` over an external ZooKeeper ensemble. Each watch
//! installed through this client becomes a small task that waits on the
//! server's one-shot notification and forwards it to the session's
//! notification channel, so watchers run on the same serialized dispatcher
//! as with the embedded service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use zookeeper_client as zk;

use super::dispatch::{NotificationReceiver, NotificationSender};
use super::path;
use super::{
    CoordinationClient, CreateMode, EventKind, NodeStat, Notification, SessionId, SessionState,
    WatchedEvent, Watcher,
};
use crate::error::{Error, Result};

/// A forwarding task for a watch that has not fired yet
struct PendingWatch {
    path: String,
    watcher: usize,
    task: AbortHandle,
}

type PendingWatches = Arc<Mutex<HashMap<u64, PendingWatch>>>;

/// A session on a ZooKeeper ensemble
pub struct ZooKeeperClient {
    /// `None` once the session is closed
    client: Mutex<Option<zk::Client>>,
    session: SessionId,
    events: NotificationSender,
    pending: PendingWatches,
    next_watch: AtomicU64,
}

impl ZooKeeperClient {
    /// Open a session, returning its client and notification channel
    pub async fn connect(
        connect_string: &str,
        session_timeout: Duration,
    ) -> Result<(Arc<Self>, NotificationReceiver)> {
        let mut connector = zk::Client::connector();
        connector.session_timeout(session_timeout);
        let client = connector.connect(connect_string).await.map_err(|e| {
            Error::CoordinationUnavailable(format!("cannot connect to {}: {}", connect_string, e))
        })?;

        let session = SessionId(client.session_id().0 as u64);
        tracing::info!("Connected to ZooKeeper at {} (session {})", connect_string, session);

        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(Notification::Session(SessionState::Connected));

        let mut states = client.state_watcher();
        let state_events = events.clone();
        tokio::spawn(async move {
            loop {
                let state = session_state(states.changed().await);
                if state_events.send(Notification::Session(state)).is_err() || state.is_terminal() {
                    break;
                }
            }
        });

        let zookeeper = Arc::new(Self {
            client: Mutex::new(Some(client)),
            session,
            events,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_watch: AtomicU64::new(0),
        });
        Ok((zookeeper, rx))
    }

    fn client(&self) -> Result<zk::Client> {
        lock(&self.client)
            .clone()
            .ok_or_else(|| Error::CoordinationUnavailable(format!("session {} is closed", self.session)))
    }

    fn map_error(&self, err: zk::Error, path: &str) -> Error {
        match err {
            zk::Error::NoNode => Error::NoNode(path.to_string()),
            zk::Error::NodeExists => Error::NodeExists(path.to_string()),
            zk::Error::NotEmpty => Error::NotEmpty(path.to_string()),
            zk::Error::NoChildrenForEphemerals => Error::NoChildrenForEphemerals(path.to_string()),
            zk::Error::SessionExpired => Error::SessionExpired(self.session),
            other => Error::CoordinationUnavailable(format!("{} on {}", other, path)),
        }
    }

    /// Turn a rejected conditional write into `BadVersion` with the current version
    async fn version_conflict(&self, client: &zk::Client, path: &str, expected: i32) -> Error {
        match client.check_stat(path).await {
            Ok(Some(stat)) => Error::BadVersion {
                path: path.to_string(),
                expected,
                actual: stat.version,
            },
            Ok(None) => Error::NoNode(path.to_string()),
            Err(e) => self.map_error(e, path),
        }
    }

    /// Forward the server's notification for `path` to `watcher`
    fn forward(&self, path: &str, watcher: Arc<dyn Watcher>, oneshot: zk::OneshotWatcher) {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        let key = watcher_key(&watcher);
        let events = self.events.clone();
        let pending = Arc::clone(&self.pending);

        // Held across the spawn so the task cannot deregister before it is registered
        let mut registered = lock(&self.pending);
        let task = tokio::spawn(async move {
            let fired = oneshot.changed().await;
            lock(&pending).remove(&id);

            let Some(kind) = event_kind(fired.event_type) else {
                return;
            };
            let _ = events.send(Notification::Node {
                watcher,
                event: WatchedEvent {
                    kind,
                    path: fired.path,
                },
            });
        });
        registered.insert(
            id,
            PendingWatch {
                path: path.to_string(),
                watcher: key,
                task: task.abort_handle(),
            },
        );
    }
}

#[async_trait]
impl CoordinationClient for ZooKeeperClient {
    fn session_id(&self) -> SessionId {
        self.session
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        path::validate(path)?;
        let client = self.client()?;
        let options = create_mode(mode).with_acls(zk::Acls::anyone_all());

        let (_, sequence) = client
            .create(path, data, &options)
            .await
            .map_err(|e| self.map_error(e, path))?;

        if mode.is_sequential() {
            Ok(format!("{}{}", path, sequence))
        } else {
            Ok(path.to_string())
        }
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        path::validate(path)?;
        let client = self.client()?;
        match client.delete(path, version).await {
            Ok(()) => Ok(()),
            Err(zk::Error::BadVersion) => {
                Err(self.version_conflict(&client, path, version.unwrap_or(-1)).await)
            }
            Err(e) => Err(self.map_error(e, path)),
        }
    }

    async fn exists(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Option<NodeStat>> {
        path::validate(path)?;
        let client = self.client()?;
        let stat = match watcher {
            None => client.check_stat(path).await.map_err(|e| self.map_error(e, path))?,
            Some(watcher) => {
                let (stat, oneshot) = client
                    .check_and_watch_stat(path)
                    .await
                    .map_err(|e| self.map_error(e, path))?;
                self.forward(path, watcher, oneshot);
                stat
            }
        };
        Ok(stat.as_ref().map(node_stat))
    }

    async fn get_children(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Vec<String>> {
        path::validate(path)?;
        let client = self.client()?;
        match watcher {
            None => client.list_children(path).await.map_err(|e| self.map_error(e, path)),
            Some(watcher) => {
                let (children, oneshot) = client
                    .list_and_watch_children(path)
                    .await
                    .map_err(|e| self.map_error(e, path))?;
                self.forward(path, watcher, oneshot);
                Ok(children)
            }
        }
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
        path::validate(path)?;
        let client = self.client()?;
        let (data, stat) = client.get_data(path).await.map_err(|e| self.map_error(e, path))?;
        Ok((data, node_stat(&stat)))
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<NodeStat> {
        path::validate(path)?;
        let client = self.client()?;
        match client.set_data(path, data, version).await {
            Ok(stat) => Ok(node_stat(&stat)),
            Err(zk::Error::BadVersion) => {
                Err(self.version_conflict(&client, path, version.unwrap_or(-1)).await)
            }
            Err(e) => Err(self.map_error(e, path)),
        }
    }

    async fn remove_watch(&self, path: &str, watcher: &Arc<dyn Watcher>) -> Result<()> {
        let key = watcher_key(watcher);
        lock(&self.pending).retain(|_, pending| {
            let matches = pending.path == path && pending.watcher == key;
            if matches {
                pending.task.abort();
            }
            !matches
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(client) = lock(&self.client).take() else {
            return Ok(());
        };
        tracing::debug!("Closing session {}", self.session);

        for (_, pending) in lock(&self.pending).drain() {
            pending.task.abort();
        }
        // The session ends once the last handle is gone
        drop(client);

        let _ = self.events.send(Notification::Session(SessionState::Closed));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn watcher_key(watcher: &Arc<dyn Watcher>) -> usize {
    Arc::as_ptr(watcher) as *const () as usize
}

fn create_mode(mode: CreateMode) -> zk::CreateMode {
    match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::PersistentSequential => zk::CreateMode::PersistentSequential,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    }
}

fn node_stat(stat: &zk::Stat) -> NodeStat {
    NodeStat {
        version: stat.version,
        cversion: stat.cversion,
        ephemeral_owner: (stat.ephemeral_owner != 0).then(|| SessionId(stat.ephemeral_owner as u64)),
        num_children: stat.num_children.max(0) as usize,
        data_length: stat.data_length.max(0) as usize,
    }
}

/// Node event carried by a fired watch; `None` for session notifications
fn event_kind(event_type: zk::EventType) -> Option<EventKind> {
    match event_type {
        zk::EventType::NodeCreated => Some(EventKind::NodeCreated),
        zk::EventType::NodeDeleted => Some(EventKind::NodeDeleted),
        zk::EventType::NodeDataChanged => Some(EventKind::NodeDataChanged),
        zk::EventType::NodeChildrenChanged => Some(EventKind::NodeChildrenChanged),
        _ => None,
    }
}

fn session_state(state: zk::SessionState) -> SessionState {
    match state {
        zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => {
            SessionState::Connected
        }
        zk::SessionState::Expired => SessionState::Expired,
        zk::SessionState::Closed => SessionState::Closed,
        _ => SessionState::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kinds() {
        assert_eq!(event_kind(zk::EventType::NodeDeleted), Some(EventKind::NodeDeleted));
        assert_eq!(
            event_kind(zk::EventType::NodeChildrenChanged),
            Some(EventKind::NodeChildrenChanged)
        );
        assert_eq!(event_kind(zk::EventType::Session), None);
    }

    #[test]
    fn test_session_states() {
        assert_eq!(session_state(zk::SessionState::SyncConnected), SessionState::Connected);
        assert_eq!(session_state(zk::SessionState::Expired), SessionState::Expired);
        assert_eq!(session_state(zk::SessionState::Closed), SessionState::Closed);
        assert_eq!(session_state(zk::SessionState::Disconnected), SessionState::Disconnected);
        assert!(session_state(zk::SessionState::AuthFailed).is_terminal());
    }

    #[test]
    fn test_create_modes() {
        assert!(matches!(
            create_mode(CreateMode::EphemeralSequential),
            zk::CreateMode::EphemeralSequential
        ));
        assert!(matches!(create_mode(CreateMode::Persistent), zk::CreateMode::Persistent));
        assert!(matches!(create_mode(CreateMode::Ephemeral), zk::CreateMode::Ephemeral));
    }

    /// Two sessions on a live ensemble agree on one leader
    #[tokio::test]
    #[ignore = "needs a ZooKeeper server on localhost:2181"]
    async fn test_election_across_sessions() {
        use crate::coordination::{ensure_path, EventDispatcher};
        use crate::state::{ElectionCallback, ElectionConfig, ElectionCoordinator};

        struct Quiet;

        #[async_trait]
        impl ElectionCallback for Quiet {
            async fn on_elected_leader(&self) -> Result<()> {
                Ok(())
            }

            async fn on_worker(&self) -> Result<()> {
                Ok(())
            }
        }

        let config = ElectionConfig {
            election_path: format!("/wolfcoord_test_{}", std::process::id()),
            ..ElectionConfig::default()
        };

        let mut pool = Vec::new();
        for _ in 0..2 {
            let (client, rx) = ZooKeeperClient::connect("localhost:2181", Duration::from_secs(5))
                .await
                .unwrap();
            let monitor = EventDispatcher::start(rx);
            ensure_path(&*client, &config.election_path).await.unwrap();
            let coordinator = ElectionCoordinator::new(client.clone(), Arc::new(Quiet), config.clone());
            coordinator.volunteer().await.unwrap();
            pool.push((client, monitor, coordinator));
        }

        assert!(pool[0].2.evaluate().await.unwrap().is_leader());
        assert!(!pool[1].2.evaluate().await.unwrap().is_leader());

        // The first session leaves; the second takes over
        pool[0].0.close().await.unwrap();
        let successor = &pool[1].2;
        let promoted = tokio::time::timeout(Duration::from_secs(10), async {
            while !successor.state().await.is_leader() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(promoted.is_ok());

        pool[1].0.close().await.unwrap();
        let (admin, _rx) = ZooKeeperClient::connect("localhost:2181", Duration::from_secs(5))
            .await
            .unwrap();
        admin.delete(&config.election_path, None).await.unwrap();
        admin.close().await.unwrap();
    }
}
