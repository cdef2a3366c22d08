//! Embedded Coordination Service
//!
//! An in-process hierarchical namespace that honours the coordination
//! contract: persistent and ephemeral nodes, per-parent sequential names,
//! one-shot data and child watches, and session lifecycle events. All
//! operations are linearized by a single lock. It backs the `wolfcoord`
//! binary when no external ensemble is involved and every test in the crate.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::dispatch::{NotificationReceiver, NotificationSender};
use super::path;
use super::{
    CoordinationClient, CreateMode, EventKind, NodeStat, Notification, SessionId, SessionState,
    WatchedEvent, Watcher,
};
use crate::error::{Error, Result};

/// A stored node
struct ZNode {
    data: Vec<u8>,
    version: i32,
    cversion: i32,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
    next_sequence: u64,
}

impl ZNode {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            cversion: 0,
            ephemeral_owner,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }

    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            cversion: self.cversion,
            ephemeral_owner: self.ephemeral_owner,
            num_children: self.children.len(),
            data_length: self.data.len(),
        }
    }
}

/// A pending one-shot watch
struct Registration {
    session: SessionId,
    watcher: Arc<dyn Watcher>,
}

/// Which watch table an event fires from
#[derive(Clone, Copy)]
enum WatchTable {
    Data,
    Child,
}

/// A live session: where its notifications go and where its end is recorded
struct Session {
    events: NotificationSender,
    ended: Arc<OnceLock<SessionState>>,
}

struct Tree {
    nodes: HashMap<String, ZNode>,
    sessions: HashMap<SessionId, Session>,
    data_watches: HashMap<String, Vec<Registration>>,
    child_watches: HashMap<String, Vec<Registration>>,
    next_session: u64,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), ZNode::new(Vec::new(), None));

        Self {
            nodes,
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            next_session: 1,
        }
    }

    fn check_session(&self, id: SessionId) -> Result<()> {
        if self.sessions.contains_key(&id) {
            Ok(())
        } else {
            Err(Error::CoordinationUnavailable(format!("session {} is closed", id)))
        }
    }

    fn watch(&mut self, table: WatchTable, path: &str, session: SessionId, watcher: Arc<dyn Watcher>) {
        let map = match table {
            WatchTable::Data => &mut self.data_watches,
            WatchTable::Child => &mut self.child_watches,
        };
        map.entry(path.to_string())
            .or_default()
            .push(Registration { session, watcher });
    }

    /// Forget every watch `session` left on `path` through `watcher`
    fn unwatch(&mut self, path: &str, session: SessionId, watcher: &Arc<dyn Watcher>) {
        let target = Arc::as_ptr(watcher) as *const ();
        for table in [&mut self.data_watches, &mut self.child_watches] {
            if let Some(registrations) = table.get_mut(path) {
                registrations.retain(|r| {
                    r.session != session || Arc::as_ptr(&r.watcher) as *const () != target
                });
                if registrations.is_empty() {
                    table.remove(path);
                }
            }
        }
    }

    fn watch_count(&self) -> usize {
        self.data_watches.values().map(Vec::len).sum::<usize>()
            + self.child_watches.values().map(Vec::len).sum::<usize>()
    }

    /// Fire and clear every watch of `table` on `path`
    fn trigger(&mut self, table: WatchTable, path: &str, kind: EventKind) {
        let registrations = match table {
            WatchTable::Data => self.data_watches.remove(path),
            WatchTable::Child => self.child_watches.remove(path),
        };
        let Some(registrations) = registrations else {
            return;
        };

        // A watcher registered several times on the same path fires once
        let mut delivered: Vec<(SessionId, *const ())> = Vec::new();
        for registration in registrations {
            let key = (
                registration.session,
                Arc::as_ptr(&registration.watcher) as *const (),
            );
            if delivered.contains(&key) {
                continue;
            }
            delivered.push(key);

            if let Some(session) = self.sessions.get(&registration.session) {
                let _ = session.events.send(Notification::Node {
                    watcher: registration.watcher,
                    event: WatchedEvent {
                        kind,
                        path: path.to_string(),
                    },
                });
            }
        }
    }

    fn create(&mut self, session: SessionId, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.check_session(session)?;
        path::validate(path)?;
        let parent_path = match path::parent(path) {
            Some(p) => p.to_string(),
            None => return Err(Error::NodeExists(path.to_string())),
        };

        let parent = self
            .nodes
            .get(&parent_path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if parent.ephemeral_owner.is_some() {
            return Err(Error::NoChildrenForEphemerals(parent_path));
        }

        let actual = if mode.is_sequential() {
            let seq = parent.next_sequence;
            format!("{}{:0width$}", path, seq, width = path::SEQUENCE_WIDTH)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(Error::NodeExists(actual));
        }

        let owner = mode.is_ephemeral().then_some(session);
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            if mode.is_sequential() {
                parent.next_sequence += 1;
            }
            parent.children.insert(path::local_name(&actual).to_string());
            parent.cversion += 1;
        }
        self.nodes.insert(actual.clone(), ZNode::new(data.to_vec(), owner));

        self.trigger(WatchTable::Data, &actual, EventKind::NodeCreated);
        self.trigger(WatchTable::Child, &parent_path, EventKind::NodeChildrenChanged);

        Ok(actual)
    }

    fn delete(&mut self, session: SessionId, path: &str, version: Option<i32>) -> Result<()> {
        self.check_session(session)?;
        path::validate(path)?;
        self.remove_node(path, version)
    }

    fn remove_node(&mut self, path: &str, version: Option<i32>) -> Result<()> {
        let parent_path = match path::parent(path) {
            Some(p) => p.to_string(),
            None => return Err(Error::InvalidPath("the root node cannot be deleted".into())),
        };

        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if expected != node.version {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        if !node.children.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.remove(path::local_name(path));
            parent.cversion += 1;
        }

        self.trigger(WatchTable::Data, path, EventKind::NodeDeleted);
        self.trigger(WatchTable::Child, path, EventKind::NodeDeleted);
        self.trigger(WatchTable::Child, &parent_path, EventKind::NodeChildrenChanged);

        Ok(())
    }

    fn exists(&mut self, session: SessionId, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Option<NodeStat>> {
        self.check_session(session)?;
        path::validate(path)?;

        // Watches are left even on absent nodes so their creation is seen
        if let Some(watcher) = watcher {
            self.watch(WatchTable::Data, path, session, watcher);
        }
        Ok(self.nodes.get(path).map(ZNode::stat))
    }

    fn get_children(&mut self, session: SessionId, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Vec<String>> {
        self.check_session(session)?;
        path::validate(path)?;

        let children: Vec<String> = self
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?
            .children
            .iter()
            .cloned()
            .collect();

        if let Some(watcher) = watcher {
            self.watch(WatchTable::Child, path, session, watcher);
        }
        Ok(children)
    }

    fn get_data(&self, session: SessionId, path: &str) -> Result<(Vec<u8>, NodeStat)> {
        self.check_session(session)?;
        path::validate(path)?;

        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        Ok((node.data.clone(), node.stat()))
    }

    fn set_data(&mut self, session: SessionId, path: &str, data: &[u8], version: Option<i32>) -> Result<NodeStat> {
        self.check_session(session)?;
        path::validate(path)?;

        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if expected != node.version {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data.to_vec();
        node.version += 1;
        let stat = node.stat();

        self.trigger(WatchTable::Data, path, EventKind::NodeDataChanged);
        Ok(stat)
    }

    /// Drop a session: discard its watches, remove its ephemerals, notify it
    fn end_session(&mut self, session: SessionId, state: SessionState) {
        let Some(entry) = self.sessions.remove(&session) else {
            return;
        };
        let _ = entry.ended.set(state);

        for table in [&mut self.data_watches, &mut self.child_watches] {
            for registrations in table.values_mut() {
                registrations.retain(|r| r.session != session);
            }
            table.retain(|_, registrations| !registrations.is_empty());
        }

        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        owned.sort();
        for path in owned {
            if let Err(e) = self.remove_node(&path, None) {
                tracing::warn!("Failed to remove ephemeral {} of session {}: {}", path, session, e);
            }
        }

        let _ = entry.events.send(Notification::Session(state));
    }
}

/// The embedded coordination service
pub struct MemoryEnsemble {
    tree: Mutex<Tree>,
}

impl MemoryEnsemble {
    /// Create an empty namespace containing only `/`
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tree: Mutex::new(Tree::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a new session, returning its client and notification channel
    pub fn connect(self: &Arc<Self>) -> (Arc<MemoryClient>, NotificationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ended = Arc::new(OnceLock::new());
        let session = {
            let mut tree = self.lock();
            let session = SessionId(tree.next_session);
            tree.next_session += 1;
            let _ = tx.send(Notification::Session(SessionState::Connected));
            tree.sessions.insert(
                session,
                Session {
                    events: tx,
                    ended: Arc::clone(&ended),
                },
            );
            session
        };
        tracing::debug!("Opened session {}", session);

        let client = Arc::new(MemoryClient {
            ensemble: Arc::clone(self),
            session,
            ended,
        });
        (client, rx)
    }

    /// End a session as if its timeout elapsed
    pub fn expire_session(&self, session: SessionId) {
        tracing::debug!("Expiring session {}", session);
        self.lock().end_session(session, SessionState::Expired);
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of pending watch registrations across all sessions
    pub fn watch_count(&self) -> usize {
        self.lock().watch_count()
    }
}

/// A session on a `MemoryEnsemble`
pub struct MemoryClient {
    ensemble: Arc<MemoryEnsemble>,
    session: SessionId,
    /// Set once, when the session closes or expires
    ended: Arc<OnceLock<SessionState>>,
}

impl MemoryClient {
    /// Lock the tree on behalf of a live session
    fn tree(&self) -> Result<MutexGuard<'_, Tree>> {
        let tree = self.ensemble.lock();
        match self.ended.get() {
            None => Ok(tree),
            Some(SessionState::Expired) => Err(Error::SessionExpired(self.session)),
            Some(state) => Err(Error::CoordinationUnavailable(format!(
                "session {} is {}",
                self.session, state
            ))),
        }
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    fn session_id(&self) -> SessionId {
        self.session
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.tree()?.create(self.session, path, data, mode)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.tree()?.delete(self.session, path, version)
    }

    async fn exists(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Option<NodeStat>> {
        self.tree()?.exists(self.session, path, watcher)
    }

    async fn get_children(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Vec<String>> {
        self.tree()?.get_children(self.session, path, watcher)
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
        self.tree()?.get_data(self.session, path)
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<NodeStat> {
        self.tree()?.set_data(self.session, path, data, version)
    }

    async fn remove_watch(&self, path: &str, watcher: &Arc<dyn Watcher>) -> Result<()> {
        self.tree()?.unwatch(path, self.session, watcher);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!("Closing session {}", self.session);
        self.ensemble.lock().end_session(self.session, SessionState::Closed);
        Ok(())
    }
}
