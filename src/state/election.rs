//! Leader Election
//!
//! Every participant creates one ephemeral sequential node under the
//! election path. The owner of the smallest name is the leader. Everyone
//! else watches only the node immediately before its own, so a departure
//! wakes exactly one participant instead of the whole pool.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, RwLock};

use crate::coordination::{path, CoordinationClient, CreateMode, EventKind, WatchedEvent, Watcher};
use crate::error::{Error, Result};

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Parent of all election nodes
    pub election_path: String,
    /// Name prefix of election nodes (the service appends the sequence)
    pub node_prefix: String,
    /// Delay before the second consecutive re-evaluation in milliseconds
    pub retry_backoff_min_ms: u64,
    /// Upper bound on the re-evaluation delay in milliseconds
    pub retry_backoff_max_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_path: "/election".to_string(),
            node_prefix: "c_".to_string(),
            retry_backoff_min_ms: 10,
            retry_backoff_max_ms: 1000,
        }
    }
}

/// Election state of this participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    /// Not evaluated yet, or the last evaluation failed
    Undetermined,
    /// Owns the smallest election node
    Leader,
    /// Waiting on the named predecessor
    Worker { watching: String },
}

impl ElectionState {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionState::Leader)
    }
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Undetermined => write!(f, "UNDETERMINED"),
            ElectionState::Leader => write!(f, "LEADER"),
            ElectionState::Worker { watching } => write!(f, "WORKER (watching {})", watching),
        }
    }
}

/// What the application does with an election outcome
#[async_trait]
pub trait ElectionCallback: Send + Sync {
    /// This participant now owns the smallest election node
    async fn on_elected_leader(&self) -> Result<()>;

    /// This participant is not the leader; called on every such evaluation
    async fn on_worker(&self) -> Result<()>;
}

/// This participant's node in the election set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionNode {
    /// Path assigned by the coordination service
    pub full_path: String,
    /// `full_path` without the election path prefix
    pub local_name: String,
}

impl ElectionNode {
    pub fn new(full_path: String) -> Self {
        let local_name = path::local_name(&full_path).to_string();
        Self {
            full_path,
            local_name,
        }
    }

    /// Sequence number the service assigned
    pub fn sequence(&self) -> Option<u64> {
        path::sequence_suffix(&self.local_name)
    }
}

/// Order the election set and find the node just before `me`.
///
/// Returns `None` when `me` is the smallest name. Sequence suffixes are
/// fixed width, so plain string order is sequence order.
pub fn predecessor_of(mut children: Vec<String>, me: &str) -> Result<Option<String>> {
    children.sort_unstable();
    let position = children
        .binary_search_by(|name| name.as_str().cmp(me))
        .map_err(|_| {
            Error::ProtocolViolation(format!(
                "own election node {} is missing from the election set",
                me
            ))
        })?;

    if position == 0 {
        Ok(None)
    } else {
        Ok(Some(children.swap_remove(position - 1)))
    }
}

/// Whether `name` was allocated by `volunteer` under `prefix`
fn is_election_node(name: &str, prefix: &str) -> bool {
    name.len() == prefix.len() + path::SEQUENCE_WIDTH
        && name.starts_with(prefix)
        && path::sequence_suffix(name).is_some()
}

/// Election coordinator decides leadership from the election set
pub struct ElectionCoordinator {
    /// Coordination session
    client: Arc<dyn CoordinationClient>,
    /// Outcome handler
    callback: Arc<dyn ElectionCallback>,
    /// Election configuration
    config: ElectionConfig,
    /// Our node, once volunteered
    node: RwLock<Option<ElectionNode>>,
    /// Current state
    state: RwLock<ElectionState>,
    /// Serializes evaluations from the host and from watches
    evaluation: Mutex<()>,
    /// Watch left on the predecessor; reused so repeated evaluations collapse
    predecessor_watch: Arc<dyn Watcher>,
}

impl ElectionCoordinator {
    /// Create a new election coordinator
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        callback: Arc<dyn ElectionCallback>,
        config: ElectionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            client,
            callback,
            config,
            node: RwLock::new(None),
            state: RwLock::new(ElectionState::Undetermined),
            evaluation: Mutex::new(()),
            predecessor_watch: Arc::new(PredecessorWatch {
                coordinator: this.clone(),
            }),
        })
    }

    /// Get current state
    pub async fn state(&self) -> ElectionState {
        self.state.read().await.clone()
    }

    /// Get our election node, if volunteered
    pub async fn node(&self) -> Option<ElectionNode> {
        self.node.read().await.clone()
    }

    /// Create our election node.
    ///
    /// Must be called once per session: a second call enters a second
    /// competing node for the same participant.
    pub async fn volunteer(&self) -> Result<ElectionNode> {
        let prefix = path::join(&self.config.election_path, &self.config.node_prefix);
        let full_path = self
            .client
            .create(&prefix, &[], CreateMode::EphemeralSequential)
            .await
            .map_err(|e| {
                if e.is_unavailable() {
                    e
                } else {
                    Error::CoordinationUnavailable(format!(
                        "cannot create election node under {}: {}",
                        self.config.election_path, e
                    ))
                }
            })?;

        let node = ElectionNode::new(full_path);
        tracing::info!("Volunteered for leadership as {}", node.full_path);
        *self.node.write().await = Some(node.clone());
        Ok(node)
    }

    /// Decide who leads, notify the callback and, unless leader, watch the
    /// predecessor. Safe to call any number of times.
    pub async fn evaluate(&self) -> Result<ElectionState> {
        let _guard = self.evaluation.lock().await;

        match self.run_evaluation().await {
            Ok(state) => Ok(state),
            Err(e) => {
                *self.state.write().await = ElectionState::Undetermined;
                Err(e)
            }
        }
    }

    async fn run_evaluation(&self) -> Result<ElectionState> {
        let me = self
            .node
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::ProtocolViolation("evaluate called before volunteer".into()))?;

        let mut vanished: u32 = 0;
        loop {
            let children = self.election_set().await?;

            let Some(predecessor) = predecessor_of(children, &me.local_name)? else {
                self.transition(ElectionState::Leader).await;
                self.callback.on_elected_leader().await?;
                return Ok(ElectionState::Leader);
            };

            let predecessor_path = path::join(&self.config.election_path, &predecessor);
            let present = self
                .client
                .exists(&predecessor_path, Some(Arc::clone(&self.predecessor_watch)))
                .await?
                .is_some();

            let state = ElectionState::Worker {
                watching: predecessor.clone(),
            };
            if present {
                self.transition(state.clone()).await;
            }
            self.callback.on_worker().await?;
            if present {
                return Ok(state);
            }

            // Gone before the watch landed; no notification will come
            self.client
                .remove_watch(&predecessor_path, &self.predecessor_watch)
                .await?;
            tracing::debug!(
                "Predecessor {} vanished before it could be watched, re-evaluating",
                predecessor
            );
            tokio::time::sleep(Self::retry_delay(&self.config, vanished)).await;
            vanished = vanished.saturating_add(1);
        }
    }

    async fn transition(&self, next: ElectionState) {
        let mut state = self.state.write().await;
        if *state != next {
            match &next {
                ElectionState::Leader => tracing::info!("Elected as LEADER"),
                ElectionState::Worker { watching } => {
                    tracing::info!("Not the leader, watching {}", watching)
                }
                ElectionState::Undetermined => {}
            }
        }
        *state = next;
    }

    /// Delay before re-evaluating after `attempt` consecutive vanished
    /// predecessors: none at first, then jittered exponential up to the cap
    fn retry_delay(config: &ElectionConfig, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 1).min(16);
        let ceiling = config
            .retry_backoff_min_ms
            .saturating_mul(factor)
            .min(config.retry_backoff_max_ms);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(ceiling / 2..=ceiling))
    }

    /// Name of the current leader's node, read directly from the election set
    pub async fn current_leader(&self) -> Result<Option<String>> {
        Ok(self.election_set().await?.into_iter().min())
    }

    /// Election node names under the election path; anything else living
    /// there takes no part in the ordering
    async fn election_set(&self) -> Result<Vec<String>> {
        let mut children = self
            .client
            .get_children(&self.config.election_path, None)
            .await?;
        children.retain(|name| is_election_node(name, &self.config.node_prefix));
        Ok(children)
    }
}

/// Re-runs the election when the watched predecessor is deleted
struct PredecessorWatch {
    coordinator: Weak<ElectionCoordinator>,
}

#[async_trait]
impl Watcher for PredecessorWatch {
    async fn process(&self, event: WatchedEvent) {
        if event.kind != EventKind::NodeDeleted {
            tracing::trace!("Ignoring {} on {}", event.kind, event.path);
            return;
        }
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };

        tracing::info!("Predecessor {} is gone, re-running election", event.path);
        if let Err(e) = coordinator.evaluate().await {
            tracing::error!("Leader re-election failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{
        ensure_path, EventDispatcher, MemoryClient, MemoryEnsemble, NodeStat, SessionMonitor,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Outcome {
        Leader,
        Worker,
    }

    struct Recorder {
        leader_calls: AtomicUsize,
        worker_calls: AtomicUsize,
        tx: mpsc::UnboundedSender<Outcome>,
    }

    #[async_trait]
    impl ElectionCallback for Recorder {
        async fn on_elected_leader(&self) -> Result<()> {
            self.leader_calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.send(Outcome::Leader);
            Ok(())
        }

        async fn on_worker(&self) -> Result<()> {
            self.worker_calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.send(Outcome::Worker);
            Ok(())
        }
    }

    struct Participant {
        client: Arc<MemoryClient>,
        _monitor: SessionMonitor,
        coordinator: Arc<ElectionCoordinator>,
        recorder: Arc<Recorder>,
        outcomes: mpsc::UnboundedReceiver<Outcome>,
    }

    impl Participant {
        async fn next_outcome(&mut self) -> Outcome {
            tokio::time::timeout(Duration::from_secs(2), self.outcomes.recv())
                .await
                .expect("no election outcome within 2s")
                .expect("callback dropped")
        }
    }

    fn test_config() -> ElectionConfig {
        ElectionConfig {
            retry_backoff_min_ms: 1,
            retry_backoff_max_ms: 5,
            ..ElectionConfig::default()
        }
    }

    async fn participant(ensemble: &Arc<MemoryEnsemble>) -> Participant {
        let (client, rx) = ensemble.connect();
        let monitor = EventDispatcher::start(rx);
        ensure_path(&*client, "/election").await.unwrap();

        let (tx, outcomes) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            leader_calls: AtomicUsize::new(0),
            worker_calls: AtomicUsize::new(0),
            tx,
        });
        let coordinator = ElectionCoordinator::new(client.clone(), recorder.clone(), test_config());

        Participant {
            client,
            _monitor: monitor,
            coordinator,
            recorder,
            outcomes,
        }
    }

    #[test]
    fn test_predecessor_ordering() {
        let children = vec![
            "c_0000000001".to_string(),
            "c_0000000003".to_string(),
            "c_0000000002".to_string(),
        ];

        assert_eq!(predecessor_of(children.clone(), "c_0000000001").unwrap(), None);
        assert_eq!(
            predecessor_of(children.clone(), "c_0000000002").unwrap(),
            Some("c_0000000001".to_string())
        );
        assert_eq!(
            predecessor_of(children, "c_0000000003").unwrap(),
            Some("c_0000000002".to_string())
        );
    }

    #[test]
    fn test_predecessor_missing_self() {
        let err = predecessor_of(vec!["c_0000000001".to_string()], "c_0000000009").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        let config = ElectionConfig {
            retry_backoff_min_ms: 10,
            retry_backoff_max_ms: 100,
            ..ElectionConfig::default()
        };

        assert_eq!(ElectionCoordinator::retry_delay(&config, 0), Duration::ZERO);
        let first = ElectionCoordinator::retry_delay(&config, 1);
        assert!(first >= Duration::from_millis(5) && first <= Duration::from_millis(10));
        for attempt in 2..40 {
            assert!(ElectionCoordinator::retry_delay(&config, attempt) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_election_node_names() {
        let node = ElectionNode::new("/election/c_0000000007".to_string());
        assert_eq!(node.local_name, "c_0000000007");
        assert_eq!(node.sequence(), Some(7));
    }

    #[test]
    fn test_election_node_filter() {
        assert!(is_election_node("c_0000000004", "c_"));
        assert!(!is_election_node("a_registry", "c_"));
        assert!(!is_election_node("c_config", "c_"));
        assert!(!is_election_node("c_00000000042", "c_"));
        assert!(!is_election_node("n_0000000004", "c_"));
    }

    #[tokio::test]
    async fn test_foreign_children_do_not_block_leadership() {
        let ensemble = MemoryEnsemble::new();
        let p = participant(&ensemble).await;
        p.client.create("/election/a_registry", &[], CreateMode::Persistent).await.unwrap();
        p.client.create("/election/c_config", b"x", CreateMode::Persistent).await.unwrap();

        let node = p.coordinator.volunteer().await.unwrap();
        assert_eq!(p.coordinator.evaluate().await.unwrap(), ElectionState::Leader);
        assert_eq!(p.coordinator.current_leader().await.unwrap(), Some(node.local_name));
        assert_eq!(p.recorder.leader_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evaluate_before_volunteer() {
        let ensemble = MemoryEnsemble::new();
        let p = participant(&ensemble).await;

        let err = p.coordinator.evaluate().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(p.coordinator.state().await, ElectionState::Undetermined);
    }

    #[tokio::test]
    async fn test_volunteer_without_election_path() {
        let ensemble = MemoryEnsemble::new();
        let (client, _rx) = ensemble.connect();
        let (tx, _outcomes) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            leader_calls: AtomicUsize::new(0),
            worker_calls: AtomicUsize::new(0),
            tx,
        });
        let coordinator = ElectionCoordinator::new(client, recorder, test_config());

        let err = coordinator.volunteer().await.unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
    }

    #[tokio::test]
    async fn test_single_leader_and_predecessor_chain() {
        let ensemble = MemoryEnsemble::new();
        let mut pool = Vec::new();
        for _ in 0..5 {
            let p = participant(&ensemble).await;
            p.coordinator.volunteer().await.unwrap();
            pool.push(p);
        }

        let mut names = Vec::new();
        for p in &pool {
            p.coordinator.evaluate().await.unwrap();
            names.push(p.coordinator.node().await.unwrap().local_name);
        }

        let leaders: Vec<usize> = {
            let mut leaders = Vec::new();
            for (i, p) in pool.iter().enumerate() {
                if p.coordinator.state().await.is_leader() {
                    leaders.push(i);
                }
            }
            leaders
        };
        assert_eq!(leaders, vec![0]);
        assert_eq!(pool[0].coordinator.current_leader().await.unwrap(), Some(names[0].clone()));

        // Worker i watches i - 1: a chain rooted at the leader, no cycles
        for i in 1..pool.len() {
            assert_eq!(
                pool[i].coordinator.state().await,
                ElectionState::Worker {
                    watching: names[i - 1].clone()
                }
            );
            assert_eq!(pool[i].recorder.worker_calls.load(Ordering::SeqCst), 1);
            assert_eq!(pool[i].recorder.leader_calls.load(Ordering::SeqCst), 0);
        }
        assert_eq!(pool[0].recorder.leader_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evaluate_is_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let first = participant(&ensemble).await;
        let second = participant(&ensemble).await;
        first.coordinator.volunteer().await.unwrap();
        second.coordinator.volunteer().await.unwrap();

        let a = second.coordinator.evaluate().await.unwrap();
        let b = second.coordinator.evaluate().await.unwrap();
        let c = second.coordinator.evaluate().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(!a.is_leader());

        for _ in 0..3 {
            assert_eq!(first.coordinator.evaluate().await.unwrap(), ElectionState::Leader);
        }
    }

    #[tokio::test]
    async fn test_leader_departure_promotes_only_successor() {
        let ensemble = MemoryEnsemble::new();
        let mut pool = Vec::new();
        for _ in 0..3 {
            let p = participant(&ensemble).await;
            p.coordinator.volunteer().await.unwrap();
            pool.push(p);
        }
        for p in pool.iter_mut() {
            p.coordinator.evaluate().await.unwrap();
            p.next_outcome().await;
        }

        ensemble.expire_session(pool[0].client.session_id());

        assert_eq!(pool[1].next_outcome().await, Outcome::Leader);
        assert!(pool[1].coordinator.state().await.is_leader());

        // Nobody else was woken
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool[2].outcomes.try_recv().is_err());
        assert_eq!(pool[2].recorder.worker_calls.load(Ordering::SeqCst), 1);
        let successor = pool[1].coordinator.node().await.unwrap().local_name;
        assert_eq!(
            pool[2].coordinator.state().await,
            ElectionState::Worker { watching: successor }
        );
    }

    #[tokio::test]
    async fn test_middle_departure_rewires_watch() {
        let ensemble = MemoryEnsemble::new();
        let mut pool = Vec::new();
        for _ in 0..3 {
            let p = participant(&ensemble).await;
            p.coordinator.volunteer().await.unwrap();
            pool.push(p);
        }
        for p in pool.iter_mut() {
            p.coordinator.evaluate().await.unwrap();
            p.next_outcome().await;
        }

        ensemble.expire_session(pool[1].client.session_id());

        assert_eq!(pool[2].next_outcome().await, Outcome::Worker);
        let leader = pool[0].coordinator.node().await.unwrap().local_name;
        assert_eq!(
            pool[2].coordinator.state().await,
            ElectionState::Worker { watching: leader }
        );
        assert!(pool[0].coordinator.state().await.is_leader());
        assert_eq!(pool[0].recorder.leader_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_delete_events_are_ignored() {
        let ensemble = MemoryEnsemble::new();
        let mut leader = participant(&ensemble).await;
        let mut worker = participant(&ensemble).await;
        let leader_node = leader.coordinator.volunteer().await.unwrap();
        worker.coordinator.volunteer().await.unwrap();
        leader.coordinator.evaluate().await.unwrap();
        leader.next_outcome().await;
        worker.coordinator.evaluate().await.unwrap();
        worker.next_outcome().await;

        leader
            .client
            .set_data(&leader_node.full_path, b"touched", None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker.outcomes.try_recv().is_err());
        assert_eq!(worker.recorder.worker_calls.load(Ordering::SeqCst), 1);
    }

    /// Expires a victim session between listing the election set and
    /// watching the predecessor
    struct RacingClient {
        inner: Arc<MemoryClient>,
        ensemble: Arc<MemoryEnsemble>,
        victim: std::sync::Mutex<Option<crate::coordination::SessionId>>,
    }

    #[async_trait]
    impl CoordinationClient for RacingClient {
        fn session_id(&self) -> crate::coordination::SessionId {
            self.inner.session_id()
        }

        async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
            self.inner.create(path, data, mode).await
        }

        async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
            self.inner.delete(path, version).await
        }

        async fn exists(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Option<NodeStat>> {
            let victim = self.victim.lock().unwrap().take();
            if let Some(victim) = victim {
                self.ensemble.expire_session(victim);
            }
            self.inner.exists(path, watcher).await
        }

        async fn get_children(&self, path: &str, watcher: Option<Arc<dyn Watcher>>) -> Result<Vec<String>> {
            self.inner.get_children(path, watcher).await
        }

        async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
            self.inner.get_data(path).await
        }

        async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<NodeStat> {
            self.inner.set_data(path, data, version).await
        }

        async fn remove_watch(&self, path: &str, watcher: &Arc<dyn Watcher>) -> Result<()> {
            self.inner.remove_watch(path, watcher).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_vanished_predecessor_triggers_reevaluation() {
        let ensemble = MemoryEnsemble::new();
        let leader = participant(&ensemble).await;
        leader.coordinator.volunteer().await.unwrap();

        let (inner, rx) = ensemble.connect();
        let _monitor = EventDispatcher::start(rx);
        let racing = Arc::new(RacingClient {
            inner,
            ensemble: ensemble.clone(),
            victim: std::sync::Mutex::new(Some(leader.client.session_id())),
        });
        let (tx, _outcomes) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            leader_calls: AtomicUsize::new(0),
            worker_calls: AtomicUsize::new(0),
            tx,
        });
        let coordinator = ElectionCoordinator::new(racing, recorder.clone(), test_config());
        coordinator.volunteer().await.unwrap();

        let state = coordinator.evaluate().await.unwrap();
        assert_eq!(state, ElectionState::Leader);
        assert_eq!(recorder.worker_calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.leader_calls.load(Ordering::SeqCst), 1);

        // The watch left on the vanished predecessor is not kept around
        assert_eq!(ensemble.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_evaluation_resets_state() {
        let ensemble = MemoryEnsemble::new();
        let p = participant(&ensemble).await;
        p.coordinator.volunteer().await.unwrap();
        assert!(p.coordinator.evaluate().await.unwrap().is_leader());

        p.client.close().await.unwrap();
        let err = p.coordinator.evaluate().await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(p.coordinator.state().await, ElectionState::Undetermined);
    }
}
