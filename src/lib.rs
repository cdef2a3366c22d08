//! WolfCoord - Leader Election and Service Registry
//!
//! Two coordination primitives built on a hierarchical coordination
//! service that offers persistent and ephemeral nodes, sequential names
//! and one-shot watches.
//!
//! # Architecture
//!
//! Every participant owns a single coordination session. The election
//! coordinator enters an ephemeral sequential node and leads when its node
//! has the smallest name; otherwise it watches only its predecessor. The
//! membership registry publishes the participant's address as an ephemeral
//! node and keeps a snapshot of all registered addresses.
//!
//! # Features
//!
//! - Herd-free leader election with automatic failover
//! - Service registry with watch-driven membership snapshots
//! - Serialized notification dispatch per session
//! - ZooKeeper backend for clusters spanning processes and hosts
//! - Embedded in-process coordination service for local clusters and tests

pub mod config;
pub mod error;
pub mod coordination;
pub mod state;
pub mod node;

pub use config::WolfCoordConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfCoordConfig;
    pub use crate::error::{Error, Result};
    pub use crate::coordination::{
        Backend, CoordinationClient, EventDispatcher, MemoryEnsemble, SessionMonitor, ZooKeeperClient,
    };
    pub use crate::state::{ElectionCallback, ElectionCoordinator, ElectionState, MembershipRegistry};
    pub use crate::node::Node;
}
