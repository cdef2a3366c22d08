//! State Management Module
//!
//! Leadership and membership as derived from the coordination service:
//! who leads the pool, and which members are currently registered.

pub mod election;
pub mod membership;

pub use election::{ElectionCallback, ElectionConfig, ElectionCoordinator, ElectionNode, ElectionState};
pub use membership::{MembershipRegistry, MembershipSnapshot, PublishPolicy, RegistryConfig};
