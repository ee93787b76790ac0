//! # ldapgate-directory
//!
//! The use-case layer of the directory gateway: entry statistics and
//! paginated listings, CRUD with declarative auto-generation, best-effort
//! group-membership transactions, and the replication monitor with its
//! `contextCSN` snapshot and write-propagation probe.

#![deny(missing_docs)]

pub mod autogen;
pub mod monitor;
pub mod provider;
pub mod service;
pub mod stack;

pub use monitor::{
    ClusterSnapshot, NodeSnapshot, NodeTopology, ProbeNodeResult, ProbeReport, ReplicationMonitor,
    SyncPeer, DEFAULT_PROBE_WAIT,
};
pub use provider::VaultPasswordProvider;
pub use service::{
    ClusterHealth, DirectoryService, EntryStats, GroupInfo, MembershipOutcome,
};
pub use stack::{GatewayStack, Liveness};

/// Convenient result alias reusing the core error type.
pub type Result<T> = ldapgate_core::Result<T>;
