//! trib: consistency checker and repair tool for sharded key-value clusters.
//!
//! A cluster splits its keyspace into 16384 hash slots spread over master
//! nodes. Starting from one seed address, trib discovers every node, checks
//! that each slot has exactly one owner and that all nodes agree on the
//! layout, and optionally repairs what it finds.
//!
//! The pieces, bottom up:
//!
//! - [`connection`]: the node transport (`Link` / `Connector`) and its TCP
//!   implementation.
//! - [`node`]: one handle per cluster node, with its locally tracked state
//!   and the flush protocol that pushes pending changes.
//! - [`gossip`]: parsing of `CLUSTER NODES` tables and config signatures.
//! - [`topology`]: discovery from a seed and replica placement.
//! - [`check`] and [`repair`]: the consistency checker and repair engine.
//! - [`ops`]: the operator commands built on top of all of the above.

pub mod addr;
pub mod check;
pub mod config;
pub mod connection;
pub mod error;
pub mod format;
pub mod gossip;
pub mod node;
pub mod ops;
pub mod repair;
pub mod report;
pub mod slots;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use addr::NodeAddr;
pub use check::{check, Finding};
pub use config::TribConfig;
pub use connection::{ConnectOptions, Connection, Connector, Link, TcpConnector};
pub use error::{AdminError, ConnectionError};
pub use gossip::SignatureMode;
pub use node::{ClusterNode, NodeFlag, NodeFlags, NodeInfo, PendingChange, SlotStatus};
pub use repair::{RepairEngine, RepairOptions, RepairOutcome, RepairState};
pub use topology::Topology;
