//! Error types.
//!
//! [`ConnectionError`] covers a single node's transport and is usually
//! recorded per node. [`AdminError`] aborts the whole invocation.

use std::time::Duration;

use trib_protocol::ProtocolError;

use crate::addr::NodeAddr;

/// Errors talking to one node.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server disconnected")]
    Disconnected,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The node answered with an error reply.
    #[error("{0}")]
    Reply(String),

    /// The node answered, but not with the shape the command expects.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Errors that end an operation.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: NodeAddr,
        source: ConnectionError,
    },

    #[error("{addr}: {source}")]
    Node {
        addr: NodeAddr,
        source: ConnectionError,
    },

    #[error("{0} is not configured as a cluster node")]
    NotClusterNode(NodeAddr),

    #[error("no such node ID {0}")]
    UnknownNode(String),

    #[error("node {addr} is not empty ({slots} slots)! reshard data away and try again")]
    NodeNotEmpty { addr: NodeAddr, slots: usize },

    #[error("no master left to take over replica {0}")]
    NoMasterForReplica(String),

    #[error("no command given")]
    EmptyCommand,

    #[error("config error: {0}")]
    Config(String),
}

impl AdminError {
    pub(crate) fn node(addr: &NodeAddr, source: ConnectionError) -> Self {
        AdminError::Node {
            addr: addr.clone(),
            source,
        }
    }
}
