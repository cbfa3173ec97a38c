//! Operator commands.
//!
//! Each operation loads the topology from a seed first; a load failure is
//! the operation's error and nothing else happens. Results come back as
//! report structs that [`crate::report`] renders.

use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};
use trib_protocol::Frame;

use crate::addr::NodeAddr;
use crate::check::{self, Finding};
use crate::connection::Connector;
use crate::error::{AdminError, ConnectionError};
use crate::gossip::SignatureMode;
use crate::repair::{RepairEngine, RepairOptions, RepairOutcome};
use crate::topology::Topology;

/// A node the seed lists but that couldn't be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreachable {
    pub addr: NodeAddr,
    pub id: String,
    pub error: String,
}

fn unreachable_of<L>(topology: &Topology<L>) -> Vec<Unreachable> {
    topology
        .unreachable()
        .iter()
        .map(|u| Unreachable {
            addr: u.addr.clone(),
            id: u.id.clone(),
            error: u.error.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub seed: NodeAddr,
    /// `M:`/`S:` summaries, seed first.
    pub nodes: Vec<String>,
    pub unreachable: Vec<Unreachable>,
    pub findings: Vec<Finding>,
    /// Slots claimed by at least one node.
    pub covered: usize,
}

impl CheckReport {
    pub fn from_topology<L>(seed: &NodeAddr, topology: &Topology<L>, mode: SignatureMode) -> Self {
        CheckReport {
            seed: seed.clone(),
            nodes: topology.nodes().iter().map(|n| n.info_string()).collect(),
            unreachable: unreachable_of(topology),
            findings: check::check(topology, mode),
            covered: check::covered_slots(topology),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Loads the cluster and reports what is wrong with it.
pub async fn check<C: Connector>(
    seed: &NodeAddr,
    connector: &C,
    mode: SignatureMode,
) -> Result<CheckReport, AdminError> {
    let topology = Topology::load(seed, connector).await?;
    Ok(CheckReport::from_topology(seed, &topology, mode))
}

#[derive(Debug)]
pub struct FixReport {
    /// State before any repair.
    pub before: CheckReport,
    pub outcome: RepairOutcome,
}

/// Checks the cluster, then repairs it within `opts`' budget.
pub async fn fix<C: Connector>(
    seed: &NodeAddr,
    connector: &C,
    opts: RepairOptions,
) -> Result<FixReport, AdminError> {
    let mut topology = Topology::load(seed, connector).await?;
    let before = CheckReport::from_topology(seed, &topology, opts.signature);
    let outcome = RepairEngine::new(&mut topology, opts).run().await;
    info!(state = %outcome.state, passes = outcome.passes, "repair finished");
    Ok(FixReport { before, outcome })
}

#[derive(Debug)]
pub struct MasterSummary {
    pub addr: NodeAddr,
    pub id: String,
    pub keys: Result<u64, ConnectionError>,
    pub slots: usize,
    pub replicas: usize,
}

#[derive(Debug)]
pub struct InfoReport {
    pub masters: Vec<MasterSummary>,
}

impl InfoReport {
    /// Keys over every master that answered.
    pub fn total_keys(&self) -> u64 {
        self.masters
            .iter()
            .filter_map(|m| m.keys.as_ref().ok())
            .sum()
    }

    pub fn total_slots(&self) -> usize {
        self.masters.iter().map(|m| m.slots).sum()
    }

    pub fn keys_per_slot(&self) -> f64 {
        match self.total_slots() {
            0 => 0.0,
            slots => self.total_keys() as f64 / slots as f64,
        }
    }
}

/// Per-master key, slot and replica counts. `DBSIZE` goes to every master
/// at once, each bounded by `per_node`.
pub async fn info<C: Connector>(
    seed: &NodeAddr,
    connector: &C,
    per_node: Duration,
) -> Result<InfoReport, AdminError> {
    let mut topology = Topology::load(seed, connector).await?;
    let masters = join_all(
        topology
            .nodes_mut()
            .iter_mut()
            .filter(|n| n.is_master())
            .map(|node| async move {
                let keys = tokio::time::timeout(per_node, node.dbsize())
                    .await
                    .unwrap_or(Err(ConnectionError::Timeout(per_node)));
                MasterSummary {
                    addr: node.addr().clone(),
                    id: node.id().to_string(),
                    keys,
                    slots: node.info().slot_count(),
                    replicas: node.replicas().len(),
                }
            }),
    )
    .await;
    Ok(InfoReport { masters })
}

#[derive(Debug)]
pub struct DelNodeReport {
    pub id: String,
    pub addr: NodeAddr,
    /// `(replica, new master)` pairs.
    pub reassigned: Vec<(String, String)>,
    /// Nodes that refused to forget the removed one.
    pub forget_failures: Vec<(NodeAddr, ConnectionError)>,
}

/// Removes an empty node from the cluster.
///
/// Replicas of the node are moved to the least loaded remaining master,
/// every other node is told to forget it, and finally the node is shut
/// down.
pub async fn del_node<C: Connector>(
    seed: &NodeAddr,
    connector: &C,
    node_id: &str,
) -> Result<DelNodeReport, AdminError> {
    let id = node_id.to_ascii_lowercase();
    let mut topology = Topology::load(seed, connector).await?;

    let target = topology
        .get(&id)
        .ok_or_else(|| AdminError::UnknownNode(id.clone()))?;
    let addr = target.addr().clone();
    let slots = target.info().slot_count();
    if slots > 0 {
        return Err(AdminError::NodeNotEmpty { addr, slots });
    }
    let replicas = target.replicas().to_vec();
    info!(%id, %addr, replicas = replicas.len(), "removing node");

    let mut reassigned = Vec::new();
    for replica in replicas {
        let master = topology
            .least_loaded_master(&[id.as_str()])
            .map(|m| m.id().to_string())
            .ok_or_else(|| AdminError::NoMasterForReplica(replica.clone()))?;
        let Some(node) = topology.get_mut(&replica) else {
            continue;
        };
        info!(%replica, %master, "re-pointing replica");
        node.set_replicate(&master);
        let replica_addr = node.addr().clone();
        node.flush()
            .await
            .map_err(|e| AdminError::node(&replica_addr, e))?;
        // keeps placement counts current for the next replica
        topology.resolve_replicas();
        reassigned.push((replica, master));
    }

    let mut forget_failures = Vec::new();
    for node in topology.nodes_mut().iter_mut().filter(|n| n.id() != id) {
        if let Err(e) = node.forget(&id).await {
            warn!(addr = %node.addr(), error = %e, "FORGET failed");
            forget_failures.push((node.addr().clone(), e));
        }
    }

    if let Some(node) = topology.get_mut(&id) {
        node.shutdown()
            .await
            .map_err(|e| AdminError::node(&addr, e))?;
    }

    Ok(DelNodeReport {
        id,
        addr,
        reassigned,
        forget_failures,
    })
}

#[derive(Debug)]
pub struct CallReport {
    pub command: Vec<String>,
    pub replies: Vec<(NodeAddr, String, Result<Frame, ConnectionError>)>,
    pub unreachable: Vec<Unreachable>,
}

/// Sends one command to every reachable node. The command name is
/// upper-cased; arguments go out as given.
pub async fn call<C: Connector>(
    seed: &NodeAddr,
    connector: &C,
    args: &[String],
    per_node: Duration,
) -> Result<CallReport, AdminError> {
    let (name, rest) = args.split_first().ok_or(AdminError::EmptyCommand)?;
    let mut command = vec![name.to_ascii_uppercase()];
    command.extend(rest.iter().cloned());

    let mut topology = Topology::load(seed, connector).await?;
    let replies = topology.broadcast(&command, per_node).await;
    Ok(CallReport {
        command,
        replies,
        unreachable: unreachable_of(&topology),
    })
}
