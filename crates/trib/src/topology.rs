//! Cluster discovery from a single seed.
//!
//! [`Topology::load`] connects to the seed, reads its peer table and then
//! connects to every peer it lists, concurrently. Peers that can't be
//! reached are recorded instead of failing the load; only a seed failure
//! is fatal.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};
use trib_protocol::Frame;

use crate::addr::NodeAddr;
use crate::connection::{Connector, Link};
use crate::error::{AdminError, ConnectionError};
use crate::node::{ClusterNode, NodeFlag, NodeInfo};

/// A node the seed knows about that couldn't be loaded.
#[derive(Debug)]
pub struct UnreachableNode {
    pub addr: NodeAddr,
    /// Id as reported by the seed's table.
    pub id: String,
    pub error: ConnectionError,
}

/// Every reachable node discovered from one seed, seed first.
#[derive(Debug)]
pub struct Topology<L> {
    nodes: Vec<ClusterNode<L>>,
    unreachable: Vec<UnreachableNode>,
}

impl<L: Link> Topology<L> {
    /// Discovers the cluster reachable from `seed`.
    pub async fn load<C>(seed: &NodeAddr, connector: &C) -> Result<Self, AdminError>
    where
        C: Connector<Link = L>,
    {
        let link = connector
            .connect(seed)
            .await
            .map_err(|source| AdminError::Connect {
                addr: seed.clone(),
                source,
            })?;
        let mut first = ClusterNode::new(seed.clone(), link);

        let enabled = first
            .is_cluster_enabled()
            .await
            .map_err(|e| AdminError::node(seed, e))?;
        if !enabled {
            return Err(AdminError::NotClusterNode(seed.clone()));
        }
        first
            .load_info(true)
            .await
            .map_err(|e| AdminError::node(seed, e))?;
        info!(%seed, id = %first.id(), peers = first.friends().len(), "loaded seed");

        let mut seen_addrs = BTreeSet::from([seed.clone()]);
        let peers: Vec<(NodeAddr, String)> = first
            .friends()
            .iter()
            .filter(|peer| {
                !peer.flags.contains(NodeFlag::NoAddr) && !peer.flags.contains(NodeFlag::Handshake)
            })
            .filter_map(|peer| Some((peer.addr.clone()?, peer.id.clone())))
            .filter(|(addr, _)| seen_addrs.insert(addr.clone()))
            .collect();

        let loads = peers.into_iter().map(|(addr, id)| async move {
            let result = async {
                let link = connector.connect(&addr).await?;
                let mut node = ClusterNode::new(addr.clone(), link);
                node.load_info(true).await?;
                Ok::<_, ConnectionError>(node)
            }
            .await;
            (addr, id, result)
        });

        let mut topology = Topology {
            nodes: vec![first],
            unreachable: Vec::new(),
        };
        for (addr, id, result) in join_all(loads).await {
            match result {
                Ok(node) => topology.push(node),
                Err(error) => {
                    warn!(%addr, %id, %error, "node unreachable");
                    topology.unreachable.push(UnreachableNode { addr, id, error });
                }
            }
        }

        topology.resolve_replicas();
        Ok(topology)
    }

    /// Reloads every node's state concurrently, each bounded by
    /// `per_node`, and re-resolves replicas.
    ///
    /// A node that fails to reload is moved to the unreachable list so its
    /// stale state no longer takes part in checks. Returns the nodes lost
    /// by this call.
    pub async fn refresh(&mut self, per_node: Duration) -> &[UnreachableNode] {
        let results = join_all(self.nodes.iter_mut().map(|node| async move {
            tokio::time::timeout(per_node, node.load_info(true))
                .await
                .unwrap_or(Err(ConnectionError::Timeout(per_node)))
        }))
        .await;

        let lost_from = self.unreachable.len();
        let mut kept = Vec::with_capacity(self.nodes.len());
        for (node, result) in std::mem::take(&mut self.nodes).into_iter().zip(results) {
            match result {
                Ok(()) => kept.push(node),
                Err(error) => {
                    warn!(addr = %node.addr(), id = %node.id(), %error, "node lost during refresh");
                    self.unreachable.push(UnreachableNode {
                        addr: node.addr().clone(),
                        id: node.id().to_string(),
                        error,
                    });
                }
            }
        }
        self.nodes = kept;

        self.resolve_replicas();
        &self.unreachable[lost_from..]
    }

    /// Sends `args` to every node at once, each bounded by `per_node`.
    pub async fn broadcast(
        &mut self,
        args: &[String],
        per_node: Duration,
    ) -> Vec<(NodeAddr, String, Result<Frame, ConnectionError>)> {
        join_all(self.nodes.iter_mut().map(|node| async move {
            let result = tokio::time::timeout(per_node, node.call(args))
                .await
                .unwrap_or(Err(ConnectionError::Timeout(per_node)));
            (node.addr().clone(), node.id().to_string(), result)
        }))
        .await
    }
}

impl<L> Topology<L> {
    /// Builds a topology from already loaded handles; the first is the
    /// seed.
    pub fn from_nodes(nodes: Vec<ClusterNode<L>>) -> Self {
        let mut topology = Topology {
            nodes: Vec::new(),
            unreachable: Vec::new(),
        };
        for node in nodes {
            topology.push(node);
        }
        topology.resolve_replicas();
        topology
    }

    fn push(&mut self, node: ClusterNode<L>) {
        if self.nodes.iter().any(|n| n.id() == node.id()) {
            warn!(addr = %node.addr(), id = %node.id(), "duplicate node id, ignoring");
            return;
        }
        self.nodes.push(node);
    }

    /// Rebuilds every node's replica list from replication targets.
    pub fn resolve_replicas(&mut self) {
        let mut by_master: HashMap<String, Vec<String>> = HashMap::new();
        for node in &self.nodes {
            if let Some(master) = &node.info().replicate {
                by_master
                    .entry(master.clone())
                    .or_default()
                    .push(node.id().to_string());
            }
        }
        for node in &mut self.nodes {
            let replicas = by_master.remove(node.id()).unwrap_or_default();
            node.set_replicas(replicas);
        }
        for (master, replicas) in by_master {
            debug!(%master, ?replicas, "replicas of unknown master");
        }
    }

    pub fn nodes(&self) -> &[ClusterNode<L>] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [ClusterNode<L>] {
        &mut self.nodes
    }

    pub fn seed(&self) -> Option<&ClusterNode<L>> {
        self.nodes.first()
    }

    pub fn unreachable(&self) -> &[UnreachableNode] {
        &self.unreachable
    }

    pub fn is_unreachable(&self, id: &str) -> bool {
        self.unreachable.iter().any(|u| u.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&ClusterNode<L>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ClusterNode<L>> {
        self.nodes.iter_mut().find(|n| n.id() == id)
    }

    pub fn masters(&self) -> impl Iterator<Item = &ClusterNode<L>> + '_ {
        self.nodes.iter().filter(|n| n.is_master())
    }

    /// What the seed's table says about a node this topology couldn't load.
    pub fn seed_view_of(&self, id: &str) -> Option<&NodeInfo> {
        self.seed()?.friends().iter().find(|f| f.id == id)
    }

    /// The master owning the fewest slots; ties go to the lowest id.
    pub fn master_with_fewest_slots(&self) -> Option<&ClusterNode<L>> {
        self.masters()
            .min_by(|a, b| {
                a.info()
                    .slot_count()
                    .cmp(&b.info().slot_count())
                    .then_with(|| a.id().cmp(b.id()))
            })
    }

    /// The master with the fewest replicas, skipping `excluding`. Ties go
    /// to the first one discovered.
    pub fn least_loaded_master(&self, excluding: &[&str]) -> Option<&ClusterNode<L>> {
        self.masters()
            .filter(|m| !excluding.contains(&m.id()))
            .min_by_key(|m| m.replicas().len())
    }
}
