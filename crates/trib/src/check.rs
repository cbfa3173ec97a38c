//! Consistency checks over a loaded [`Topology`].
//!
//! [`check`] never touches the cluster. It reads each node's own report and
//! gossip view and returns findings in a fixed order: slot coverage, open
//! slots, replica integrity, then convergence.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::gossip::{self, SignatureMode};
use crate::slots::SLOT_COUNT;
use crate::topology::Topology;

/// One inconsistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// No node claims the slot.
    SlotUnassigned { slot: u16 },
    /// More than one node claims the slot.
    SlotMultiplyAssigned { slot: u16, owners: Vec<String> },
    /// The slot is being migrated or imported somewhere.
    OpenSlot { slot: u16, nodes: Vec<String> },
    /// A replica points at a master that isn't in the topology.
    DanglingReplica { node: String, target: String },
    /// Nodes disagree about the slot layout; `(node id, signature)` pairs.
    SignatureMismatch { signatures: Vec<(String, String)> },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::SlotUnassigned { slot } => write!(f, "slot {slot} is not covered by any node"),
            Finding::SlotMultiplyAssigned { slot, owners } => {
                write!(f, "slot {slot} is claimed by {}", owners.join(", "))
            }
            Finding::OpenSlot { slot, nodes } => {
                write!(f, "slot {slot} is open (nodes: {})", nodes.join(", "))
            }
            Finding::DanglingReplica { node, target } => {
                write!(f, "node {node} replicates unknown master {target}")
            }
            Finding::SignatureMismatch { signatures } => {
                let distinct: BTreeSet<&str> = signatures.iter().map(|(_, s)| s.as_str()).collect();
                write!(
                    f,
                    "nodes don't agree about configuration ({} distinct views across {} nodes)",
                    distinct.len(),
                    signatures.len()
                )
            }
        }
    }
}

/// Runs every check and returns what it found, in check order.
pub fn check<L>(topology: &Topology<L>, mode: SignatureMode) -> Vec<Finding> {
    let mut findings = coverage(topology);
    findings.extend(open_slots(topology));
    findings.extend(dangling_replicas(topology));
    findings.extend(convergence(topology, mode));
    findings
}

/// Number of slots claimed by at least one node.
pub fn covered_slots<L>(topology: &Topology<L>) -> usize {
    let owned: BTreeSet<u16> = topology
        .nodes()
        .iter()
        .flat_map(|n| n.info().owned_slots())
        .collect();
    owned.len()
}

fn coverage<L>(topology: &Topology<L>) -> Vec<Finding> {
    let mut owners: Vec<Vec<&str>> = vec![Vec::new(); SLOT_COUNT as usize];
    for node in topology.nodes() {
        for slot in node.info().owned_slots() {
            owners[slot as usize].push(node.id());
        }
    }

    owners
        .into_iter()
        .enumerate()
        .filter_map(|(slot, mut ids)| {
            let slot = slot as u16;
            match ids.len() {
                0 => Some(Finding::SlotUnassigned { slot }),
                1 => None,
                _ => {
                    ids.sort_unstable();
                    Some(Finding::SlotMultiplyAssigned {
                        slot,
                        owners: ids.into_iter().map(str::to_string).collect(),
                    })
                }
            }
        })
        .collect()
}

fn open_slots<L>(topology: &Topology<L>) -> Vec<Finding> {
    let mut open: BTreeMap<u16, BTreeSet<String>> = BTreeMap::new();
    for node in topology.nodes() {
        let info = node.info();
        for (slot, peer) in info.migrating.iter().chain(info.importing.iter()) {
            let stakeholders = open.entry(*slot).or_default();
            stakeholders.insert(node.id().to_string());
            stakeholders.insert(peer.clone());
        }
    }

    for (slot, stakeholders) in open.iter_mut() {
        for node in topology.nodes() {
            if node.info().owns(*slot) {
                stakeholders.insert(node.id().to_string());
            }
        }
    }

    open.into_iter()
        .map(|(slot, nodes)| Finding::OpenSlot {
            slot,
            nodes: nodes.into_iter().collect(),
        })
        .collect()
}

fn dangling_replicas<L>(topology: &Topology<L>) -> Vec<Finding> {
    topology
        .nodes()
        .iter()
        .filter_map(|node| {
            let target = node.info().replicate.as_ref()?;
            topology.get(target).is_none().then(|| Finding::DanglingReplica {
                node: node.id().to_string(),
                target: target.clone(),
            })
        })
        .collect()
}

fn convergence<L>(topology: &Topology<L>, mode: SignatureMode) -> Option<Finding> {
    let signatures: Vec<(String, String)> = topology
        .nodes()
        .iter()
        .map(|node| (node.id().to_string(), gossip::signature(node.view(), mode)))
        .collect();

    let distinct: BTreeSet<&str> = signatures.iter().map(|(_, s)| s.as_str()).collect();
    (distinct.len() > 1).then_some(Finding::SignatureMismatch { signatures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCluster, FakeNode};

    async fn load(cluster: &FakeCluster) -> Topology<crate::testing::FakeLink> {
        Topology::load(&FakeCluster::addr(7000), cluster).await.unwrap()
    }

    #[tokio::test]
    async fn healthy_cluster_is_clean() {
        let cluster = FakeCluster::new();
        cluster.add(FakeNode::master("a", 7000).slots(0..=5460));
        cluster.add(FakeNode::master("b", 7001).slots(5461..=10922));
        cluster.add(FakeNode::master("c", 7002).slots(10923..=16383));
        cluster.add(FakeNode::replica("a1", 7003, "a"));

        let topology = load(&cluster).await;
        assert!(check(&topology, SignatureMode::Raw).is_empty());
        assert_eq!(covered_slots(&topology), 16384);
    }

    #[tokio::test]
    async fn missing_slot_reported_once() {
        let cluster = FakeCluster::new();
        cluster.add(FakeNode::master("a", 7000).slots(0..=4999));
        cluster.add(FakeNode::master("b", 7001).slots(5001..=16383));

        let topology = load(&cluster).await;
        let findings = check(&topology, SignatureMode::Raw);
        assert_eq!(findings, [Finding::SlotUnassigned { slot: 5000 }]);
        assert_eq!(covered_slots(&topology), 16383);
    }

    #[tokio::test]
    async fn double_owned_slot_reported_once() {
        let cluster = FakeCluster::new();
        cluster.add(FakeNode::master("a", 7000).slots(0..=8192));
        cluster.add(FakeNode::master("b", 7001).slots(8192..=16383));

        let topology = load(&cluster).await;
        let findings = check(&topology, SignatureMode::Raw);
        assert_eq!(
            findings,
            [Finding::SlotMultiplyAssigned {
                slot: 8192,
                owners: vec!["a".into(), "b".into()],
            }]
        );
    }

    #[tokio::test]
    async fn open_slot_lists_all_stakeholders() {
        let cluster = FakeCluster::new();
        cluster.add(
            FakeNode::master("a", 7000)
                .slots(0..=8191)
                .migrating(200, "b"),
        );
        cluster.add(
            FakeNode::master("b", 7001)
                .slots(8192..=16383)
                .importing(200, "a"),
        );

        let topology = load(&cluster).await;
        let findings = check(&topology, SignatureMode::Raw);
        assert_eq!(
            findings,
            [Finding::OpenSlot {
                slot: 200,
                nodes: vec!["a".into(), "b".into()],
            }]
        );
    }

    #[tokio::test]
    async fn replica_of_missing_master() {
        let cluster = FakeCluster::new();
        cluster.add(FakeNode::master("a", 7000).slots(0..=16383));
        cluster.add(FakeNode::replica("r", 7001, "gone"));

        let topology = load(&cluster).await;
        let findings = check(&topology, SignatureMode::Raw);
        assert_eq!(
            findings,
            [Finding::DanglingReplica {
                node: "r".into(),
                target: "gone".into(),
            }]
        );
    }

    #[tokio::test]
    async fn stale_view_breaks_convergence() {
        let cluster = FakeCluster::new();
        cluster.add(FakeNode::master("a", 7000).slots(0..=8191));
        cluster.add(FakeNode::master("b", 7001).slots(8192..=16383).view(
            "b 127.0.0.1:7001@17001 myself,master - 0 0 1 connected 8192-16383\n\
             a 127.0.0.1:7000@17000 master - 0 0 1 connected 0-8190\n",
        ));

        let topology = load(&cluster).await;
        let findings = check(&topology, SignatureMode::Raw);
        assert_eq!(findings.len(), 1);
        let Finding::SignatureMismatch { signatures } = &findings[0] else {
            panic!("expected a signature mismatch, got {findings:?}");
        };
        assert_eq!(signatures.len(), 2);
        assert!(findings[0].to_string().contains("2 distinct views"));
    }

    #[tokio::test]
    async fn check_does_not_send_mutations() {
        let cluster = FakeCluster::new();
        cluster.add(FakeNode::master("a", 7000).slots(0..=100));
        let topology = load(&cluster).await;
        cluster.clear_log();

        let findings = check(&topology, SignatureMode::Raw);
        assert_eq!(findings.len(), 16384 - 101);
        assert!(cluster.commands().is_empty());
    }
}
