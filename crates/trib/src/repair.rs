//! Repair engine.
//!
//! A small state machine drives repairs:
//!
//! ```text
//! Scanning --clean--> Done
//! Scanning --findings--> Repairing --pass done--> Scanning
//!                        Repairing --budget spent / no progress--> Unfixable
//! ```
//!
//! Each pass walks the findings in order and applies one remediation per
//! finding, sequentially. After a pass every node is reloaded before the
//! next scan. The session is bounded by a pass budget and a wall-clock
//! deadline.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::addr::NodeAddr;
use crate::check::{check, Finding};
use crate::connection::Link;
use crate::error::ConnectionError;
use crate::gossip::SignatureMode;
use crate::node::SlotStatus;
use crate::topology::Topology;

/// Limits for one repair session.
#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Maximum number of repair passes.
    pub max_attempts: u32,
    /// Wall-clock budget for the whole session.
    pub timeout: Duration,
    /// Pause before re-scanning when only gossip convergence is pending.
    pub settle: Duration,
    pub signature: SignatureMode,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout: Duration::from_secs(60),
            settle: Duration::from_secs(1),
            signature: SignatureMode::Raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairState {
    Scanning,
    Repairing,
    Done,
    Unfixable,
}

impl RepairState {
    fn can_become(self, next: RepairState) -> bool {
        use RepairState::*;
        matches!(
            (self, next),
            (Scanning, Done) | (Scanning, Repairing) | (Repairing, Scanning) | (Repairing, Unfixable)
        )
    }
}

impl fmt::Display for RepairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepairState::Scanning => "scanning",
            RepairState::Repairing => "repairing",
            RepairState::Done => "done",
            RepairState::Unfixable => "unfixable",
        };
        f.write_str(name)
    }
}

/// What came of one remediation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remedy {
    /// The cluster was changed.
    Applied(String),
    /// Nothing was sent; an operator has to step in.
    Deferred(String),
    /// An RPC failed.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RepairAction {
    pub finding: Finding,
    pub remedy: Remedy,
}

/// A node that stopped answering partway through a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostNode {
    pub addr: NodeAddr,
    pub id: String,
    pub error: String,
}

/// Final result of a session.
#[derive(Debug)]
pub struct RepairOutcome {
    pub state: RepairState,
    pub passes: u32,
    pub actions: Vec<RepairAction>,
    /// Findings still present when the session ended.
    pub residual: Vec<Finding>,
    /// Nodes dropped from the topology because a reload failed.
    pub lost: Vec<LostNode>,
}

impl RepairOutcome {
    pub fn is_done(&self) -> bool {
        self.state == RepairState::Done
    }

    /// Whether some finding was left for an operator, even if the session
    /// reached `Done` afterwards.
    pub fn needs_follow_up(&self) -> bool {
        !self.lost.is_empty()
            || self
                .actions
                .iter()
                .any(|a| matches!(a.remedy, Remedy::Deferred(_)))
    }
}

/// Drives repairs over a loaded topology.
pub struct RepairEngine<'a, L> {
    topology: &'a mut Topology<L>,
    opts: RepairOptions,
    state: RepairState,
    passes: u32,
    actions: Vec<RepairAction>,
    lost: Vec<LostNode>,
}

impl<'a, L: Link> RepairEngine<'a, L> {
    pub fn new(topology: &'a mut Topology<L>, opts: RepairOptions) -> Self {
        Self {
            topology,
            opts,
            state: RepairState::Scanning,
            passes: 0,
            actions: Vec::new(),
            lost: Vec::new(),
        }
    }

    pub fn state(&self) -> RepairState {
        self.state
    }

    fn transition(&mut self, next: RepairState) {
        debug_assert!(
            self.state.can_become(next),
            "illegal repair transition {} -> {next}",
            self.state
        );
        debug!(from = %self.state, to = %next, pass = self.passes, "repair state");
        self.state = next;
    }

    /// Runs until the cluster is clean or the session gives up.
    pub async fn run(mut self) -> RepairOutcome {
        let deadline = Instant::now() + self.opts.timeout;
        let mut findings = Vec::new();

        loop {
            match self.state {
                RepairState::Scanning => {
                    findings = check(self.topology, self.opts.signature);
                    if findings.is_empty() {
                        self.transition(RepairState::Done);
                    } else {
                        info!(count = findings.len(), "found inconsistencies");
                        self.transition(RepairState::Repairing);
                    }
                }
                RepairState::Repairing => {
                    if self.passes >= self.opts.max_attempts || Instant::now() >= deadline {
                        warn!(passes = self.passes, "repair budget exhausted");
                        self.transition(RepairState::Unfixable);
                        continue;
                    }

                    self.passes += 1;
                    let applied = self.pass(&findings, deadline).await;

                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        warn!(passes = self.passes, "repair deadline reached");
                        self.transition(RepairState::Unfixable);
                        continue;
                    }
                    self.reload(left).await;

                    if applied > 0 {
                        self.transition(RepairState::Scanning);
                    } else if findings
                        .iter()
                        .all(|f| matches!(f, Finding::SignatureMismatch { .. }))
                    {
                        // views lag behind; give gossip a moment
                        let left = deadline.saturating_duration_since(Instant::now());
                        tokio::time::sleep(self.opts.settle.min(left)).await;
                        self.transition(RepairState::Scanning);
                    } else {
                        findings = check(self.topology, self.opts.signature);
                        if findings.is_empty() {
                            self.transition(RepairState::Scanning);
                        } else {
                            warn!(remaining = findings.len(), "repair pass made no progress");
                            self.transition(RepairState::Unfixable);
                        }
                    }
                }
                RepairState::Done | RepairState::Unfixable => break,
            }
        }

        let residual = if self.state == RepairState::Done {
            Vec::new()
        } else {
            findings
        };
        RepairOutcome {
            state: self.state,
            passes: self.passes,
            actions: self.actions,
            residual,
            lost: self.lost,
        }
    }

    /// Reloads every node; nodes that fail leave the topology and are
    /// recorded as lost.
    async fn reload(&mut self, per_node: Duration) {
        for node in self.topology.refresh(per_node).await {
            warn!(addr = %node.addr, id = %node.id, error = %node.error, "lost node during repair");
            self.lost.push(LostNode {
                addr: node.addr.clone(),
                id: node.id.clone(),
                error: node.error.to_string(),
            });
        }
    }

    /// One sequential pass over `findings`. Returns how many remediations
    /// changed the cluster.
    async fn pass(&mut self, findings: &[Finding], deadline: Instant) -> usize {
        let mut applied = 0;
        for finding in findings {
            let remedy = match tokio::time::timeout_at(deadline, self.remediate(finding)).await {
                Ok(Some(remedy)) => remedy,
                Ok(None) => continue,
                Err(_) => {
                    warn!(%finding, "repair deadline reached");
                    self.record(finding, Remedy::Failed("deadline reached".into()));
                    break;
                }
            };
            if matches!(remedy, Remedy::Applied(_)) {
                applied += 1;
            }
            self.record(finding, remedy);
        }
        applied
    }

    fn record(&mut self, finding: &Finding, remedy: Remedy) {
        match &remedy {
            Remedy::Applied(what) => info!(%finding, "{what}"),
            Remedy::Deferred(why) => warn!(%finding, "skipped: {why}"),
            Remedy::Failed(err) => warn!(%finding, "failed: {err}"),
        }
        self.actions.push(RepairAction {
            finding: finding.clone(),
            remedy,
        });
    }

    async fn remediate(&mut self, finding: &Finding) -> Option<Remedy> {
        let remedy = match finding {
            Finding::SlotUnassigned { slot } => self.assign_slot(*slot).await,
            Finding::SlotMultiplyAssigned { slot, owners } => self.settle_owner(*slot, owners).await,
            Finding::OpenSlot { slot, .. } => self.close_slot(*slot).await,
            Finding::DanglingReplica { node, target } => self.detach_replica(node, target),
            // converges once the other findings are dealt with
            Finding::SignatureMismatch { .. } => return None,
        };
        Some(remedy)
    }

    /// Gives an uncovered slot to the master with the fewest slots.
    async fn assign_slot(&mut self, slot: u16) -> Remedy {
        let claimant = self.topology.unreachable().iter().find(|u| {
            self.topology
                .seed_view_of(&u.id)
                .is_some_and(|view| view.owns(slot))
        });
        if let Some(claimant) = claimant {
            return Remedy::Deferred(format!(
                "unreachable node {} ({}) claims slot {slot}",
                claimant.id, claimant.addr
            ));
        }

        let Some(target) = self
            .topology
            .master_with_fewest_slots()
            .map(|m| m.id().to_string())
        else {
            return Remedy::Failed("no reachable master to take the slot".into());
        };
        let Some(node) = self.topology.get_mut(&target) else {
            return Remedy::Failed(format!("node {target} vanished"));
        };

        node.add_slots([slot]);
        match node.flush().await {
            Ok(()) => Remedy::Applied(format!("assigned slot {slot} to {target}")),
            Err(e) => {
                node.discard_pending();
                Remedy::Failed(format!("{target}: {e}"))
            }
        }
    }

    /// Picks the owner most views agree on and makes the others let go.
    async fn settle_owner(&mut self, slot: u16, owners: &[String]) -> Remedy {
        let Some(winner) = self.majority_owner(slot, owners) else {
            return Remedy::Deferred("no owner candidates".into());
        };

        let mut released = Vec::new();
        let mut deferred = Vec::new();
        let mut failed = Vec::new();

        for loser in owners.iter().filter(|o| **o != winner) {
            let Some(node) = self.topology.get_mut(loser) else {
                deferred.push(format!("{loser} is unreachable"));
                continue;
            };
            match node.count_keys_in_slot(slot).await {
                Err(e) => failed.push(format!("{loser}: {e}")),
                Ok(keys) if keys > 0 => {
                    deferred.push(format!("{loser} still holds {keys} keys in slot {slot}"))
                }
                Ok(_) => {
                    let result: Result<(), ConnectionError> = async {
                        node.del_slot(slot).await?;
                        node.set_slot_node(slot, &winner).await
                    }
                    .await;
                    match result {
                        Ok(()) => {
                            node.info_mut().slots.remove(&slot);
                            released.push(loser.as_str());
                        }
                        Err(e) => failed.push(format!("{loser}: {e}")),
                    }
                }
            }
        }

        if !released.is_empty() {
            if let Some(node) = self.topology.get_mut(&winner) {
                if let Err(e) = node.bump_epoch().await {
                    warn!(%winner, error = %e, "BUMPEPOCH failed");
                }
            }
        }

        if !failed.is_empty() {
            Remedy::Failed(failed.join("; "))
        } else if released.is_empty() {
            Remedy::Deferred(deferred.join("; "))
        } else {
            let mut what = format!("slot {slot} kept by {winner}, released by {}", released.join(", "));
            if !deferred.is_empty() {
                what.push_str(&format!(" ({})", deferred.join("; ")));
            }
            Remedy::Applied(what)
        }
    }

    /// Counts how many views (own reports and peer lines alike) credit each
    /// owner with `slot`. Ties go to the numerically smallest id.
    fn majority_owner(&self, slot: u16, owners: &[String]) -> Option<String> {
        let mut votes: BTreeMap<&str, usize> = owners.iter().map(|o| (o.as_str(), 0)).collect();
        for node in self.topology.nodes() {
            for entry in node.view() {
                if entry.owns(slot) {
                    if let Some(count) = votes.get_mut(entry.id.as_str()) {
                        *count += 1;
                    }
                }
            }
        }
        debug!(slot, ?votes, "ownership votes");

        votes
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| numeric_id_order(b.0, a.0)))
            .map(|(id, _)| id.to_string())
    }

    /// Finishes a migration whose source is already empty.
    async fn close_slot(&mut self, slot: u16) -> Remedy {
        let Some((source, dest)) = self.migration_endpoints(slot) else {
            return Remedy::Deferred(format!("can't tell where slot {slot} is moving"));
        };
        if self.topology.get(&source).is_none() || self.topology.get(&dest).is_none() {
            return Remedy::Deferred(format!(
                "migration {source} -> {dest} involves an unreachable node"
            ));
        }

        let mut counts = [0u64; 2];
        for (count, id) in counts.iter_mut().zip([&source, &dest]) {
            let Some(node) = self.topology.get_mut(id) else {
                continue;
            };
            match node.count_keys_in_slot(slot).await {
                Ok(n) => *count = n,
                Err(e) => return Remedy::Failed(format!("{id}: {e}")),
            }
        }
        let [source_keys, dest_keys] = counts;
        if source_keys > 0 {
            return Remedy::Deferred(format!(
                "{source} still holds {source_keys} keys in slot {slot}; finish the migration first"
            ));
        }

        // destination first, then source, then every other master
        let mut order = vec![dest.clone(), source.clone()];
        order.extend(
            self.topology
                .masters()
                .map(|m| m.id().to_string())
                .filter(|id| *id != source && *id != dest),
        );
        for id in &order {
            let Some(node) = self.topology.get_mut(id) else {
                continue;
            };
            if let Err(e) = node.set_slot_node(slot, &dest).await {
                if *id == source || *id == dest {
                    return Remedy::Failed(format!("{id}: {e}"));
                }
                warn!(node = %id, slot, error = %e, "SETSLOT NODE failed");
            }
        }

        for node in self.topology.nodes_mut() {
            let is_dest = node.id() == dest;
            let info = node.info_mut();
            info.migrating.remove(&slot);
            info.importing.remove(&slot);
            if is_dest {
                info.slots.insert(slot, SlotStatus::Assigned);
            } else {
                info.slots.remove(&slot);
            }
        }

        Remedy::Applied(format!(
            "slot {slot} handed to {dest} ({dest_keys} keys), migration from {source} closed"
        ))
    }

    /// Source and destination of an open slot: from the migrating side if
    /// any node has one, otherwise from the importing side.
    fn migration_endpoints(&self, slot: u16) -> Option<(String, String)> {
        let nodes = self.topology.nodes();
        nodes
            .iter()
            .find_map(|n| {
                let to = n.info().migrating.get(&slot)?;
                Some((n.id().to_string(), to.clone()))
            })
            .or_else(|| {
                nodes.iter().find_map(|n| {
                    let from = n.info().importing.get(&slot)?;
                    Some((from.clone(), n.id().to_string()))
                })
            })
    }

    fn detach_replica(&mut self, node: &str, target: &str) -> Remedy {
        if self.topology.is_unreachable(target) {
            return Remedy::Deferred(format!(
                "master {target} of {node} is known but unreachable"
            ));
        }
        if let Some(handle) = self.topology.get_mut(node) {
            handle.detach();
        }
        Remedy::Deferred(format!(
            "{node} treated as a standalone master; attach it with CLUSTER REPLICATE"
        ))
    }
}

/// Orders hex node ids by numeric value.
fn numeric_id_order(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len()
        .cmp(&b.len())
        .then_with(|| a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()))
}
