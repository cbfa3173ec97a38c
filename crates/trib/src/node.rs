//! Per-node state and the handle used to drive one node.
//!
//! [`NodeInfo`] is what one line of a `CLUSTER NODES` table says about a
//! node. [`ClusterNode`] wraps a live link together with the node's own
//! report, its gossip view of peers, and any local change that hasn't been
//! pushed to the node yet.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, warn};
use trib_protocol::Frame;

use crate::addr::NodeAddr;
use crate::connection::Link;
use crate::error::ConnectionError;
use crate::gossip;
use crate::slots::{format_ranges, merge_ranges};

/// A single flag from the flags column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeFlag {
    Myself,
    Master,
    Slave,
    /// Rendered as `fail?`: suspected down by the reporting node only.
    PFail,
    Fail,
    Handshake,
    NoAddr,
    NoFailover,
    NoFlags,
}

impl NodeFlag {
    /// Parses one flag token. Unknown tokens yield `None`.
    pub fn parse(token: &str) -> Option<Self> {
        let flag = match token {
            "myself" => NodeFlag::Myself,
            "master" => NodeFlag::Master,
            "slave" | "replica" => NodeFlag::Slave,
            "fail?" | "pfail" => NodeFlag::PFail,
            "fail" => NodeFlag::Fail,
            "handshake" => NodeFlag::Handshake,
            "noaddr" => NodeFlag::NoAddr,
            "nofailover" => NodeFlag::NoFailover,
            "noflags" => NodeFlag::NoFlags,
            _ => return None,
        };
        Some(flag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeFlag::Myself => "myself",
            NodeFlag::Master => "master",
            NodeFlag::Slave => "slave",
            NodeFlag::PFail => "fail?",
            NodeFlag::Fail => "fail",
            NodeFlag::Handshake => "handshake",
            NodeFlag::NoAddr => "noaddr",
            NodeFlag::NoFailover => "nofailover",
            NodeFlag::NoFlags => "noflags",
        }
    }
}

/// The set of flags a node carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFlags(BTreeSet<NodeFlag>);

impl NodeFlags {
    /// Parses a comma-separated flags field, skipping unknown flags.
    pub fn parse(field: &str) -> Self {
        NodeFlags(field.split(',').filter_map(NodeFlag::parse).collect())
    }

    pub fn contains(&self, flag: NodeFlag) -> bool {
        self.0.contains(&flag)
    }

    pub fn insert(&mut self, flag: NodeFlag) {
        self.0.insert(flag);
    }

    pub fn remove(&mut self, flag: NodeFlag) {
        self.0.remove(&flag);
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeFlag> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<NodeFlag> for NodeFlags {
    fn from_iter<I: IntoIterator<Item = NodeFlag>>(iter: I) -> Self {
        NodeFlags(iter.into_iter().collect())
    }
}

impl fmt::Display for NodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("noflags");
        }
        let names: Vec<&str> = self.iter().map(NodeFlag::as_str).collect();
        f.write_str(&names.join(","))
    }
}

/// Ownership state of one slot from this tool's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Unused,
    /// Claimed locally, not yet confirmed by the node.
    New,
    Assigned,
}

/// One node as described by a line of a `CLUSTER NODES` table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    pub id: String,
    /// Client address, when the line carried a usable one.
    pub addr: Option<NodeAddr>,
    /// The address field exactly as reported.
    pub raw_addr: String,
    pub flags: NodeFlags,
    /// Id of the master this node replicates, if any.
    pub replicate: Option<String>,
    pub ping_sent: u64,
    pub pong_recv: u64,
    pub config_epoch: u64,
    pub link_state: String,
    /// Slots the node owns or has been asked to claim. Absent means unused.
    pub slots: BTreeMap<u16, SlotStatus>,
    /// Finally-owned slot tokens as they appeared on the wire.
    pub slot_tokens: Vec<String>,
    /// Slot -> id of the node it is being migrated to.
    pub migrating: BTreeMap<u16, String>,
    /// Slot -> id of the node it is being imported from.
    pub importing: BTreeMap<u16, String>,
}

impl NodeInfo {
    pub fn is_myself(&self) -> bool {
        self.flags.contains(NodeFlag::Myself)
    }

    pub fn is_master(&self) -> bool {
        self.flags.contains(NodeFlag::Master)
    }

    /// Slots held as `New` or `Assigned`, ascending.
    pub fn owned_slots(&self) -> impl Iterator<Item = u16> + '_ {
        self.slots
            .iter()
            .filter(|(_, status)| **status != SlotStatus::Unused)
            .map(|(slot, _)| *slot)
    }

    pub fn owns(&self, slot: u16) -> bool {
        matches!(
            self.slots.get(&slot),
            Some(SlotStatus::New | SlotStatus::Assigned)
        )
    }

    pub fn slot_count(&self) -> usize {
        self.owned_slots().count()
    }
}

/// A local change waiting to be pushed by [`ClusterNode::flush`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChange {
    /// Make the node a replica of the given master.
    Replicate(String),
    /// Claim these slots, ascending.
    ClaimSlots(Vec<u16>),
}

/// A connected node and everything this tool knows about it.
pub struct ClusterNode<L> {
    link: L,
    addr: NodeAddr,
    info: NodeInfo,
    friends: Vec<NodeInfo>,
    replicas: Vec<String>,
    dirty: bool,
    pending_replicate: Option<String>,
    /// Set when a flush stopped partway; the next flush re-reads the
    /// node's own table before claiming anything.
    reconcile: bool,
    /// Set by [`ClusterNode::detach`]; reloads keep the node unattached.
    detached: bool,
}

impl<L> fmt::Debug for ClusterNode<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("addr", &self.addr)
            .field("id", &self.info.id)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl<L> ClusterNode<L> {
    /// Wraps a freshly opened link. State is empty until
    /// [`load_info`](Self::load_info) runs.
    pub fn new(addr: NodeAddr, link: L) -> Self {
        Self {
            link,
            info: NodeInfo {
                addr: Some(addr.clone()),
                raw_addr: addr.to_string(),
                ..NodeInfo::default()
            },
            addr,
            friends: Vec::new(),
            replicas: Vec::new(),
            dirty: false,
            pending_replicate: None,
            reconcile: false,
            detached: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// The address this handle connected to.
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub(crate) fn info_mut(&mut self) -> &mut NodeInfo {
        &mut self.info
    }

    /// Peer summaries from this node's last table.
    pub fn friends(&self) -> &[NodeInfo] {
        &self.friends
    }

    /// Ids of nodes replicating this one, set by topology resolution.
    pub fn replicas(&self) -> &[String] {
        &self.replicas
    }

    pub(crate) fn set_replicas(&mut self, replicas: Vec<String>) {
        self.replicas = replicas;
    }

    pub fn is_master(&self) -> bool {
        self.info.is_master()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The node's whole view: its own line followed by its peers.
    pub fn view(&self) -> impl Iterator<Item = &NodeInfo> + '_ {
        std::iter::once(&self.info).chain(self.friends.iter())
    }

    /// Merges the node's own (`myself`) line.
    ///
    /// The report replaces identity and ownership wholesale, except that
    /// slots still pending a claim stay `New` while the node is dirty.
    pub fn apply_self_report(&mut self, report: NodeInfo) {
        let pending: Vec<u16> = if self.dirty {
            self.info
                .slots
                .iter()
                .filter(|(_, s)| **s == SlotStatus::New)
                .map(|(slot, _)| *slot)
                .collect()
        } else {
            Vec::new()
        };

        self.info = report;
        for slot in pending {
            self.info.slots.entry(slot).or_insert(SlotStatus::New);
        }
        if let Some(target) = &self.pending_replicate {
            self.info.replicate = Some(target.clone());
        } else if self.detached {
            self.unattach();
        }
    }

    /// Adds a peer line to the gossip view.
    pub fn record_peer(&mut self, peer: NodeInfo) {
        self.friends.push(peer);
    }

    /// Marks slots as claimed locally. Already owned slots are untouched.
    pub fn add_slots(&mut self, slots: impl IntoIterator<Item = u16>) {
        for slot in slots {
            let status = self.info.slots.entry(slot).or_insert(SlotStatus::Unused);
            if *status == SlotStatus::Unused {
                *status = SlotStatus::New;
                self.dirty = true;
            }
        }
    }

    /// Records that this node should replicate `master_id`.
    pub fn set_replicate(&mut self, master_id: &str) {
        self.detached = false;
        self.info.replicate = Some(master_id.to_string());
        self.pending_replicate = Some(master_id.to_string());
        self.dirty = true;
    }

    /// Drops the replication target locally so the node is treated as an
    /// unattached master, across reloads too. Nothing is sent to the node.
    pub fn detach(&mut self) {
        self.detached = true;
        self.unattach();
    }

    fn unattach(&mut self) {
        self.info.replicate = None;
        self.info.flags.remove(NodeFlag::Slave);
        self.info.flags.insert(NodeFlag::Master);
    }

    /// Drops every unpushed claim and replicate request.
    pub fn discard_pending(&mut self) {
        self.info.slots.retain(|_, status| *status != SlotStatus::New);
        self.pending_replicate = None;
        self.dirty = false;
        self.reconcile = false;
    }

    /// What [`flush`](Self::flush) would send, derived from current state.
    pub fn pending_change(&self) -> Option<PendingChange> {
        if !self.dirty {
            return None;
        }
        if let Some(target) = &self.pending_replicate {
            return Some(PendingChange::Replicate(target.clone()));
        }
        let claims: Vec<u16> = self
            .info
            .slots
            .iter()
            .filter(|(_, s)| **s == SlotStatus::New)
            .map(|(slot, _)| *slot)
            .collect();
        (!claims.is_empty()).then_some(PendingChange::ClaimSlots(claims))
    }

    /// `M:`/`S:` summary used by the check report.
    pub fn info_string(&self) -> String {
        let role = if self.is_master() { "M" } else { "S" };
        let ranges = merge_ranges(self.info.owned_slots());
        let mut out = format!(
            "{role}: {} {}\n   slots:{} ({} slots) {}",
            self.info.id,
            self.addr,
            format_ranges(&ranges),
            self.info.slot_count(),
            self.info.flags,
        );
        match &self.info.replicate {
            Some(master) => out.push_str(&format!("\n   replicates {master}")),
            None if !self.replicas.is_empty() => out.push_str(&format!(
                "\n   {} additional replica(s)",
                self.replicas.len()
            )),
            None => {}
        }
        out
    }
}

impl<L: Link> ClusterNode<L> {
    /// Sends a command and returns the raw reply, error replies included.
    pub async fn call(&mut self, args: &[String]) -> Result<Frame, ConnectionError> {
        self.link.call(args).await
    }

    /// Sends a command; an error reply becomes [`ConnectionError::Reply`].
    pub async fn command(&mut self, args: &[&str]) -> Result<Frame, ConnectionError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        match self.link.call(&args).await? {
            Frame::Error(e) => Err(ConnectionError::Reply(e)),
            frame => Ok(frame),
        }
    }

    async fn expect_ok(&mut self, args: &[&str]) -> Result<(), ConnectionError> {
        match self.command(args).await? {
            Frame::Simple(_) => Ok(()),
            other => Err(ConnectionError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    async fn expect_integer(&mut self, args: &[&str]) -> Result<u64, ConnectionError> {
        let reply = self.command(args).await?;
        reply
            .as_integer()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| ConnectionError::UnexpectedReply(format!("{reply:?}")))
    }

    async fn expect_text(&mut self, args: &[&str]) -> Result<String, ConnectionError> {
        let reply = self.command(args).await?;
        reply
            .as_text()
            .ok_or_else(|| ConnectionError::UnexpectedReply(format!("{reply:?}")))
    }

    /// Checks `INFO cluster` reports `cluster_enabled:1`.
    pub async fn is_cluster_enabled(&mut self) -> Result<bool, ConnectionError> {
        let info = self.expect_text(&["INFO", "cluster"]).await?;
        Ok(info
            .lines()
            .any(|line| line.trim() == "cluster_enabled:1"))
    }

    /// Fetches the node's `CLUSTER NODES` table.
    pub async fn cluster_nodes(&mut self) -> Result<Vec<NodeInfo>, ConnectionError> {
        let text = self.expect_text(&["CLUSTER", "NODES"]).await?;
        Ok(gossip::parse_table(&text))
    }

    /// Reloads the node's own state, and its gossip view when
    /// `with_friends` is set.
    pub async fn load_info(&mut self, with_friends: bool) -> Result<(), ConnectionError> {
        let table = self.cluster_nodes().await?;
        if with_friends {
            self.friends.clear();
        }
        let mut saw_myself = false;
        for entry in table {
            if entry.is_myself() {
                saw_myself = true;
                self.apply_self_report(entry);
            } else if with_friends {
                self.record_peer(entry);
            }
        }
        if !saw_myself {
            return Err(ConnectionError::UnexpectedReply(
                "CLUSTER NODES has no myself entry".into(),
            ));
        }
        debug!(addr = %self.addr, id = %self.info.id, peers = self.friends.len(), "loaded node state");
        Ok(())
    }

    /// Pushes the pending change, if any.
    ///
    /// A pending replicate wins: `CLUSTER REPLICATE` is sent and slots are
    /// left alone. Otherwise every `New` slot is claimed with
    /// `CLUSTER ADDSLOTS`, ascending, stopping at the first failure. The
    /// node stays dirty until everything went through.
    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        if !self.dirty {
            return Ok(());
        }
        if self.reconcile {
            self.reconcile_claims().await?;
        }

        match self.pending_change() {
            None => {}
            Some(PendingChange::Replicate(target)) => {
                self.expect_ok(&["CLUSTER", "REPLICATE", &target]).await?;
                self.pending_replicate = None;
            }
            Some(PendingChange::ClaimSlots(slots)) => {
                for slot in slots {
                    let slot_arg = slot.to_string();
                    if let Err(e) = self.expect_ok(&["CLUSTER", "ADDSLOTS", &slot_arg]).await {
                        warn!(addr = %self.addr, slot, error = %e, "ADDSLOTS failed");
                        self.reconcile = true;
                        return Err(e);
                    }
                    self.info.slots.insert(slot, SlotStatus::Assigned);
                }
            }
        }

        self.dirty = false;
        Ok(())
    }

    /// Confirms `New` slots the live node already owns, so a retried flush
    /// doesn't claim them twice.
    async fn reconcile_claims(&mut self) -> Result<(), ConnectionError> {
        let table = self.cluster_nodes().await?;
        if let Some(live) = table.iter().find(|e| e.is_myself()) {
            for (slot, status) in self.info.slots.iter_mut() {
                if *status == SlotStatus::New && live.owns(*slot) {
                    *status = SlotStatus::Assigned;
                }
            }
        }
        self.reconcile = false;
        Ok(())
    }

    pub async fn forget(&mut self, id: &str) -> Result<(), ConnectionError> {
        self.expect_ok(&["CLUSTER", "FORGET", id]).await
    }

    pub async fn del_slot(&mut self, slot: u16) -> Result<(), ConnectionError> {
        self.expect_ok(&["CLUSTER", "DELSLOTS", &slot.to_string()]).await
    }

    pub async fn set_slot_node(&mut self, slot: u16, id: &str) -> Result<(), ConnectionError> {
        self.expect_ok(&["CLUSTER", "SETSLOT", &slot.to_string(), "NODE", id])
            .await
    }

    pub async fn count_keys_in_slot(&mut self, slot: u16) -> Result<u64, ConnectionError> {
        self.expect_integer(&["CLUSTER", "COUNTKEYSINSLOT", &slot.to_string()])
            .await
    }

    pub async fn bump_epoch(&mut self) -> Result<(), ConnectionError> {
        // replies BUMPED or STILL, both fine
        self.expect_ok(&["CLUSTER", "BUMPEPOCH"]).await
    }

    pub async fn dbsize(&mut self) -> Result<u64, ConnectionError> {
        self.expect_integer(&["DBSIZE"]).await
    }

    /// Asks the node to shut down. A dropped connection counts as success.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        match self.command(&["SHUTDOWN"]).await {
            Ok(_) | Err(ConnectionError::Disconnected) | Err(ConnectionError::Io(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
