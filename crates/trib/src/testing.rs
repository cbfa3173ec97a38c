//! In-memory cluster for tests.
//!
//! [`FakeCluster`] implements [`Connector`] and answers the handful of
//! commands trib sends, keeping one shared truth about slot ownership that
//! every node's `CLUSTER NODES` table is rendered from. Every command is
//! logged per node so tests can assert on exactly what went over the wire.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use trib_protocol::Frame;

use crate::addr::NodeAddr;
use crate::connection::{Connector, Link};
use crate::error::ConnectionError;
use crate::node::ClusterNode;
use crate::slots::merge_ranges;

const HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub(crate) struct FakeNode {
    id: String,
    port: u16,
    master: Option<String>,
    slots: BTreeSet<u16>,
    migrating: BTreeMap<u16, String>,
    importing: BTreeMap<u16, String>,
    keys: BTreeMap<u16, u64>,
    view: Option<String>,
    forgotten: Vec<String>,
    epoch: u64,
    clustered: bool,
    shut_down: bool,
}

impl FakeNode {
    pub(crate) fn master(id: &str, port: u16) -> Self {
        FakeNode {
            id: id.to_string(),
            port,
            master: None,
            slots: BTreeSet::new(),
            migrating: BTreeMap::new(),
            importing: BTreeMap::new(),
            keys: BTreeMap::new(),
            view: None,
            forgotten: Vec::new(),
            epoch: 1,
            clustered: true,
            shut_down: false,
        }
    }

    pub(crate) fn replica(id: &str, port: u16, master: &str) -> Self {
        FakeNode {
            master: Some(master.to_string()),
            ..FakeNode::master(id, port)
        }
    }

    pub(crate) fn slots(mut self, range: RangeInclusive<u16>) -> Self {
        self.slots.extend(range);
        self
    }

    pub(crate) fn migrating(mut self, slot: u16, to: &str) -> Self {
        self.migrating.insert(slot, to.to_string());
        self
    }

    pub(crate) fn importing(mut self, slot: u16, from: &str) -> Self {
        self.importing.insert(slot, from.to_string());
        self
    }

    pub(crate) fn keys(mut self, slot: u16, count: u64) -> Self {
        self.keys.insert(slot, count);
        self
    }

    /// Replaces the node's rendered `CLUSTER NODES` table with `table`.
    pub(crate) fn view(mut self, table: &str) -> Self {
        self.view = Some(table.to_string());
        self
    }

    pub(crate) fn standalone(mut self) -> Self {
        self.clustered = false;
        self
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: Vec<FakeNode>,
    unreachable: BTreeSet<u16>,
    stalled: BTreeSet<u16>,
    log: Vec<(u16, String)>,
}

impl State {
    fn node(&self, port: u16) -> Option<&FakeNode> {
        self.nodes.iter().find(|n| n.port == port)
    }

    fn index(&self, port: u16) -> Option<usize> {
        self.nodes.iter().position(|n| n.port == port)
    }

    fn render(&self, me: &FakeNode) -> String {
        if let Some(view) = &me.view {
            return view.clone();
        }

        let mut out = String::new();
        for n in &self.nodes {
            if me.forgotten.contains(&n.id) {
                continue;
            }
            let mut flags = Vec::new();
            if n.id == me.id {
                flags.push("myself");
            }
            flags.push(if n.master.is_some() { "slave" } else { "master" });
            if n.shut_down {
                flags.push("fail");
            }

            let mut line = format!(
                "{} {HOST}:{}@{} {} {} 0 0 {} connected",
                n.id,
                n.port,
                u32::from(n.port) + 10000,
                flags.join(","),
                n.master.as_deref().unwrap_or("-"),
                n.epoch,
            );
            for range in merge_ranges(n.slots.iter().copied()) {
                line.push_str(&format!(" {range}"));
            }
            for (slot, to) in &n.migrating {
                line.push_str(&format!(" [{slot}->-{to}]"));
            }
            for (slot, from) in &n.importing {
                line.push_str(&format!(" [{slot}-<-{from}]"));
            }
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    fn dispatch(&mut self, port: u16, args: &[String]) -> Result<Frame, ConnectionError> {
        self.log.push((port, args.join(" ")));
        let idx = self.index(port).ok_or(ConnectionError::Disconnected)?;
        if self.nodes[idx].shut_down || self.unreachable.contains(&port) {
            return Err(ConnectionError::Disconnected);
        }

        let upper: Vec<String> = args.iter().map(|a| a.to_ascii_uppercase()).collect();
        let words: Vec<&str> = upper.iter().map(String::as_str).collect();
        let slot_arg = |i: usize| -> u16 { args.get(i).and_then(|s| s.parse().ok()).unwrap_or(u16::MAX) };

        let reply = match words.as_slice() {
            ["PING"] => simple("PONG"),
            ["INFO", ..] => {
                let enabled = u8::from(self.nodes[idx].clustered);
                bulk(&format!("# Cluster\r\ncluster_enabled:{enabled}\r\n"))
            }
            ["DBSIZE"] => Frame::Integer(self.nodes[idx].keys.values().sum::<u64>() as i64),
            ["SHUTDOWN", ..] => {
                self.nodes[idx].shut_down = true;
                return Err(ConnectionError::Disconnected);
            }
            ["CLUSTER", "NODES"] => bulk(&self.render(&self.nodes[idx])),
            ["CLUSTER", "ADDSLOTS", rest @ ..] => {
                let slots: Vec<u16> = (2..2 + rest.len()).map(slot_arg).collect();
                let busy = slots
                    .iter()
                    .copied()
                    .find(|s| self.nodes.iter().any(|n| n.slots.contains(s)));
                match busy {
                    Some(busy) => error(&format!("ERR Slot {busy} is already busy")),
                    None => {
                        self.nodes[idx].slots.extend(slots);
                        ok()
                    }
                }
            }
            ["CLUSTER", "DELSLOTS", _] => {
                let slot = slot_arg(2);
                if self.nodes[idx].slots.remove(&slot) {
                    ok()
                } else {
                    error(&format!("ERR Slot {slot} is already unassigned"))
                }
            }
            ["CLUSTER", "SETSLOT", _, "NODE", _] => {
                let slot = slot_arg(2);
                let target = &args[4];
                if !self.nodes.iter().any(|n| &n.id == target) {
                    return Ok(error(&format!("ERR I don't know about node {target}")));
                }
                let node = &mut self.nodes[idx];
                if &node.id == target {
                    node.slots.insert(slot);
                    node.importing.remove(&slot);
                } else {
                    node.slots.remove(&slot);
                    node.migrating.remove(&slot);
                }
                ok()
            }
            ["CLUSTER", "COUNTKEYSINSLOT", _] => {
                let slot = slot_arg(2);
                Frame::Integer(self.nodes[idx].keys.get(&slot).copied().unwrap_or(0) as i64)
            }
            ["CLUSTER", "REPLICATE", _] => {
                let target = &args[2];
                let known = self
                    .nodes
                    .iter()
                    .any(|n| &n.id == target && n.master.is_none());
                let node = &mut self.nodes[idx];
                if !known {
                    error(&format!("ERR Unknown node {target}"))
                } else if !node.slots.is_empty() {
                    error("ERR To set a master the node must be empty and without assigned slots.")
                } else {
                    node.master = Some(target.clone());
                    ok()
                }
            }
            ["CLUSTER", "FORGET", _] => {
                let target = &args[2];
                let node = &mut self.nodes[idx];
                if &node.id == target {
                    error("ERR I tried hard but I can't forget myself...")
                } else {
                    node.forgotten.push(target.clone());
                    ok()
                }
            }
            ["CLUSTER", "BUMPEPOCH"] => {
                let node = &mut self.nodes[idx];
                node.epoch += 1;
                simple(&format!("BUMPED {}", node.epoch))
            }
            _ => error(&format!("ERR unknown command '{}'", args.join(" "))),
        };
        Ok(reply)
    }
}

fn ok() -> Frame {
    simple("OK")
}

fn simple(s: &str) -> Frame {
    Frame::Simple(s.to_string())
}

fn error(s: &str) -> Frame {
    Frame::Error(s.to_string())
}

fn bulk(s: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn add(&self, node: FakeNode) {
        self.state().nodes.push(node);
    }

    pub(crate) fn addr(port: u16) -> NodeAddr {
        NodeAddr::new(HOST, port)
    }

    /// Refuses connections to `port` from now on; open links to it get
    /// `Disconnected`.
    pub(crate) fn unreachable(&self, port: u16) {
        self.state().unreachable.insert(port);
    }

    /// Commands sent to `port` from now on never get a reply.
    pub(crate) fn stall(&self, port: u16) {
        self.state().stalled.insert(port);
    }

    pub(crate) async fn handle(&self, port: u16) -> ClusterNode<FakeLink> {
        let addr = Self::addr(port);
        let link = self.connect(&addr).await.unwrap();
        ClusterNode::new(addr, link)
    }

    pub(crate) fn commands(&self) -> Vec<(u16, String)> {
        self.state().log.clone()
    }

    pub(crate) fn commands_to(&self, port: u16) -> Vec<String> {
        self.state()
            .log
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub(crate) fn clear_log(&self) {
        self.state().log.clear();
    }

    pub(crate) fn owners(&self, slot: u16) -> Vec<String> {
        self.state()
            .nodes
            .iter()
            .filter(|n| n.slots.contains(&slot))
            .map(|n| n.id.clone())
            .collect()
    }

    pub(crate) fn release_slot(&self, id: &str, slot: u16) {
        if let Some(n) = self.state().nodes.iter_mut().find(|n| n.id == id) {
            n.slots.remove(&slot);
        }
    }

    pub(crate) fn master_of(&self, id: &str) -> Option<String> {
        self.state()
            .nodes
            .iter()
            .find(|n| n.id == id)
            .and_then(|n| n.master.clone())
    }

    pub(crate) fn forgotten_by(&self, id: &str) -> Vec<String> {
        self.state()
            .nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.forgotten.clone())
            .unwrap_or_default()
    }

    pub(crate) fn is_shut_down(&self, id: &str) -> bool {
        self.state().nodes.iter().any(|n| n.id == id && n.shut_down)
    }

    pub(crate) fn open_slots(&self, id: &str) -> (Vec<u16>, Vec<u16>) {
        self.state()
            .nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| {
                (
                    n.migrating.keys().copied().collect(),
                    n.importing.keys().copied().collect(),
                )
            })
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub(crate) struct FakeLink {
    cluster: FakeCluster,
    port: u16,
}

impl Link for FakeLink {
    async fn call(&mut self, args: &[String]) -> Result<Frame, ConnectionError> {
        let stalled = self.cluster.state().stalled.contains(&self.port);
        if stalled {
            std::future::pending::<()>().await;
        }
        self.cluster.state().dispatch(self.port, args)
    }
}

impl Connector for FakeCluster {
    type Link = FakeLink;

    async fn connect(&self, addr: &NodeAddr) -> Result<FakeLink, ConnectionError> {
        let state = self.state();
        let reachable = !state.unreachable.contains(&addr.port)
            && state.node(addr.port).is_some_and(|n| !n.shut_down);
        if !reachable {
            return Err(ConnectionError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(FakeLink {
            cluster: self.clone(),
            port: addr.port,
        })
    }
}
