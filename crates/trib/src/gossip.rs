//! `CLUSTER NODES` parsing and config signatures.
//!
//! Each line of the table reads
//!
//! ```text
//! <id> <host:port@cport[,hostname]> <flags> <master|-> <ping_sent> <pong_recv> <epoch> <link> [slot ...]
//! ```
//!
//! and slot tokens are `N`, `N-M`, `[N->-id]` (migrating) or `[N-<-id]`
//! (importing). Parsing is total: short lines are skipped and bad numbers
//! read as zero.

use serde::{Deserialize, Serialize};

use crate::addr::NodeAddr;
use crate::node::{NodeFlag, NodeFlags, NodeInfo, SlotStatus};
use crate::slots::{format_ranges, merge_ranges, SLOT_COUNT};

/// Index of the first slot token on a line.
const SLOTS_FIELD: usize = 8;

/// Parses a whole table, one [`NodeInfo`] per usable line.
pub fn parse_table(text: &str) -> Vec<NodeInfo> {
    text.lines().filter_map(parse_line).collect()
}

/// Parses one line. Returns `None` for lines with fewer than four fields.
pub fn parse_line(line: &str) -> Option<NodeInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }

    let number = |idx: usize| -> u64 {
        fields
            .get(idx)
            .and_then(|f| f.parse().ok())
            .unwrap_or(0)
    };

    let flags = NodeFlags::parse(fields[2]);
    let addr = if flags.contains(NodeFlag::NoAddr) {
        None
    } else {
        fields[1].parse::<NodeAddr>().ok().filter(|a| a.port != 0)
    };

    let mut info = NodeInfo {
        id: fields[0].to_string(),
        addr,
        raw_addr: fields[1].to_string(),
        flags,
        replicate: match fields[3] {
            "-" => None,
            id => Some(id.to_string()),
        },
        ping_sent: number(4),
        pong_recv: number(5),
        config_epoch: number(6),
        link_state: fields.get(7).map(|s| s.to_string()).unwrap_or_default(),
        ..NodeInfo::default()
    };

    for token in fields.iter().skip(SLOTS_FIELD) {
        apply_slot_token(&mut info, token);
    }
    Some(info)
}

fn apply_slot_token(info: &mut NodeInfo, token: &str) {
    let bare = token.trim_start_matches('[').trim_end_matches(']');

    if let Some((slot, peer)) = bare.split_once("->-") {
        if let Some(slot) = parse_slot(slot) {
            info.migrating.insert(slot, peer.to_string());
        }
        return;
    }
    if let Some((slot, peer)) = bare.split_once("-<-") {
        if let Some(slot) = parse_slot(slot) {
            info.importing.insert(slot, peer.to_string());
        }
        return;
    }

    let (start, end) = match bare.split_once('-') {
        Some((a, b)) => (parse_slot(a), parse_slot(b)),
        None => (parse_slot(bare), parse_slot(bare)),
    };
    let (Some(start), Some(end)) = (start, end) else {
        return;
    };
    if start > end {
        return;
    }

    for slot in start..=end {
        info.slots.insert(slot, SlotStatus::Assigned);
    }
    info.slot_tokens.push(token.to_string());
}

fn parse_slot(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|&slot| slot < SLOT_COUNT)
}

/// How slot ownership is rendered inside a config signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SignatureMode {
    /// Tokens exactly as each node reported them.
    #[default]
    Raw,
    /// Slots re-merged into maximal ranges, so `0-1,2` and `0-2` agree.
    Canonical,
}

/// Builds the config signature of one node's view.
///
/// Every entry owning at least one slot contributes `id:tokens` with its
/// tokens sorted and comma-joined; the entries are sorted and joined with
/// `|`. Migrating and importing markers never take part.
pub fn signature<'a>(view: impl IntoIterator<Item = &'a NodeInfo>, mode: SignatureMode) -> String {
    let mut entries: Vec<String> = view
        .into_iter()
        .filter_map(|info| {
            let tokens = match mode {
                SignatureMode::Raw => {
                    let mut tokens = info.slot_tokens.clone();
                    tokens.sort();
                    tokens.join(",")
                }
                SignatureMode::Canonical => format_ranges(&merge_ranges(info.owned_slots())),
            };
            (!tokens.is_empty()).then(|| format!("{}:{tokens}", info.id))
        })
        .collect();
    entries.sort();
    entries.join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004,hostname4 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002,hostname2 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003,hostname3 master - 0 1426238318243 3 connected 10923-16383
6ec23923021cf3ffec47632106199cb7f496ce01 127.0.0.1:30005@31005,hostname5 slave 67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 0 1426238316232 5 connected
824fe116063bc5fcf9f4ffd895bc17aee7731ac3 127.0.0.1:30006@31006,hostname6 slave 292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 0 1426238317741 6 connected
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001,hostname1 myself,master - 0 0 1 connected 0-5460
";

    #[test]
    fn parses_reference_table() {
        let nodes = parse_table(TABLE);
        assert_eq!(nodes.len(), 6);

        let me = nodes.iter().find(|n| n.is_myself()).unwrap();
        assert_eq!(me.id, "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca");
        assert_eq!(me.addr, Some(NodeAddr::new("127.0.0.1", 30001)));
        assert_eq!(me.slot_count(), 5461);
        assert_eq!(me.config_epoch, 1);
        assert_eq!(me.link_state, "connected");

        let replica = &nodes[0];
        assert!(replica.flags.contains(NodeFlag::Slave));
        assert_eq!(
            replica.replicate.as_deref(),
            Some("e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca")
        );
        assert_eq!(replica.pong_recv, 1426238317239);

        let covered: usize = nodes.iter().map(NodeInfo::slot_count).sum();
        assert_eq!(covered, SLOT_COUNT as usize);
    }

    #[test]
    fn migration_markers() {
        let info = parse_line(
            "aaa 10.0.0.1:7000@17000 myself,master - 0 0 3 connected 0-200 [200->-bbb] [300-<-ccc]",
        )
        .unwrap();
        assert_eq!(info.slot_count(), 201);
        assert_eq!(info.migrating.get(&200).map(String::as_str), Some("bbb"));
        assert_eq!(info.importing.get(&300).map(String::as_str), Some("ccc"));
        assert!(!info.owns(300));
        assert_eq!(info.slot_tokens, ["0-200"]);
    }

    #[test]
    fn unbracketed_markers_accepted() {
        let info = parse_line("aaa h:1 master - 0 0 0 connected 7->-bbb").unwrap();
        assert_eq!(info.migrating.get(&7).map(String::as_str), Some("bbb"));
        assert!(info.slots.is_empty());
    }

    #[test]
    fn never_fails_on_garbage() {
        assert!(parse_line("").is_none());
        assert!(parse_line("too short").is_none());
        assert!(parse_line("a b c").is_none());

        let info = parse_line("abc nowhere master - x y z").unwrap();
        assert_eq!(info.id, "abc");
        assert_eq!(info.addr, None);
        assert_eq!(info.raw_addr, "nowhere");
        assert_eq!((info.ping_sent, info.pong_recv, info.config_epoch), (0, 0, 0));
        assert_eq!(info.link_state, "");

        let info = parse_line("abc h:1 master - 0 0 0 connected 99999 5-2 x-y 16383 -").unwrap();
        assert_eq!(info.owned_slots().collect::<Vec<_>>(), [16383]);
    }

    #[test]
    fn minimal_four_field_line() {
        let info = parse_line("abc :0@0 handshake,noaddr -").unwrap();
        assert!(info.flags.contains(NodeFlag::Handshake));
        assert_eq!(info.addr, None);
        assert_eq!(info.replicate, None);
    }

    #[test]
    fn signature_ignores_order() {
        let a = parse_table(
            "x h:1 myself,master - 0 0 1 connected 5 0-4\ny h:2 master - 0 0 2 connected 6-10\n",
        );
        let b = parse_table(
            "y h:2 master - 0 0 2 connected 6-10\nx h:1 master - 0 0 1 connected 0-4 5\n",
        );
        assert_eq!(
            signature(&a, SignatureMode::Raw),
            signature(&b, SignatureMode::Raw)
        );
        assert_eq!(signature(&a, SignatureMode::Raw), "x:0-4,5|y:6-10");
    }

    #[test]
    fn signature_skips_slotless_and_open_slots() {
        let view = parse_table(
            "x h:1 myself,master - 0 0 1 connected 0-9 [9->-y]\ny h:2 master - 0 0 2 connected [9-<-x]\nz h:3 slave x 0 0 1 connected\n",
        );
        assert_eq!(signature(&view, SignatureMode::Raw), "x:0-9");
    }

    #[test]
    fn canonical_signature_merges_ranges() {
        let split = parse_table("x h:1 master - 0 0 1 connected 0-4 5\n");
        let whole = parse_table("x h:1 master - 0 0 1 connected 0-5\n");
        assert_ne!(
            signature(&split, SignatureMode::Raw),
            signature(&whole, SignatureMode::Raw)
        );
        assert_eq!(
            signature(&split, SignatureMode::Canonical),
            signature(&whole, SignatureMode::Canonical)
        );
    }
}
