//! Human-readable rendering of operation reports.
//!
//! Everything here returns a `String` so the binary decides where it goes;
//! colors come from `colored` and disappear when output isn't a terminal.

use std::fmt::Write as _;

use colored::Colorize;

use crate::check::Finding;
use crate::format::{format_reply, sanitize};
use crate::ops::{CallReport, CheckReport, DelNodeReport, FixReport, InfoReport};
use crate::repair::{Remedy, RepairState};
use crate::slots::{format_ranges, merge_ranges, SLOT_COUNT};

fn ok(out: &mut String, msg: impl std::fmt::Display) {
    let _ = writeln!(out, "{} {msg}", "[OK]".green());
}

fn warn(out: &mut String, msg: impl std::fmt::Display) {
    let _ = writeln!(out, "{} {msg}", "[WARN]".yellow());
}

fn err(out: &mut String, msg: impl std::fmt::Display) {
    let _ = writeln!(out, "{} {msg}", "[ERR]".red());
}

/// Renders the node summaries followed by one section per check.
pub fn render_check(report: &CheckReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}",
        format!(">>> Performing cluster check (using node {})", report.seed).bold()
    );
    for node in &report.nodes {
        let _ = writeln!(out, "{node}");
    }
    for u in &report.unreachable {
        warn(&mut out, format!("node {} ({}) is unreachable: {}", u.id, u.addr, u.error));
    }
    render_findings(&mut out, &report.findings, report.covered);
    out
}

fn render_findings(out: &mut String, findings: &[Finding], covered: usize) {
    let mut unassigned = Vec::new();
    let mut multiple = Vec::new();
    let mut open = Vec::new();
    let mut dangling = Vec::new();
    let mut mismatch = None;
    for finding in findings {
        match finding {
            Finding::SlotUnassigned { slot } => unassigned.push(*slot),
            Finding::SlotMultiplyAssigned { .. } => multiple.push(finding),
            Finding::OpenSlot { .. } => open.push(finding),
            Finding::DanglingReplica { .. } => dangling.push(finding),
            Finding::SignatureMismatch { .. } => mismatch = Some(finding),
        }
    }

    match mismatch {
        None => ok(out, "All nodes agree about slots configuration."),
        Some(finding) => err(out, finding),
    }

    let _ = writeln!(out, "{}", ">>> Check for open slots...".bold());
    for finding in open {
        warn(out, finding);
    }

    let _ = writeln!(out, "{}", ">>> Check slots coverage...".bold());
    if unassigned.is_empty() {
        ok(out, format!("All {SLOT_COUNT} slots covered."));
    } else {
        err(
            out,
            format!(
                "Not all {SLOT_COUNT} slots are covered by nodes ({covered} covered). Missing: {}",
                format_ranges(&merge_ranges(unassigned))
            ),
        );
    }
    for finding in multiple {
        err(out, finding);
    }

    if !dangling.is_empty() {
        let _ = writeln!(out, "{}", ">>> Check replicas...".bold());
        for finding in dangling {
            warn(out, finding);
        }
    }
}

/// Renders the initial check and what the repair session did.
pub fn render_fix(report: &FixReport) -> String {
    let mut out = render_check(&report.before);
    let outcome = &report.outcome;

    let _ = writeln!(out, "{}", ">>> Fixing cluster...".bold());
    for action in &outcome.actions {
        match &action.remedy {
            Remedy::Applied(what) => ok(&mut out, what),
            Remedy::Deferred(why) => warn(&mut out, format!("{}: {why}", action.finding)),
            Remedy::Failed(e) => err(&mut out, format!("{}: {e}", action.finding)),
        }
    }
    for lost in &outcome.lost {
        err(
            &mut out,
            format!("node {} ({}) stopped answering: {}", lost.id, lost.addr, lost.error),
        );
    }

    match outcome.state {
        RepairState::Done if outcome.needs_follow_up() => {
            let _ = writeln!(
                out,
                "{}",
                format!(
                    "cluster is consistent after {} pass(es), but some problems need an operator",
                    outcome.passes
                )
                .yellow()
            );
        }
        RepairState::Done => {
            let _ = writeln!(
                out,
                "{}",
                format!("cluster is consistent after {} pass(es)", outcome.passes).green()
            );
        }
        _ => {
            let _ = writeln!(
                out,
                "{}",
                format!(
                    "gave up after {} pass(es) with {} problem(s) left",
                    outcome.passes,
                    outcome.residual.len()
                )
                .red()
            );
        }
    }
    out
}

/// One line per master, then totals.
pub fn render_info(report: &InfoReport) -> String {
    let mut out = String::new();
    for m in &report.masters {
        let short: String = m.id.chars().take(8).collect();
        let keys = match &m.keys {
            Ok(n) => n.to_string(),
            Err(e) => format!("? ({e})").red().to_string(),
        };
        let _ = writeln!(
            out,
            "{} ({short}...) -> {keys} keys | {} slots | {} slaves.",
            m.addr, m.slots, m.replicas
        );
    }
    let _ = writeln!(
        out,
        "{}",
        format!(
            "[OK] {} keys in {} masters.",
            report.total_keys(),
            report.masters.len()
        )
        .green()
    );
    let _ = writeln!(out, "{:.2} keys per slot on average.", report.keys_per_slot());
    out
}

pub fn render_del_node(report: &DelNodeReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}",
        format!(">>> Removing node {} from cluster {}", report.id, report.addr).bold()
    );
    for (replica, master) in &report.reassigned {
        let _ = writeln!(out, ">>> {replica} as replica of {master}");
    }
    for (addr, e) in &report.forget_failures {
        warn(&mut out, format!("{addr} did not forget the node: {e}"));
    }
    let _ = writeln!(out, ">>> SHUTDOWN the node.");
    out
}

/// Each node's reply under its address, redis-cli style.
pub fn render_call(report: &CallReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}",
        format!(">>> Calling {}", sanitize(&report.command.join(" "))).bold()
    );
    for (addr, _, reply) in &report.replies {
        let body = match reply {
            Ok(frame) => format_reply(frame),
            Err(e) => format!("{} {e}", "(error)".red()),
        };
        let _ = writeln!(out, "{addr}: {body}");
    }
    for u in &report.unreachable {
        warn(&mut out, format!("{} ({}) was not reached: {}", u.addr, u.id, u.error));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::NodeAddr;
    use crate::error::ConnectionError;
    use crate::ops::{MasterSummary, Unreachable};
    use crate::repair::{LostNode, RepairAction, RepairOutcome};
    use trib_protocol::Frame;

    fn plain() {
        colored::control::set_override(false);
    }

    fn addr(port: u16) -> NodeAddr {
        NodeAddr::new("127.0.0.1", port)
    }

    fn check_report(findings: Vec<Finding>, covered: usize) -> CheckReport {
        CheckReport {
            seed: addr(7000),
            nodes: vec!["M: a 127.0.0.1:7000\n   slots:0-16383 (16384 slots) myself,master".into()],
            unreachable: Vec::new(),
            findings,
            covered,
        }
    }

    #[test]
    fn clean_check() {
        plain();
        let out = render_check(&check_report(Vec::new(), 16384));
        assert!(out.starts_with(">>> Performing cluster check (using node 127.0.0.1:7000)\nM: a"));
        assert!(out.contains("[OK] All nodes agree about slots configuration."));
        assert!(out.contains("[OK] All 16384 slots covered."));
        assert!(!out.contains("[ERR]"));
    }

    #[test]
    fn missing_slots_grouped_into_ranges() {
        plain();
        let findings = [5000, 5001, 5002, 9000]
            .into_iter()
            .map(|slot| Finding::SlotUnassigned { slot })
            .collect();
        let out = render_check(&check_report(findings, 16380));
        assert!(out.contains(
            "[ERR] Not all 16384 slots are covered by nodes (16380 covered). Missing: 5000-5002,9000"
        ));
    }

    #[test]
    fn open_and_unreachable_are_warnings() {
        plain();
        let mut report = check_report(
            vec![Finding::OpenSlot {
                slot: 200,
                nodes: vec!["a".into(), "b".into()],
            }],
            16384,
        );
        report.unreachable.push(Unreachable {
            addr: addr(7001),
            id: "b".into(),
            error: "connection failed: refused".into(),
        });
        let out = render_check(&report);
        assert!(out.contains("[WARN] slot 200 is open (nodes: a, b)"));
        assert!(out.contains("[WARN] node b (127.0.0.1:7001) is unreachable"));
    }

    #[test]
    fn fix_lists_lost_nodes_and_follow_up() {
        plain();
        let report = FixReport {
            before: check_report(Vec::new(), 16384),
            outcome: RepairOutcome {
                state: RepairState::Done,
                passes: 2,
                actions: vec![RepairAction {
                    finding: Finding::DanglingReplica {
                        node: "r".into(),
                        target: "gone".into(),
                    },
                    remedy: Remedy::Deferred("attach it by hand".into()),
                }],
                residual: Vec::new(),
                lost: vec![LostNode {
                    addr: addr(7001),
                    id: "b".into(),
                    error: "server disconnected".into(),
                }],
            },
        };
        let out = render_fix(&report);
        assert!(out.contains("[WARN] node r replicates unknown master gone: attach it by hand"));
        assert!(out.contains("[ERR] node b (127.0.0.1:7001) stopped answering: server disconnected"));
        assert!(out.ends_with(
            "cluster is consistent after 2 pass(es), but some problems need an operator\n"
        ));
    }

    #[test]
    fn info_lines_and_totals() {
        plain();
        let report = InfoReport {
            masters: vec![
                MasterSummary {
                    addr: addr(7000),
                    id: "0123456789abcdef".into(),
                    keys: Ok(30),
                    slots: 8192,
                    replicas: 1,
                },
                MasterSummary {
                    addr: addr(7001),
                    id: "fedcba9876543210".into(),
                    keys: Err(ConnectionError::Disconnected),
                    slots: 8192,
                    replicas: 0,
                },
            ],
        };
        let out = render_info(&report);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            "127.0.0.1:7000 (01234567...) -> 30 keys | 8192 slots | 1 slaves."
        );
        assert!(lines[1].contains("? (server disconnected) keys"));
        assert_eq!(lines[2], "[OK] 30 keys in 2 masters.");
        assert_eq!(lines[3], "0.00 keys per slot on average.");
    }

    #[test]
    fn call_replies_per_node() {
        plain();
        let report = CallReport {
            command: vec!["DBSIZE".into()],
            replies: vec![
                (addr(7000), "a".into(), Ok(Frame::Integer(4))),
                (addr(7001), "b".into(), Err(ConnectionError::Timeout(std::time::Duration::from_secs(1)))),
            ],
            unreachable: Vec::new(),
        };
        let out = render_call(&report);
        assert_eq!(
            out,
            ">>> Calling DBSIZE\n127.0.0.1:7000: (integer) 4\n127.0.0.1:7001: (error) timed out after 1s\n"
        );
    }
}
