//! Process-ancestry collection for interception shims.
//!
//! A shim that intercepts an action in some arbitrary subprocess needs
//! to tell the daemon how far that process sits from the agent's shell.
//! This walks `/proc` parent links from the issuer upward and returns
//! the chain top-down, ready to attach to an [`Event`].
//!
//! [`Event`]: agentwarden_core::types::Event

use std::fs;

use agentwarden_core::types::{AncestryReport, ProcessHop};

/// Walks parent pids from `issuer_pid` up to `stop_pid` (the agent's
/// top-level shell) or init, whichever comes first. The returned chain
/// has the topmost process at index 0 and the issuer last. Unreadable
/// `/proc` entries truncate the walk; the report is then shorter, never
/// wrong about the hops it does contain.
pub fn collect(issuer_pid: u32, stop_pid: Option<u32>) -> AncestryReport {
    let mut upward = Vec::new();
    let mut pid = issuer_pid;
    loop {
        upward.push(ProcessHop {
            pid,
            program: read_comm(pid).unwrap_or_else(|| "<unknown>".to_string()),
        });
        if Some(pid) == stop_pid || pid <= 1 {
            break;
        }
        match read_ppid(pid) {
            Some(parent) if parent != pid => pid = parent,
            _ => break,
        }
    }
    upward.reverse();
    AncestryReport::new(upward)
}

fn read_ppid(pid: u32) -> Option<u32> {
    let path = format!("/proc/{pid}/status");
    let Ok(contents) = fs::read_to_string(path) else {
        return None;
    };
    contents
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|value| value.trim().parse::<u32>().ok())
}

fn read_comm(pid: u32) -> Option<String> {
    let path = format!("/proc/{pid}/comm");
    fs::read_to_string(path)
        .ok()
        .map(|name| name.trim_end().to_string())
}
