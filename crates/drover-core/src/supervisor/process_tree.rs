//! Best-effort termination of a child and all of its descendants.
//!
//! Children are spawned in their own process group, so one group signal
//! reaches grandchildren that re-parented. On Linux a `/proc` walk also
//! picks up descendants that moved themselves into a different group.

use std::time::{Duration, Instant};

/// Counts reported by a tree kill, for logging only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillReport {
    /// Live processes found in the tree at the start of the sweep.
    pub found: usize,
    /// Processes that exited during the graceful grace period.
    pub terminated: usize,
    /// Survivors that had to be forcibly killed.
    pub killed: usize,
}

/// Terminate `pid` and every descendant, SIGTERM first, then SIGKILL for
/// anything still alive after `timeout`. Never returns an error: kill
/// failures are reflected in the report and the caller's completion path
/// proceeds regardless.
#[cfg(unix)]
pub fn kill_process_tree(pid: u32, timeout: Duration) -> KillReport {
    let mut targets = collect_descendants(pid);
    targets.insert(0, pid as i32);
    targets.retain(|p| is_alive(*p));

    let report_found = targets.len();
    if report_found == 0 {
        return KillReport::default();
    }

    // Graceful pass: the whole group, then each pid individually in case
    // a descendant changed its group.
    unsafe {
        libc::killpg(pid as i32, libc::SIGTERM);
        for p in &targets {
            libc::kill(*p, libc::SIGTERM);
        }
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        targets.retain(|p| is_alive(*p));
        if targets.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    targets.retain(|p| is_alive(*p));
    let survivors = targets.len();
    if survivors > 0 {
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
            for p in &targets {
                libc::kill(*p, libc::SIGKILL);
            }
        }
    }

    KillReport {
        found: report_found,
        terminated: report_found - survivors,
        killed: survivors,
    }
}

#[cfg(unix)]
fn is_alive(pid: i32) -> bool {
    if unsafe { libc::kill(pid, 0) } != 0 {
        return false;
    }
    // A zombie already exited; its parent will reap it. Counting it as
    // alive would stall the grace loop for the full timeout.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| !rest.trim_start().starts_with('Z'))
            .unwrap_or(true),
        // No procfs on this platform: the signal probe has to do.
        Err(_) => true,
    }
}

/// Walk `/proc` for the transitive children of `root`, plus any process
/// still in `root`'s process group (descendants orphaned after `root`
/// was reaped re-parent to init but keep the group id). Returns an empty
/// list on platforms without procfs; the group signal still covers the
/// common case there.
#[cfg(unix)]
fn collect_descendants(root: u32) -> Vec<i32> {
    use std::collections::{HashMap, HashSet};

    let root = root as i32;
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    let mut group_members: Vec<i32> = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // Fields after the comm's closing paren: state, ppid, pgrp, ...
        // (the comm field may itself contain spaces).
        let Some(rest) = stat.rsplit(')').next() else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let ppid: Option<i32> = fields.nth(1).and_then(|s| s.parse().ok());
        let pgrp: Option<i32> = fields.next().and_then(|s| s.parse().ok());
        if let Some(ppid) = ppid {
            children.entry(ppid).or_default().push(pid);
        }
        if pgrp == Some(root) && pid != root {
            group_members.push(pid);
        }
    }

    let mut out: HashSet<i32> = group_members.into_iter().collect();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                if out.insert(*kid) {
                    stack.push(*kid);
                }
            }
        }
    }
    let mut out: Vec<i32> = out.into_iter().collect();
    out.sort_unstable();
    out
}

/// Windows fallback: `taskkill /T /F` takes the whole tree down at once;
/// no graceful phase is available.
#[cfg(windows)]
pub fn kill_process_tree(pid: u32, _timeout: Duration) -> KillReport {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
    match status {
        Ok(out) if out.status.success() => KillReport {
            found: 1,
            terminated: 0,
            killed: 1,
        },
        _ => KillReport::default(),
    }
}
