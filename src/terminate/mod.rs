//! Graduated shutdown of a child process
//!
//! ```text
//!  close ──window_delay──▶ interrupt ──console_delay──▶ kill tree ──threads_delay──▶ done
//!    │                        │                            │
//!    └── exited? ─────────────┴── exited? ─────────────────┴── skip the rest
//! ```
//!
//! Phases that cannot be delivered (no window, no console) do not wait.

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::config::{StopMethods, StopPolicy};
use crate::error::ServiceError;

/// How often liveness is checked while waiting out a phase
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Handle to the process being stopped
pub trait ProcessControl: Send {
    fn pid(&self) -> u32;

    /// Exit code once the process is gone, `None` while it runs
    fn try_exit_code(&mut self) -> Option<i32>;

    /// Ask the process to close. Returns whether the request was delivered.
    fn request_close(&mut self) -> bool;

    /// Deliver a console interrupt. Returns whether it was delivered.
    fn interrupt(&mut self) -> bool;

    fn kill(&mut self) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
}

/// System-wide process enumeration
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ServiceError>;

    fn kill(&self, pid: u32) -> Result<(), ServiceError>;
}

/// All descendants of `root`, leaves first
pub fn descendants(entries: &[ProcessEntry], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries {
        if entry.pid != entry.ppid {
            children.entry(entry.ppid).or_default().push(entry.pid);
        }
    }

    // Breadth-first from the root, reversed so the deepest come first
    let mut order = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(child) {
                order.push(child);
                queue.insert(0, child);
            }
        }
    }
    order.reverse();
    order
}

/// Wait up to `timeout` for the process to exit
pub async fn wait_for_exit(process: &mut dyn ProcessControl, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if process.try_exit_code().is_some() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep((deadline - now).min(POLL_INTERVAL)).await;
    }
}

fn kill_tree(process: &dyn ProcessControl, table: &dyn ProcessTable) {
    let pid = process.pid();
    let entries = match table.snapshot() {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot enumerate processes below {}: {}", pid, e);
            return;
        }
    };
    for child in descendants(&entries, pid) {
        log::debug!("Killing descendant {} of {}", child, pid);
        if let Err(e) = table.kill(child) {
            log::debug!("Kill of descendant {} failed: {}", child, e);
        }
    }
}

/// Stop `process` following `policy`. Returns whether exit was confirmed.
///
/// Only the failure of the final forced kill is an error.
pub async fn terminate(
    process: &mut dyn ProcessControl,
    table: &dyn ProcessTable,
    policy: &StopPolicy,
) -> Result<bool, ServiceError> {
    let pid = process.pid();
    if process.try_exit_code().is_some() {
        return Ok(true);
    }

    if !policy.skip.contains(StopMethods::WINDOW) && process.request_close() {
        log::debug!("Sent close request to {}", pid);
        if wait_for_exit(process, policy.window_delay).await {
            return Ok(true);
        }
    }

    if !policy.skip.contains(StopMethods::CONSOLE) && process.interrupt() {
        log::debug!("Sent console interrupt to {}", pid);
        if wait_for_exit(process, policy.console_delay).await {
            return Ok(true);
        }
    }

    if policy.skip.contains(StopMethods::TERMINATE) {
        log::warn!("Process {} still running and forced termination is disabled", pid);
        return Ok(wait_for_exit(process, policy.threads_delay).await);
    }

    if policy.kill_tree {
        kill_tree(process, table);
    }
    if process.try_exit_code().is_none() {
        log::info!("Killing process {}", pid);
        if let Err(e) = process.kill() {
            if process.try_exit_code().is_none() {
                return Err(e);
            }
        }
    }

    let threads_delay = if policy.skip.contains(StopMethods::THREADS) {
        Duration::ZERO
    } else {
        policy.threads_delay
    };
    Ok(wait_for_exit(process, threads_delay).await)
}
