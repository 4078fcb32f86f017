//! Signal delivery and `/proc` enumeration

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};

use super::{ProcessEntry, ProcessTable};
use crate::error::ServiceError;

fn signal_error(operation: &str, pid: u32, errno: Errno) -> ServiceError {
    match errno {
        Errno::ESRCH => ServiceError::NotFound(format!("process {}", pid)),
        Errno::EPERM => ServiceError::AccessDenied(format!("{} {}", operation, pid)),
        e => ServiceError::native(operation, e as i32, e.desc()),
    }
}

fn pid_of(pid: u32) -> Result<Pid, ServiceError> {
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(Pid::from_raw)
        .ok_or_else(|| ServiceError::InvalidParameter(format!("pid {}", pid)))
}

/// Send `signal` to a single process
pub fn send(pid: u32, signal: Signal) -> Result<(), ServiceError> {
    kill(pid_of(pid)?, signal).map_err(|e| signal_error("kill", pid, e))
}

/// Send `signal` to the process group led by `pid`, or to `pid` alone if
/// it does not lead one
pub fn send_group(pid: u32, signal: Signal) -> Result<(), ServiceError> {
    let target = pid_of(pid)?;
    match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => {
            killpg(pgid, signal).map_err(|e| signal_error("killpg", pid, e))
        }
        _ => send(pid, signal),
    }
}

/// Cooperative close, SIGTERM
pub fn request_close(pid: u32) -> bool {
    send(pid, Signal::SIGTERM).is_ok()
}

/// Console interrupt, SIGINT to the group as a terminal would
pub fn interrupt(pid: u32) -> bool {
    send_group(pid, Signal::SIGINT).is_ok()
}

/// Process table read from `/proc`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcTable;

impl ProcessTable for ProcTable {
    #[cfg(target_os = "linux")]
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ServiceError> {
        let processes = procfs::process::all_processes()
            .map_err(|e| ServiceError::native("enumerate processes", -1, e.to_string()))?;
        Ok(processes
            .iter()
            .filter_map(|p| {
                Some(ProcessEntry {
                    pid: u32::try_from(p.stat.pid).ok()?,
                    ppid: u32::try_from(p.stat.ppid).ok()?,
                })
            })
            .collect())
    }

    #[cfg(not(target_os = "linux"))]
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ServiceError> {
        Err(ServiceError::native(
            "enumerate processes",
            Errno::ENOSYS as i32,
            "no process table on this platform",
        ))
    }

    fn kill(&self, pid: u32) -> Result<(), ServiceError> {
        send(pid, Signal::SIGKILL)
    }
}
