//! Termination escalation against real process trees

#![cfg(target_os = "linux")]

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use svcwrap::config::{LaunchParameters, StopPolicy};
use svcwrap::supervisor::{launch, ChildProcess};
use svcwrap::terminate::unix::ProcTable;
use svcwrap::terminate::{descendants, terminate, ProcessControl, ProcessTable};

fn quick_policy() -> StopPolicy {
    StopPolicy {
        console_delay: Duration::from_millis(200),
        window_delay: Duration::from_millis(200),
        threads_delay: Duration::from_secs(1),
        ..Default::default()
    }
}

async fn spawn(program: &str, arguments: &str) -> ChildProcess {
    let mut params = LaunchParameters::new(program);
    params.arguments = arguments.into();
    launch("terminate-test", &params, &Arc::new(AtomicU64::new(0)))
        .await
        .unwrap()
}

/// Gone or a zombie nobody reaped yet
fn is_dead(pid: u32) -> bool {
    match procfs::process::Process::new(pid as i32) {
        Ok(process) => process.stat.state == 'Z',
        Err(_) => true,
    }
}

async fn wait_for_descendants(root: u32, count: usize) -> Vec<u32> {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let found = descendants(&ProcTable.snapshot().unwrap(), root);
        if found.len() >= count || Instant::now() >= deadline {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

const STUBBORN_TREE: &str = r#"-c 'trap "" TERM INT; sleep 30 & sleep 30 & wait'"#;

#[tokio::test]
async fn test_polite_stop_is_enough() {
    let mut child = spawn("/bin/sleep", "30").await;
    let pid = child.pid();

    let mut policy = quick_policy();
    policy.window_delay = Duration::from_secs(5);
    let started = Instant::now();
    assert!(terminate(&mut child, &ProcTable, &policy).await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(is_dead(pid));
    assert_eq!(child.try_exit_code(), Some(128 + Signal::SIGTERM as i32));
}

#[tokio::test]
async fn test_stubborn_tree_is_killed() {
    let mut child = spawn("/bin/sh", STUBBORN_TREE).await;
    let pid = child.pid();
    let sleepers = wait_for_descendants(pid, 2).await;
    assert_eq!(sleepers.len(), 2, "{:?}", sleepers);

    assert!(terminate(&mut child, &ProcTable, &quick_policy()).await.unwrap());
    assert!(is_dead(pid));
    for sleeper in sleepers {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !is_dead(sleeper) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(is_dead(sleeper), "descendant {} survived", sleeper);
    }
}

#[tokio::test]
async fn test_without_tree_kill_descendants_survive() {
    let mut child = spawn("/bin/sh", STUBBORN_TREE).await;
    let pid = child.pid();
    let sleepers = wait_for_descendants(pid, 2).await;
    assert_eq!(sleepers.len(), 2, "{:?}", sleepers);

    let mut policy = quick_policy();
    policy.kill_tree = false;
    assert!(terminate(&mut child, &ProcTable, &policy).await.unwrap());
    assert!(is_dead(pid));

    for sleeper in sleepers {
        assert!(!is_dead(sleeper));
        let _ = kill(Pid::from_raw(sleeper as i32), Signal::SIGKILL);
    }
}
