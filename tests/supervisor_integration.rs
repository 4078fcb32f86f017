//! Supervisor lifecycle against real child processes

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use svcwrap::config::{ExitAction, LaunchParameters};
use svcwrap::error::ServiceError;
use svcwrap::store::{ConfigStore, FileStore};
use svcwrap::supervisor::{HostEvent, HostState, Supervisor, SupervisorOptions, SupervisorStatus};
use svcwrap::terminate::unix::ProcTable;

fn supervisor(params: Option<LaunchParameters>) -> (tempfile::TempDir, Supervisor) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    if let Some(params) = params {
        store.write_parameters("echoer", &params).unwrap();
    }
    let supervisor = Supervisor::new(
        "echoer",
        store,
        Arc::new(ProcTable),
        SupervisorOptions {
            monitor_interval: Duration::from_millis(20),
        },
    );
    (dir, supervisor)
}

fn shell(script: &str) -> LaunchParameters {
    let mut params = LaunchParameters::new("/bin/sh");
    params.arguments = shlex::try_join(["-c", script]).unwrap();
    params.throttle = Duration::ZERO;
    params
}

async fn wait_until<F>(supervisor: &Supervisor, timeout: Duration, done: F) -> SupervisorStatus
where
    F: Fn(&SupervisorStatus) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let status = supervisor.status();
        if done(&status) || Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn test_restarts_until_stopped() {
    let (_dir, supervisor) = supervisor(Some(shell("echo hi; sleep 0.1")));
    supervisor.on_activate().await.unwrap();

    let status = wait_until(&supervisor, Duration::from_secs(5), |s| s.restart_count >= 3).await;
    assert!(status.restart_count >= 3, "{:?}", status);
    assert!(status.start_count >= 4);

    let running = wait_until(&supervisor, Duration::from_secs(2), |s| s.pid.is_some()).await;
    supervisor.on_deactivate().await.unwrap();

    let status = supervisor.status();
    assert_eq!(status.state, HostState::Stopped);
    assert_eq!(status.pid, None);
    if let Some(pid) = running.pid {
        assert!(!is_alive(pid), "pid {} survived the stop", pid);
    }
}

#[tokio::test]
async fn test_no_policy_means_restart() {
    let (_dir, supervisor) = supervisor(Some(shell("exit 4")));
    supervisor.on_activate().await.unwrap();

    let status = wait_until(&supervisor, Duration::from_secs(5), |s| s.restart_count >= 1).await;
    assert!(status.restart_count >= 1, "{:?}", status);
    supervisor.on_deactivate().await.unwrap();
}

#[tokio::test]
async fn test_ignore_leaves_host_stopped() {
    let mut params = shell("exit 3");
    params.exit.default = Some(ExitAction::Ignore);
    let (_dir, supervisor) = supervisor(Some(params));
    supervisor.on_activate().await.unwrap();

    let status = wait_until(&supervisor, Duration::from_secs(5), |s| {
        s.state == HostState::Stopped && s.exit_code.is_some()
    })
    .await;
    assert_eq!(status.state, HostState::Stopped);
    assert_eq!(status.exit_code, Some(3));
    assert_eq!(status.restart_count, 0);

    // The monitor is gone, stopping is still fine
    supervisor.on_deactivate().await.unwrap();
}

#[tokio::test]
async fn test_exit_action_reports_event() {
    let mut params = shell("exit 0");
    params.exit.by_code.insert(0, ExitAction::Exit);
    params.exit.default = Some(ExitAction::Restart);
    let (_dir, supervisor) = supervisor(Some(params));
    let mut events = supervisor.take_events().unwrap();
    assert!(supervisor.take_events().is_none());

    supervisor.on_activate().await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap();
    assert_eq!(event, Some(HostEvent::Exit { exit_code: 0 }));
    assert_eq!(supervisor.status().restart_count, 0);
}

#[tokio::test]
async fn test_suicide_action_reports_event() {
    let mut params = shell("exit 9");
    params.exit.default = Some(ExitAction::Suicide);
    let (_dir, supervisor) = supervisor(Some(params));
    let mut events = supervisor.take_events().unwrap();

    supervisor.on_activate().await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap();
    assert_eq!(event, Some(HostEvent::Suicide { exit_code: 9 }));
}

#[tokio::test]
async fn test_stop_escalates_quickly_on_sigterm() {
    let mut params = LaunchParameters::new("/bin/sleep");
    params.arguments = "30".into();
    let (_dir, supervisor) = supervisor(Some(params));
    supervisor.on_activate().await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    let started = Instant::now();
    supervisor.on_deactivate().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_activate_twice_is_noop() {
    let mut params = LaunchParameters::new("/bin/sleep");
    params.arguments = "30".into();
    let (_dir, supervisor) = supervisor(Some(params));
    supervisor.on_activate().await.unwrap();
    supervisor.on_activate().await.unwrap();
    assert_eq!(supervisor.status().start_count, 1);
    supervisor.on_deactivate().await.unwrap();
}

#[tokio::test]
async fn test_deactivate_before_activate() {
    let (_dir, supervisor) = supervisor(Some(shell("sleep 30")));
    supervisor.on_deactivate().await.unwrap();
    assert_eq!(supervisor.status().state, HostState::Stopped);
}

#[tokio::test]
async fn test_missing_configuration() {
    let (_dir, supervisor) = supervisor(None);
    let err = supervisor.on_activate().await.unwrap_err();
    assert!(err.is_not_found(), "{:?}", err);

    let status = supervisor.status();
    assert_eq!(status.state, HostState::Stopped);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_missing_program() {
    let (_dir, supervisor) = supervisor(Some(LaunchParameters::new("/nonexistent/program")));
    let err = supervisor.on_activate().await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_) | ServiceError::Native { .. }), "{:?}", err);
    assert_eq!(supervisor.status().start_count, 0);
}
