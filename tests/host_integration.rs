//! Host driver: OS controls and exit-policy events to a host outcome

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use svcwrap::config::{ExitAction, LaunchParameters};
use svcwrap::host::{drive, HostControl, HostOutcome};
use svcwrap::store::{ConfigStore, FileStore};
use svcwrap::supervisor::{HostState, Supervisor, SupervisorOptions};
use svcwrap::terminate::unix::ProcTable;
use tokio::sync::mpsc;

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

async fn run(supervisor: &Supervisor, controls: &mut mpsc::UnboundedReceiver<HostControl>) -> HostOutcome {
    tokio::time::timeout(Duration::from_secs(10), drive(supervisor, controls, || {}))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_stop_control() {
    let (_dir, supervisor) = supervisor(Some(shell("sleep 30")));
    let (tx, mut controls) = mpsc::unbounded_channel();
    tx.send(HostControl::Rotate).unwrap();
    tx.send(HostControl::Stop).unwrap();

    let outcome = run(&supervisor, &mut controls).await;
    assert_eq!(outcome, HostOutcome::Stopped { exit_code: None });
    assert_eq!(outcome.process_exit_code(), 0);
    assert_eq!(supervisor.status().state, HostState::Stopped);
}

#[tokio::test]
async fn test_closed_control_channel_stops() {
    let (_dir, supervisor) = supervisor(Some(shell("sleep 30")));
    let (tx, mut controls) = mpsc::unbounded_channel::<HostControl>();
    drop(tx);

    let outcome = run(&supervisor, &mut controls).await;
    assert_eq!(outcome, HostOutcome::Stopped { exit_code: None });
}

#[tokio::test]
async fn test_exit_policy_ends_host() {
    let mut params = shell("exit 5");
    params.exit.default = Some(ExitAction::Exit);
    let (_dir, supervisor) = supervisor(Some(params));
    let (_tx, mut controls) = mpsc::unbounded_channel();

    let outcome = run(&supervisor, &mut controls).await;
    assert_eq!(outcome, HostOutcome::Stopped { exit_code: Some(5) });
}

#[tokio::test]
async fn test_suicide_policy() {
    let mut params = shell("exit 6");
    params.exit.by_code.insert(6, ExitAction::Suicide);
    let (_dir, supervisor) = supervisor(Some(params));
    let (_tx, mut controls) = mpsc::unbounded_channel();

    let outcome = run(&supervisor, &mut controls).await;
    assert_eq!(outcome, HostOutcome::Suicide { exit_code: 6 });
    assert_eq!(outcome.process_exit_code(), 6);
    let status = supervisor.status();
    assert_eq!(status.state, HostState::Stopped);
    assert_eq!(status.pid, None);
}

#[tokio::test]
async fn test_missing_configuration_fails() {
    let (_dir, supervisor) = supervisor(None);
    let (_tx, mut controls) = mpsc::unbounded_channel();

    let outcome = run(&supervisor, &mut controls).await;
    assert!(matches!(outcome, HostOutcome::Failed(ref e) if e.is_not_found()), "{:?}", outcome);
    assert_eq!(outcome.process_exit_code(), 1);
}
