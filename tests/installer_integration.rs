//! Installer round trips against a unit directory in a temp dir

#![cfg(target_os = "linux")]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use svcwrap::config::{ExitAction, ServiceConfiguration, StartType};
use svcwrap::error::ServiceError;
use svcwrap::installer::ServiceInstaller;
use svcwrap::scm::systemd::{UnitControl, UnitFileBackend, UnitStatus};
use svcwrap::scm::{ScmClient, ServiceState};
use svcwrap::store::{ConfigStore, FileStore};

const HOST_BINARY: &str = "/usr/bin/svcwrap";

/// systemd stand-in that records calls and tracks which units are active
#[derive(Default, Clone)]
struct FakeSystemd {
    active: Arc<Mutex<HashMap<String, bool>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeSystemd {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn set_active(&self, unit: &str, active: bool) {
        self.active.lock().unwrap().insert(unit.to_string(), active);
    }
}

impl UnitControl for FakeSystemd {
    fn reload(&self) -> Result<(), ServiceError> {
        self.record("reload".into());
        Ok(())
    }

    fn start(&self, unit: &str) -> Result<(), ServiceError> {
        self.record(format!("start {}", unit));
        self.set_active(unit, true);
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<(), ServiceError> {
        self.record(format!("stop {}", unit));
        self.set_active(unit, false);
        Ok(())
    }

    fn kill(&self, unit: &str, signal: i32) -> Result<(), ServiceError> {
        self.record(format!("kill {} {}", unit, signal));
        Ok(())
    }

    fn status(&self, unit: &str) -> Result<UnitStatus, ServiceError> {
        let active = self.active.lock().unwrap().get(unit).copied().unwrap_or(false);
        Ok(UnitStatus {
            active_state: if active { "active" } else { "inactive" }.into(),
            sub_state: if active { "running" } else { "dead" }.into(),
            main_pid: if active { 4242 } else { 0 },
            exit_status: 0,
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    unit_dir: std::path::PathBuf,
    backend: Arc<UnitFileBackend<FakeSystemd>>,
    systemd: FakeSystemd,
    store: Arc<FileStore>,
    installer: ServiceInstaller,
}

fn fixture_with_store(store_root: Option<&Path>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let unit_dir = dir.path().join("units");
    std::fs::create_dir(&unit_dir).unwrap();
    let store_root = store_root
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dir.path().join("services"));

    let systemd = FakeSystemd::default();
    let backend = Arc::new(UnitFileBackend::new(&unit_dir, systemd.clone()));
    let store = Arc::new(FileStore::new(store_root));
    let installer = ServiceInstaller::new(
        ScmClient::new(backend.clone()),
        store.clone(),
        HOST_BINARY,
    )
    .with_timeout(Duration::from_secs(2));

    Fixture {
        _dir: dir,
        unit_dir,
        backend,
        systemd,
        store,
        installer,
    }
}

fn fixture() -> Fixture {
    fixture_with_store(None)
}

fn echoer() -> ServiceConfiguration {
    let mut config = ServiceConfiguration::new("echoer", "/bin/sh");
    config.metadata.description = "Echoes forever".into();
    config.parameters.arguments = "-c 'echo hi; sleep 1'".into();
    config.parameters.exit.by_code.insert(0, ExitAction::Exit);
    config
}

#[test]
fn test_install_round_trip() {
    let f = fixture();
    let report = f.installer.install_service(&echoer()).unwrap();
    assert!(!report.is_partial(), "{:?}", report);

    let unit = std::fs::read_to_string(f.unit_dir.join("echoer.service")).unwrap();
    assert!(unit.contains("ExecStart=/usr/bin/svcwrap --run-as-service echoer\n"), "{}", unit);
    assert!(f
        .unit_dir
        .join("multi-user.target.wants/echoer.service")
        .is_symlink());

    let stored = f.store.read("echoer").unwrap();
    assert_eq!(stored.parameters, echoer().parameters);

    let info = f.installer.service_info("echoer").unwrap();
    assert_eq!(info.config.metadata.description, "Echoes forever");
    assert_eq!(info.config.parameters.arguments, "-c 'echo hi; sleep 1'");
    assert_eq!(info.status.state, ServiceState::Stopped);

    assert!(f.installer.list_services().unwrap().contains("echoer"));
    assert!(f.systemd.calls().contains(&"reload".to_string()));
    assert_eq!(f.backend.open_handles(), 0);
}

#[test]
fn test_install_duplicate_leaves_existing() {
    let f = fixture();
    f.installer.install_service(&echoer()).unwrap();

    let mut other = echoer();
    other.parameters.arguments = "-c 'exit 1'".into();
    let err = f.installer.install_service(&other).unwrap_err();
    assert_eq!(err, ServiceError::AlreadyExists("echoer".into()));
    assert_eq!(f.installer.last_error(), Some(err));

    let stored = f.store.read_parameters("echoer").unwrap();
    assert_eq!(stored.arguments, "-c 'echo hi; sleep 1'");
    assert_eq!(f.backend.open_handles(), 0);
}

#[test]
fn test_install_rejects_missing_program() {
    let f = fixture();
    let config = ServiceConfiguration::new("ghost", "/nonexistent/program");
    let err = f.installer.install_service(&config).unwrap_err();
    assert!(matches!(err, ServiceError::InvalidConfiguration(_)), "{:?}", err);

    assert!(!f.unit_dir.join("ghost.service").exists());
    assert!(f.systemd.calls().is_empty());
    assert!(f.installer.last_error().is_some());
}

#[test]
fn test_install_rejects_names_systemd_refuses() {
    let f = fixture();
    for name in ["my svc", "a$b", "sp%ec", "plus+x"] {
        let config = ServiceConfiguration::new(name, "/bin/sh");
        let err = f.installer.install_service(&config).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParameter(_)), "{}: {:?}", name, err);
        assert!(!f.unit_dir.join(format!("{}.service", name)).exists());
        assert!(f.store.read(name).is_err());
    }
    assert!(f.installer.list_services().unwrap().is_empty());
    assert_eq!(f.backend.open_handles(), 0);
}

#[test]
fn test_install_rolls_back_when_store_fails() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "").unwrap();

    let f = fixture_with_store(Some(&blocker));
    assert!(f.installer.install_service(&echoer()).is_err());
    assert!(!f.unit_dir.join("echoer.service").exists());
    assert!(!f
        .unit_dir
        .join("multi-user.target.wants/echoer.service")
        .exists());
    assert_eq!(f.backend.open_handles(), 0);
}

#[test]
fn test_remove_nonexistent_is_ok() {
    let f = fixture();
    let report = f.installer.remove_service("ghost").unwrap();
    assert!(!report.is_partial());
    assert_eq!(f.installer.last_error(), None);
}

#[test]
fn test_remove_stops_running_service() {
    let f = fixture();
    f.installer.install_service(&echoer()).unwrap();
    let status = f
        .installer
        .start_service("echoer", Duration::from_secs(1))
        .unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.pid, Some(4242));

    let report = f.installer.remove_service("echoer").unwrap();
    assert!(!report.is_partial(), "{:?}", report);
    assert!(f.systemd.calls().contains(&"stop echoer.service".to_string()));
    assert!(!f.unit_dir.join("echoer.service").exists());
    assert!(f.store.read("echoer").unwrap_err().is_not_found());
    assert!(f.installer.list_services().unwrap().is_empty());
    assert_eq!(f.backend.open_handles(), 0);
}

#[test]
fn test_start_and_stop() {
    let f = fixture();
    f.installer.install_service(&echoer()).unwrap();

    let running = f.installer.start_service("echoer", Duration::from_secs(1)).unwrap();
    assert_eq!(running.state, ServiceState::Running);
    // Already running: no second start
    f.installer.start_service("echoer", Duration::from_secs(1)).unwrap();
    let starts = f
        .systemd
        .calls()
        .iter()
        .filter(|c| c.starts_with("start"))
        .count();
    assert_eq!(starts, 1);

    let stopped = f.installer.stop_service("echoer", Duration::from_secs(1)).unwrap();
    assert_eq!(stopped.state, ServiceState::Stopped);

    let err = f
        .installer
        .start_service("ghost", Duration::from_secs(1))
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_rotate_sends_hangup() {
    let f = fixture();
    f.installer.install_service(&echoer()).unwrap();
    f.installer.rotate_service("echoer").unwrap();
    assert!(f
        .systemd
        .calls()
        .contains(&format!("kill echoer.service {}", libc::SIGHUP)));
}

#[test]
fn test_update_in_place() {
    let f = fixture();
    f.installer.install_service(&echoer()).unwrap();

    let mut changed = echoer();
    changed.metadata.description = "Echoes less".into();
    changed.metadata.start_type = StartType::Demand;
    changed.parameters.arguments = "-c 'echo bye'".into();
    let report = f.installer.update_service("echoer", &changed).unwrap();
    assert!(!report.is_partial(), "{:?}", report);

    let info = f.installer.service_info("echoer").unwrap();
    assert_eq!(info.config.metadata.description, "Echoes less");
    assert_eq!(info.config.metadata.start_type, StartType::Demand);
    assert_eq!(info.config.parameters.arguments, "-c 'echo bye'");
    assert!(!f
        .unit_dir
        .join("multi-user.target.wants/echoer.service")
        .exists());
    assert_eq!(f.backend.open_handles(), 0);
}

#[test]
fn test_update_rename_replaces_entry() {
    let f = fixture();
    f.installer.install_service(&echoer()).unwrap();

    let mut renamed = echoer();
    renamed.name = "echoer2".into();
    renamed.metadata.display_name = "echoer2".into();
    f.installer.update_service("echoer", &renamed).unwrap();

    assert!(!f.unit_dir.join("echoer.service").exists());
    assert!(f.unit_dir.join("echoer2.service").exists());
    let names = f.installer.list_services().unwrap();
    assert!(names.contains("echoer2"));
    assert!(!names.contains("echoer"));
}

#[test]
fn test_update_rename_requires_existing() {
    let f = fixture();
    let err = f.installer.update_service("ghost", &echoer()).unwrap_err();
    assert!(err.is_not_found());
    assert!(!f.unit_dir.join("echoer.service").exists());
}
