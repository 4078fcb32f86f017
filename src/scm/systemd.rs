//! systemd service database
//!
//! Service entries are unit files in a unit directory, enabled by a link in
//! `multi-user.target.wants/`. Runtime control (start, stop, status, reload)
//! goes through [`UnitControl`]; [`SystemdBus`] implements it against the
//! `org.freedesktop.systemd1` D-Bus API.
//!
//! Raw handles are entries in a table together with the rights they were
//! opened with, every operation checks the right it needs.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use nix::sys::signal::Signal;
use nix::unistd::AccessFlags;
use zbus::zvariant::OwnedObjectPath;

use super::unit::{self, UnitDefinition, DEFAULT_TARGET};
use super::{
    ConfigChange, ControlCode, ManagerAccess, NativeConfig, RawHandle, ScmBackend, ServiceAccess,
    ServiceSpec, ServiceState, ServiceStatus,
};
use crate::config::validate::validate_name;
use crate::error::{ServiceError, ERROR_INVALID_SERVICE_CONTROL};
use crate::store::file::write_atomic;

pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Runtime state of a unit as systemd reports it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitStatus {
    pub active_state: String,
    pub sub_state: String,
    pub main_pid: u32,
    pub exit_status: i32,
}

impl UnitStatus {
    pub fn to_service_status(&self) -> ServiceStatus {
        let state = match self.active_state.as_str() {
            "active" | "reloading" => ServiceState::Running,
            "activating" => ServiceState::StartPending,
            "deactivating" => ServiceState::StopPending,
            _ => ServiceState::Stopped,
        };
        ServiceStatus {
            state,
            pid: (self.main_pid != 0).then_some(self.main_pid),
            exit_code: (state == ServiceState::Stopped).then_some(self.exit_status),
        }
    }
}

/// Runtime control of units
pub trait UnitControl: Send + Sync {
    /// Re-read unit files (daemon-reload)
    fn reload(&self) -> Result<(), ServiceError>;
    fn start(&self, unit: &str) -> Result<(), ServiceError>;
    fn stop(&self, unit: &str) -> Result<(), ServiceError>;
    /// Signal the main process of `unit`
    fn kill(&self, unit: &str, signal: i32) -> Result<(), ServiceError>;
    fn status(&self, unit: &str) -> Result<UnitStatus, ServiceError>;
}

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Systemd1Manager {
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;
    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;
    fn kill_unit(&self, name: &str, whom: &str, signal: i32) -> zbus::Result<()>;
    fn load_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;
    fn reload(&self) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Unit",
    default_service = "org.freedesktop.systemd1"
)]
trait Systemd1Unit {
    #[zbus(property)]
    fn active_state(&self) -> zbus::Result<String>;
    #[zbus(property)]
    fn sub_state(&self) -> zbus::Result<String>;
}

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Service",
    default_service = "org.freedesktop.systemd1"
)]
trait Systemd1Service {
    #[zbus(property, name = "MainPID")]
    fn main_pid(&self) -> zbus::Result<u32>;
    #[zbus(property)]
    fn exec_main_status(&self) -> zbus::Result<i32>;
}

fn bus_error(operation: &str, unit: &str, err: zbus::Error) -> ServiceError {
    if let zbus::Error::MethodError(name, message, _) = &err {
        match name.as_str() {
            "org.freedesktop.systemd1.NoSuchUnit" | "org.freedesktop.systemd1.LoadFailed" => {
                return ServiceError::NotFound(unit.to_string());
            }
            "org.freedesktop.DBus.Error.AccessDenied"
            | "org.freedesktop.DBus.Error.InteractiveAuthorizationRequired" => {
                return ServiceError::AccessDenied(format!("{} {}", operation, unit));
            }
            _ => {
                return ServiceError::native(
                    operation,
                    -1,
                    format!("{}: {}", name.as_str(), message.clone().unwrap_or_default()),
                );
            }
        }
    }
    ServiceError::native(operation, -1, err.to_string())
}

/// [`UnitControl`] over the system bus
pub struct SystemdBus {
    connection: zbus::blocking::Connection,
}

impl SystemdBus {
    pub fn system() -> Result<Self, ServiceError> {
        let connection = zbus::blocking::Connection::system()
            .map_err(|e| bus_error("connect to system bus", "systemd", e))?;
        Ok(Self { connection })
    }

    fn manager(&self) -> Result<Systemd1ManagerProxyBlocking<'_>, ServiceError> {
        Systemd1ManagerProxyBlocking::new(&self.connection)
            .map_err(|e| bus_error("create manager proxy", "systemd", e))
    }
}

impl UnitControl for SystemdBus {
    fn reload(&self) -> Result<(), ServiceError> {
        self.manager()?
            .reload()
            .map_err(|e| bus_error("Reload", "systemd", e))
    }

    fn start(&self, unit: &str) -> Result<(), ServiceError> {
        self.manager()?
            .start_unit(unit, "replace")
            .map(|_| ())
            .map_err(|e| bus_error("StartUnit", unit, e))
    }

    fn stop(&self, unit: &str) -> Result<(), ServiceError> {
        self.manager()?
            .stop_unit(unit, "replace")
            .map(|_| ())
            .map_err(|e| bus_error("StopUnit", unit, e))
    }

    fn kill(&self, unit: &str, signal: i32) -> Result<(), ServiceError> {
        self.manager()?
            .kill_unit(unit, "main", signal)
            .map_err(|e| bus_error("KillUnit", unit, e))
    }

    fn status(&self, unit: &str) -> Result<UnitStatus, ServiceError> {
        let path = self
            .manager()?
            .load_unit(unit)
            .map_err(|e| bus_error("LoadUnit", unit, e))?;

        let unit_proxy = Systemd1UnitProxyBlocking::builder(&self.connection)
            .path(path.clone())
            .and_then(|b| b.build())
            .map_err(|e| bus_error("create unit proxy", unit, e))?;
        let service_proxy = Systemd1ServiceProxyBlocking::builder(&self.connection)
            .path(path)
            .and_then(|b| b.build())
            .map_err(|e| bus_error("create service proxy", unit, e))?;

        Ok(UnitStatus {
            active_state: unit_proxy
                .active_state()
                .map_err(|e| bus_error("ActiveState", unit, e))?,
            sub_state: unit_proxy
                .sub_state()
                .map_err(|e| bus_error("SubState", unit, e))?,
            main_pid: service_proxy.main_pid().unwrap_or(0),
            exit_status: service_proxy.exec_main_status().unwrap_or(0),
        })
    }
}

enum Entry {
    Manager(ManagerAccess),
    Service { name: String, access: ServiceAccess },
}

#[derive(Default)]
struct HandleTable {
    next: RawHandle,
    entries: HashMap<RawHandle, Entry>,
}

/// Unit-file service database
pub struct UnitFileBackend<C = SystemdBus> {
    unit_dir: PathBuf,
    control: C,
    handles: Mutex<HandleTable>,
}

impl<C: UnitControl> UnitFileBackend<C> {
    pub fn new(unit_dir: impl Into<PathBuf>, control: C) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            control,
            handles: Mutex::new(HandleTable::default()),
        }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Handles issued and not yet closed
    pub fn open_handles(&self) -> usize {
        self.handles.lock().map(|t| t.entries.len()).unwrap_or(0)
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HandleTable>, ServiceError> {
        self.handles
            .lock()
            .map_err(|_| ServiceError::native("handle table", -1, "lock poisoned"))
    }

    fn register(&self, entry: Entry) -> Result<RawHandle, ServiceError> {
        let mut table = self.table()?;
        table.next += 1;
        let raw = table.next;
        table.entries.insert(raw, entry);
        Ok(raw)
    }

    fn check_manager(&self, raw: RawHandle, needed: ManagerAccess) -> Result<(), ServiceError> {
        match self.table()?.entries.get(&raw) {
            Some(Entry::Manager(access)) if access.contains(needed) => Ok(()),
            Some(Entry::Manager(_)) => Err(ServiceError::AccessDenied(format!(
                "manager handle lacks {:?}",
                needed
            ))),
            _ => Err(ServiceError::InvalidParameter(format!(
                "{} is not a manager handle",
                raw
            ))),
        }
    }

    fn check_service(&self, raw: RawHandle, needed: ServiceAccess) -> Result<String, ServiceError> {
        match self.table()?.entries.get(&raw) {
            Some(Entry::Service { name, access }) if access.contains(needed) => Ok(name.clone()),
            Some(Entry::Service { name, .. }) => Err(ServiceError::AccessDenied(format!(
                "handle for {} lacks {:?}",
                name, needed
            ))),
            _ => Err(ServiceError::InvalidParameter(format!(
                "{} is not a service handle",
                raw
            ))),
        }
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(unit::unit_name(name))
    }

    fn wants_link(&self, name: &str) -> PathBuf {
        self.unit_dir
            .join(format!("{}.wants", DEFAULT_TARGET))
            .join(unit::unit_name(name))
    }

    fn load(&self, name: &str) -> Result<UnitDefinition, ServiceError> {
        let path = self.unit_path(name);
        let content = fs::read_to_string(&path)
            .map_err(|e| ServiceError::from_io("read unit file", name, &e))?;
        UnitDefinition::parse(name, &content)
    }

    fn save(&self, def: &UnitDefinition) -> Result<(), ServiceError> {
        write_atomic(&self.unit_path(&def.name), &def.render())
            .map_err(|e| ServiceError::from_io("write unit file", &def.name, &e))?;
        self.sync_wants_link(def)
    }

    /// Link or unlink the unit from the default target
    fn sync_wants_link(&self, def: &UnitDefinition) -> Result<(), ServiceError> {
        let link = self.wants_link(&def.name);
        if link.exists() || link.is_symlink() {
            fs::remove_file(&link)
                .map_err(|e| ServiceError::from_io("remove wants link", &def.name, &e))?;
        }
        if def.wanted() {
            if let Some(dir) = link.parent() {
                fs::create_dir_all(dir)
                    .map_err(|e| ServiceError::from_io("create wants directory", &def.name, &e))?;
            }
            std::os::unix::fs::symlink(self.unit_path(&def.name), &link)
                .map_err(|e| ServiceError::from_io("create wants link", &def.name, &e))?;
        }
        Ok(())
    }

    fn reload(&self, name: &str) {
        if let Err(e) = self.control.reload() {
            log::warn!("{}: daemon reload failed: {}", name, e);
        }
    }
}

impl<C: UnitControl> ScmBackend for UnitFileBackend<C> {
    fn open_manager(&self, access: ManagerAccess) -> Result<RawHandle, ServiceError> {
        if !self.unit_dir.is_dir() {
            return Err(ServiceError::native(
                "open service manager",
                libc::ENOENT,
                format!("unit directory {} does not exist", self.unit_dir.display()),
            ));
        }
        if access.contains(ManagerAccess::CREATE_SERVICE)
            && nix::unistd::access(&self.unit_dir, AccessFlags::W_OK).is_err()
        {
            return Err(ServiceError::AccessDenied(format!(
                "cannot write to {}",
                self.unit_dir.display()
            )));
        }
        self.register(Entry::Manager(access))
    }

    fn create_service(
        &self,
        manager: RawHandle,
        spec: &ServiceSpec,
        access: ServiceAccess,
    ) -> Result<RawHandle, ServiceError> {
        self.check_manager(manager, ManagerAccess::CREATE_SERVICE)?;
        validate_name(&spec.name).map_err(ServiceError::InvalidParameter)?;
        unit::check_unit_name(&spec.name)?;
        if !spec.image.program.is_absolute() {
            return Err(ServiceError::InvalidParameter(format!(
                "binary path {} is not absolute",
                spec.image.program.display()
            )));
        }

        let path = self.unit_path(&spec.name);
        if path.exists() {
            return Err(ServiceError::AlreadyExists(spec.name.clone()));
        }
        if spec.password.is_some() {
            log::debug!("{}: unit files carry no credentials, password not used", spec.name);
        }

        let def = UnitDefinition::from_spec(spec);
        self.save(&def)?;
        log::info!("Created {}", path.display());
        self.reload(&spec.name);

        self.register(Entry::Service {
            name: spec.name.clone(),
            access,
        })
    }

    fn open_service(
        &self,
        manager: RawHandle,
        name: &str,
        access: ServiceAccess,
    ) -> Result<RawHandle, ServiceError> {
        self.check_manager(manager, ManagerAccess::CONNECT)?;
        validate_name(name).map_err(ServiceError::InvalidParameter)?;
        unit::check_unit_name(name)?;
        if !self.unit_path(name).is_file() {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        self.register(Entry::Service {
            name: name.to_string(),
            access,
        })
    }

    fn delete_service(&self, service: RawHandle) -> Result<(), ServiceError> {
        let name = self.check_service(service, ServiceAccess::DELETE)?;
        let path = self.unit_path(&name);

        match fs::remove_file(self.wants_link(&name)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                log::warn!("{}: failed to remove wants link: {}", name, e);
            }
            _ => {}
        }
        fs::remove_file(&path).map_err(|e| ServiceError::from_io("delete unit file", &name, &e))?;
        log::info!("Removed {}", path.display());
        self.reload(&name);
        Ok(())
    }

    fn change_config(&self, service: RawHandle, change: &ConfigChange) -> Result<(), ServiceError> {
        let name = self.check_service(service, ServiceAccess::CHANGE_CONFIG)?;
        let mut def = self.load(&name)?;
        def.apply(change);
        self.save(&def)?;
        self.reload(&name);
        Ok(())
    }

    fn query_config(&self, service: RawHandle) -> Result<NativeConfig, ServiceError> {
        let name = self.check_service(service, ServiceAccess::QUERY_CONFIG)?;
        Ok(self.load(&name)?.to_native())
    }

    fn query_status(&self, service: RawHandle) -> Result<ServiceStatus, ServiceError> {
        let name = self.check_service(service, ServiceAccess::QUERY_STATUS)?;
        Ok(self.control.status(&unit::unit_name(&name))?.to_service_status())
    }

    fn start(&self, service: RawHandle, args: &[String]) -> Result<(), ServiceError> {
        let name = self.check_service(service, ServiceAccess::START)?;
        if !args.is_empty() {
            log::debug!("{}: start arguments are not supported by systemd, ignored", name);
        }
        self.control.start(&unit::unit_name(&name))
    }

    fn control(&self, service: RawHandle, code: ControlCode) -> Result<ServiceStatus, ServiceError> {
        let name = self.check_service(service, code.required_access())?;
        let unit = unit::unit_name(&name);
        match code {
            ControlCode::Stop | ControlCode::Shutdown => self.control.stop(&unit)?,
            ControlCode::Rotate => self.control.kill(&unit, Signal::SIGHUP as i32)?,
            ControlCode::Interrogate => {}
            ControlCode::Pause | ControlCode::Continue => {
                return Err(ServiceError::native(
                    "ControlService",
                    ERROR_INVALID_SERVICE_CONTROL,
                    format!("{} does not accept {:?}", name, code),
                ));
            }
        }
        Ok(self.control.status(&unit)?.to_service_status())
    }

    fn close(&self, handle: RawHandle) {
        if let Ok(mut table) = self.handles.lock() {
            table.entries.remove(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartType;
    use crate::scm::{ImagePath, ScmClient};
    use std::sync::Arc;

    #[derive(Default)]
    struct NoBus;

    impl UnitControl for NoBus {
        fn reload(&self) -> Result<(), ServiceError> {
            Ok(())
        }
        fn start(&self, _unit: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        fn stop(&self, _unit: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        fn kill(&self, _unit: &str, _signal: i32) -> Result<(), ServiceError> {
            Ok(())
        }
        fn status(&self, _unit: &str) -> Result<UnitStatus, ServiceError> {
            Ok(UnitStatus {
                active_state: "inactive".into(),
                sub_state: "dead".into(),
                ..Default::default()
            })
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<UnitFileBackend<NoBus>>, ScmClient) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(UnitFileBackend::new(dir.path(), NoBus));
        let client = ScmClient::new(backend.clone());
        (dir, backend, client)
    }

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec::new(name, ImagePath::reentry("/usr/bin/svcwrap", name))
    }

    #[test]
    fn test_handles_closed_on_drop() {
        let (_dir, backend, client) = setup();
        {
            let manager = client.open_manager(ManagerAccess::ALL_ACCESS).unwrap();
            let _service = manager
                .create_service(&spec("echoer"), ServiceAccess::QUERY_STATUS)
                .unwrap();
            assert_eq!(backend.open_handles(), 2);
        }
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_create_links_auto_start() {
        let (dir, _backend, client) = setup();
        let manager = client.open_manager(ManagerAccess::ALL_ACCESS).unwrap();
        manager
            .create_service(&spec("echoer"), ServiceAccess::ALL_ACCESS)
            .unwrap();
        assert!(dir.path().join("echoer.service").is_file());
        assert!(dir
            .path()
            .join("multi-user.target.wants/echoer.service")
            .is_symlink());
    }

    #[test]
    fn test_create_duplicate() {
        let (_dir, _backend, client) = setup();
        let manager = client.open_manager(ManagerAccess::ALL_ACCESS).unwrap();
        manager.create_service(&spec("echoer"), ServiceAccess::ALL_ACCESS).unwrap();
        let err = manager
            .create_service(&spec("echoer"), ServiceAccess::ALL_ACCESS)
            .err()
            .unwrap();
        assert_eq!(err, ServiceError::AlreadyExists("echoer".into()));
    }

    #[test]
    fn test_invalid_name() {
        let (_dir, backend, client) = setup();
        let manager = client.open_manager(ManagerAccess::ALL_ACCESS).unwrap();
        let err = manager
            .create_service(&spec("bad/name"), ServiceAccess::ALL_ACCESS)
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::InvalidParameter(_)));
        drop(manager);
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_access_mask_enforced() {
        let (_dir, _backend, client) = setup();
        let manager = client.open_manager(ManagerAccess::CONNECT).unwrap();
        let err = manager
            .create_service(&spec("echoer"), ServiceAccess::ALL_ACCESS)
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::AccessDenied(_)));

        let admin = client.open_manager(ManagerAccess::ALL_ACCESS).unwrap();
        admin.create_service(&spec("echoer"), ServiceAccess::ALL_ACCESS).unwrap();
        let service = manager
            .open_service("echoer", ServiceAccess::QUERY_STATUS)
            .unwrap();
        assert!(matches!(service.delete(), Err(ServiceError::AccessDenied(_))));
    }

    #[test]
    fn test_change_config_relinks() {
        let (dir, _backend, client) = setup();
        let manager = client.open_manager(ManagerAccess::ALL_ACCESS).unwrap();
        let service = manager
            .create_service(&spec("echoer"), ServiceAccess::ALL_ACCESS)
            .unwrap();
        service
            .change_config(&ConfigChange {
                start_type: Some(StartType::Demand),
                description: Some("changed".into()),
                ..Default::default()
            })
            .unwrap();

        let config = service.query_config().unwrap();
        assert_eq!(config.start_type, StartType::Demand);
        assert_eq!(config.description, "changed");
        assert!(!dir
            .path()
            .join("multi-user.target.wants/echoer.service")
            .exists());
    }

    #[test]
    fn test_delete_then_open_not_found() {
        let (dir, _backend, client) = setup();
        let manager = client.open_manager(ManagerAccess::ALL_ACCESS).unwrap();
        manager
            .create_service(&spec("echoer"), ServiceAccess::ALL_ACCESS)
            .unwrap()
            .delete()
            .unwrap();
        assert!(!dir.path().join("echoer.service").exists());
        let err = manager
            .open_service("echoer", ServiceAccess::ALL_ACCESS)
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_pause_not_accepted() {
        let (_dir, _backend, client) = setup();
        let manager = client.open_manager(ManagerAccess::ALL_ACCESS).unwrap();
        let service = manager
            .create_service(&spec("echoer"), ServiceAccess::ALL_ACCESS)
            .unwrap();
        let err = service.control(ControlCode::Pause).unwrap_err();
        assert_eq!(err.code(), ERROR_INVALID_SERVICE_CONTROL);
        assert_eq!(
            service.control(ControlCode::Interrogate).unwrap().state,
            ServiceState::Stopped
        );
    }

    #[test]
    fn test_unit_status_mapping() {
        let status = UnitStatus {
            active_state: "active".into(),
            sub_state: "running".into(),
            main_pid: 42,
            exit_status: 0,
        };
        let mapped = status.to_service_status();
        assert_eq!(mapped.state, ServiceState::Running);
        assert_eq!(mapped.pid, Some(42));
        assert_eq!(mapped.exit_code, None);

        let failed = UnitStatus {
            active_state: "failed".into(),
            exit_status: 3,
            ..Default::default()
        };
        assert_eq!(failed.to_service_status().exit_code, Some(3));
    }
}
