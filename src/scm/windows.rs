//! Windows Service Control Manager
//!
//! `windows-service` already closes its handles on drop, so a raw handle
//! here is a key into a table owning the `ServiceManager` / `Service`
//! objects; closing removes the entry.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Mutex;

use windows_service::service::{
    ServiceAccess as WinServiceAccess, ServiceConfig, ServiceDependency,
    ServiceErrorControl, ServiceExitCode, ServiceInfo, ServiceStartType,
    ServiceState as WinServiceState, ServiceType as WinServiceType, UserEventCode,
};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};
use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ};
use winreg::RegKey;

use super::{
    ConfigChange, ControlCode, ErrorControl, ImagePath, ManagerAccess, NativeConfig, RawHandle,
    ScmBackend, ServiceAccess, ServiceSpec, ServiceState, ServiceStatus,
};
use crate::config::{Account, StartType};
use crate::error::{
    ServiceError, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, ERROR_INVALID_SERVICE_CONTROL,
    ERROR_SERVICE_DOES_NOT_EXIST,
    ERROR_SERVICE_EXISTS, ERROR_SERVICE_MARKED_FOR_DELETE,
};

const ERROR_INVALID_NAME: i32 = 123;
const ERROR_INVALID_SERVICE_ACCOUNT: i32 = 1057;

fn win_error(operation: &str, subject: &str, err: windows_service::Error) -> ServiceError {
    let code = match &err {
        windows_service::Error::Winapi(io) => io.raw_os_error(),
        _ => None,
    };
    match code {
        Some(ERROR_SERVICE_EXISTS) => ServiceError::AlreadyExists(subject.to_string()),
        Some(ERROR_SERVICE_DOES_NOT_EXIST) => ServiceError::NotFound(subject.to_string()),
        Some(ERROR_ACCESS_DENIED) => ServiceError::AccessDenied(format!("{} {}", operation, subject)),
        Some(ERROR_SERVICE_MARKED_FOR_DELETE) => {
            ServiceError::MarkedForDeletion(subject.to_string())
        }
        Some(ERROR_INVALID_NAME | ERROR_INVALID_PARAMETER | ERROR_INVALID_SERVICE_ACCOUNT) => {
            ServiceError::InvalidParameter(format!("{} {}: {}", operation, subject, err))
        }
        Some(code) => ServiceError::native(operation, code, err.to_string()),
        None => ServiceError::native(operation, -1, err.to_string()),
    }
}

fn start_type(t: StartType) -> ServiceStartType {
    match t {
        StartType::Auto | StartType::DelayedAuto => ServiceStartType::AutoStart,
        StartType::Demand => ServiceStartType::OnDemand,
        StartType::Disabled => ServiceStartType::Disabled,
    }
}

fn error_control(e: ErrorControl) -> ServiceErrorControl {
    match e {
        ErrorControl::Ignore => ServiceErrorControl::Ignore,
        ErrorControl::Normal => ServiceErrorControl::Normal,
        ErrorControl::Severe => ServiceErrorControl::Severe,
        ErrorControl::Critical => ServiceErrorControl::Critical,
    }
}

fn account_name(account: &Account) -> Option<OsString> {
    match account {
        Account::LocalSystem => None,
        Account::User(name) if name.contains('\\') || name.contains('@') => Some(name.into()),
        Account::User(name) => Some(format!(r".\{}", name).into()),
    }
}

fn dependencies(deps: &[String]) -> Vec<ServiceDependency> {
    deps.iter()
        .map(|d| match d.strip_prefix('+') {
            Some(group) => ServiceDependency::Group(group.into()),
            None => ServiceDependency::Service(d.into()),
        })
        .collect()
}

fn dependency_names(deps: &[ServiceDependency]) -> Vec<String> {
    deps.iter()
        .map(|d| match d {
            ServiceDependency::Group(g) => format!("+{}", g.to_string_lossy()),
            ServiceDependency::Service(s) => s.to_string_lossy().into_owned(),
        })
        .collect()
}

fn status(win: windows_service::service::ServiceStatus) -> ServiceStatus {
    let state = match win.current_state {
        WinServiceState::Stopped => ServiceState::Stopped,
        WinServiceState::StartPending => ServiceState::StartPending,
        WinServiceState::StopPending => ServiceState::StopPending,
        WinServiceState::Running => ServiceState::Running,
        WinServiceState::ContinuePending => ServiceState::ContinuePending,
        WinServiceState::PausePending => ServiceState::PausePending,
        WinServiceState::Paused => ServiceState::Paused,
    };
    let exit_code = match win.exit_code {
        ServiceExitCode::Win32(code) | ServiceExitCode::ServiceSpecific(code) => code as i32,
    };
    ServiceStatus {
        state,
        pid: win.process_id,
        exit_code: (state == ServiceState::Stopped).then_some(exit_code),
    }
}

fn service_key(name: &str) -> std::io::Result<RegKey> {
    RegKey::predef(HKEY_LOCAL_MACHINE)
        .open_subkey_with_flags(format!(r"SYSTEM\CurrentControlSet\Services\{}", name), KEY_READ)
}

fn description(name: &str) -> String {
    service_key(name)
        .and_then(|key| key.get_value::<String, _>("Description"))
        .unwrap_or_default()
}

/// The SCM keeps the delayed flag as a DWORD next to `Start`
fn delayed_auto_start(name: &str) -> bool {
    service_key(name)
        .and_then(|key| key.get_value::<u32, _>("DelayedAutostart"))
        .map(|v| v != 0)
        .unwrap_or(false)
}

enum Entry {
    Manager(ServiceManager),
    Service {
        name: String,
        service: windows_service::service::Service,
    },
}

#[derive(Default)]
struct HandleTable {
    next: RawHandle,
    entries: HashMap<RawHandle, Entry>,
}

/// The local Service Control Manager
#[derive(Default)]
pub struct WindowsScm {
    handles: Mutex<HandleTable>,
}

impl WindowsScm {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, entry: Entry) -> Result<RawHandle, ServiceError> {
        let mut table = self
            .handles
            .lock()
            .map_err(|_| ServiceError::native("handle table", -1, "lock poisoned"))?;
        table.next += 1;
        let raw = table.next;
        table.entries.insert(raw, entry);
        Ok(raw)
    }

    fn with_manager<T>(
        &self,
        raw: RawHandle,
        f: impl FnOnce(&ServiceManager) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let table = self
            .handles
            .lock()
            .map_err(|_| ServiceError::native("handle table", -1, "lock poisoned"))?;
        match table.entries.get(&raw) {
            Some(Entry::Manager(manager)) => f(manager),
            _ => Err(ServiceError::InvalidParameter(format!("{} is not a manager handle", raw))),
        }
    }

    fn with_service<T>(
        &self,
        raw: RawHandle,
        f: impl FnOnce(&str, &windows_service::service::Service) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let table = self
            .handles
            .lock()
            .map_err(|_| ServiceError::native("handle table", -1, "lock poisoned"))?;
        match table.entries.get(&raw) {
            Some(Entry::Service { name, service }) => f(name, service),
            _ => Err(ServiceError::InvalidParameter(format!("{} is not a service handle", raw))),
        }
    }
}

fn info_from(name: &str, config: &ServiceConfig) -> ServiceInfo {
    let image = ImagePath::parse_windows(&config.executable_path.to_string_lossy())
        .unwrap_or_else(|| ImagePath::new(config.executable_path.clone(), Vec::new()));
    ServiceInfo {
        name: name.into(),
        display_name: config.display_name.clone(),
        service_type: config.service_type,
        start_type: config.start_type,
        error_control: config.error_control,
        executable_path: image.program,
        launch_arguments: image.args.into_iter().map(OsString::from).collect(),
        dependencies: config.dependencies.clone(),
        account_name: config.account_name.clone(),
        account_password: None,
    }
}

impl ScmBackend for WindowsScm {
    fn open_manager(&self, access: ManagerAccess) -> Result<RawHandle, ServiceError> {
        let manager = ServiceManager::local_computer(
            None::<&str>,
            ServiceManagerAccess::from_bits_truncate(access.bits()),
        )
        .map_err(|e| win_error("OpenSCManager", "local computer", e))?;
        self.register(Entry::Manager(manager))
    }

    fn create_service(
        &self,
        manager: RawHandle,
        spec: &ServiceSpec,
        access: ServiceAccess,
    ) -> Result<RawHandle, ServiceError> {
        let info = ServiceInfo {
            name: spec.name.clone().into(),
            display_name: spec.display_name.clone().into(),
            service_type: WinServiceType::from_bits_truncate(spec.service_type.bits()),
            start_type: start_type(spec.start_type),
            error_control: error_control(spec.error_control),
            executable_path: spec.image.program.clone(),
            launch_arguments: spec.image.args.iter().map(OsString::from).collect(),
            dependencies: dependencies(&spec.dependencies),
            account_name: account_name(&spec.account),
            account_password: spec.password.as_ref().map(OsString::from),
        };
        let service = self.with_manager(manager, |m| {
            m.create_service(&info, WinServiceAccess::from_bits_truncate(access.bits()))
                .map_err(|e| win_error("CreateService", &spec.name, e))
        })?;
        log::info!("Created service {}", spec.name);
        self.register(Entry::Service {
            name: spec.name.clone(),
            service,
        })
    }

    fn open_service(
        &self,
        manager: RawHandle,
        name: &str,
        access: ServiceAccess,
    ) -> Result<RawHandle, ServiceError> {
        let service = self.with_manager(manager, |m| {
            m.open_service(name, WinServiceAccess::from_bits_truncate(access.bits()))
                .map_err(|e| win_error("OpenService", name, e))
        })?;
        self.register(Entry::Service {
            name: name.to_string(),
            service,
        })
    }

    fn delete_service(&self, service: RawHandle) -> Result<(), ServiceError> {
        self.with_service(service, |name, s| {
            s.delete().map_err(|e| win_error("DeleteService", name, e))
        })
    }

    fn change_config(&self, service: RawHandle, change: &ConfigChange) -> Result<(), ServiceError> {
        self.with_service(service, |name, s| {
            let needs_config = change.display_name.is_some()
                || change.start_type.is_some()
                || change.image.is_some()
                || change.account.is_some()
                || change.dependencies.is_some();

            if needs_config {
                let current = s
                    .query_config()
                    .map_err(|e| win_error("QueryServiceConfig", name, e))?;
                let mut info = info_from(name, &current);
                if let Some(display_name) = &change.display_name {
                    info.display_name = display_name.into();
                }
                if let Some(t) = change.start_type {
                    info.start_type = start_type(t);
                }
                if let Some(image) = &change.image {
                    info.executable_path = image.program.clone();
                    info.launch_arguments = image.args.iter().map(OsString::from).collect();
                }
                if let Some(account) = &change.account {
                    info.account_name = account_name(account);
                    info.account_password = change.password.as_ref().map(OsString::from);
                }
                if let Some(deps) = &change.dependencies {
                    info.dependencies = dependencies(deps);
                }
                s.change_config(&info)
                    .map_err(|e| win_error("ChangeServiceConfig", name, e))?;
            }

            if let Some(description) = &change.description {
                s.set_description(OsStr::new(description))
                    .map_err(|e| win_error("ChangeServiceConfig2 description", name, e))?;
            }
            let delayed = change
                .delayed_auto_start
                .or(change.start_type.map(|t| t == StartType::DelayedAuto));
            if let Some(delayed) = delayed {
                s.set_delayed_auto_start(delayed)
                    .map_err(|e| win_error("ChangeServiceConfig2 delayed start", name, e))?;
            }
            Ok(())
        })
    }

    fn query_config(&self, service: RawHandle) -> Result<NativeConfig, ServiceError> {
        self.with_service(service, |name, s| {
            let config = s
                .query_config()
                .map_err(|e| win_error("QueryServiceConfig", name, e))?;
            let delayed = delayed_auto_start(name);
            let start = match config.start_type {
                ServiceStartType::AutoStart if delayed => StartType::DelayedAuto,
                ServiceStartType::AutoStart => StartType::Auto,
                ServiceStartType::Disabled => StartType::Disabled,
                _ => StartType::Demand,
            };
            let info = info_from(name, &config);
            Ok(NativeConfig {
                name: name.to_string(),
                display_name: config.display_name.to_string_lossy().into_owned(),
                description: description(name),
                start_type: start,
                image: ImagePath::new(
                    info.executable_path,
                    info.launch_arguments
                        .iter()
                        .map(|a| a.to_string_lossy().into_owned())
                        .collect(),
                ),
                account: Account::parse(
                    &config
                        .account_name
                        .map(|a| a.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ),
                dependencies: dependency_names(&config.dependencies),
            })
        })
    }

    fn query_status(&self, service: RawHandle) -> Result<ServiceStatus, ServiceError> {
        self.with_service(service, |name, s| {
            s.query_status()
                .map(status)
                .map_err(|e| win_error("QueryServiceStatus", name, e))
        })
    }

    fn start(&self, service: RawHandle, args: &[String]) -> Result<(), ServiceError> {
        self.with_service(service, |name, s| {
            s.start(args).map_err(|e| win_error("StartService", name, e))
        })
    }

    fn control(&self, service: RawHandle, code: ControlCode) -> Result<ServiceStatus, ServiceError> {
        // Shutdown is reserved to the SCM itself
        if code == ControlCode::Shutdown {
            return Err(ServiceError::native(
                "ControlService",
                ERROR_INVALID_SERVICE_CONTROL,
                format!("{:?} cannot be sent to a service", code),
            ));
        }
        self.with_service(service, |name, s| {
            let result = match code {
                ControlCode::Stop => s.stop(),
                ControlCode::Pause => s.pause(),
                ControlCode::Continue => s.resume(),
                ControlCode::Interrogate | ControlCode::Shutdown => s.query_status(),
                ControlCode::Rotate => match UserEventCode::from_raw(ControlCode::ROTATE_CODE) {
                    Ok(event) => s.notify(event),
                    Err(e) => return Err(ServiceError::native("ControlService", -1, e.to_string())),
                },
            };
            result
                .map(status)
                .map_err(|e| win_error("ControlService", name, e))
        })
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

    #[test]
    fn test_shutdown_is_rejected() {
        let scm = WindowsScm::new();
        let err = scm.control(1, ControlCode::Shutdown).unwrap_err();
        assert_eq!(err.code(), ERROR_INVALID_SERVICE_CONTROL);
    }

    #[test]
    fn test_unknown_handle() {
        let scm = WindowsScm::new();
        let err = scm.control(7, ControlCode::Interrogate).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParameter(_)), "{:?}", err);
    }

    #[test]
    fn test_start_type_mapping() {
        assert_eq!(start_type(StartType::DelayedAuto), ServiceStartType::AutoStart);
        assert_eq!(start_type(StartType::Demand), ServiceStartType::OnDemand);
    }

    #[test]
    fn test_account_name() {
        assert_eq!(account_name(&Account::LocalSystem), None);
        assert_eq!(
            account_name(&Account::User("svc".into())),
            Some(OsString::from(r".\svc"))
        );
        assert_eq!(
            account_name(&Account::User(r"CORP\svc".into())),
            Some(OsString::from(r"CORP\svc"))
        );
    }
}
