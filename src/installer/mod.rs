//! Service installer / uninstaller
//!
//! Registers the binary itself as the service program, with the service
//! identifier on its command line, and keeps the real launch configuration
//! in the store:
//!
//! ```text
//! install ─▶ validate ─▶ create entry ─▶ description, delayed start ─▶ store ─▶ verify
//!                             │                  (warnings)              │
//!                             └──────────── roll back on failure ◀───────┘
//! ```
//!
//! Every public operation records its error for [`ServiceInstaller::last_error`].

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{validate, ServiceConfiguration, StartType};
use crate::error::{ErrorSlot, OperationReport, ServiceError};
use crate::scm::{
    ConfigChange, ControlCode, ImagePath, ManagerAccess, ScmClient, ServiceAccess, ServiceHandle,
    ServiceSpec, ServiceState, ServiceStatus,
};
use crate::store::ConfigStore;

/// Added to the host's own stop budget for the OS stop timeout
const STOP_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Stored configuration plus live status
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub config: ServiceConfiguration,
    pub status: ServiceStatus,
}

pub struct ServiceInstaller {
    scm: ScmClient,
    store: Arc<dyn ConfigStore>,
    host_binary: PathBuf,
    timeout: Duration,
    last_error: ErrorSlot,
}

fn is_gone(err: &ServiceError) -> bool {
    matches!(err, ServiceError::NotFound(_) | ServiceError::MarkedForDeletion(_))
}

impl ServiceInstaller {
    /// `host_binary` is the program the OS re-enters to host services
    pub fn new(scm: ScmClient, store: Arc<dyn ConfigStore>, host_binary: impl Into<PathBuf>) -> Self {
        Self {
            scm,
            store,
            host_binary: host_binary.into(),
            timeout: DEFAULT_TIMEOUT,
            last_error: ErrorSlot::new(),
        }
    }

    /// Installer that registers the running executable
    pub fn for_current_exe(scm: ScmClient, store: Arc<dyn ConfigStore>) -> Result<Self, ServiceError> {
        let exe = std::env::current_exe()
            .map_err(|e| ServiceError::from_io("locate own executable", "svcwrap", &e))?;
        Ok(Self::new(scm, store, exe))
    }

    /// Bound used when removal has to stop a running service
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Most recent error raised by an operation
    pub fn last_error(&self) -> Option<ServiceError> {
        self.last_error.get()
    }

    fn image(&self, name: &str) -> ImagePath {
        ImagePath::reentry(&self.host_binary, name)
    }

    fn stop_timeout(config: &ServiceConfiguration) -> Duration {
        config.parameters.stop.total() + STOP_TIMEOUT_MARGIN
    }

    fn secondary_steps(service: &ServiceHandle, config: &ServiceConfiguration, report: &mut OperationReport) {
        let metadata = &config.metadata;
        if !metadata.description.is_empty() {
            let change = ConfigChange {
                description: Some(metadata.description.clone()),
                ..Default::default()
            };
            if let Err(e) = service.change_config(&change) {
                report.warn("set description", &e);
            }
        }
        if metadata.start_type == StartType::DelayedAuto {
            let change = ConfigChange {
                delayed_auto_start: Some(true),
                ..Default::default()
            };
            if let Err(e) = service.change_config(&change) {
                report.warn("set delayed auto start", &e);
            }
        }
    }

    pub fn install_service(&self, config: &ServiceConfiguration) -> Result<OperationReport, ServiceError> {
        self.last_error.track(self.install(config))
    }

    fn install(&self, config: &ServiceConfiguration) -> Result<OperationReport, ServiceError> {
        validate(config)?;
        let name = config.name.as_str();
        let manager = self
            .scm
            .open_manager(ManagerAccess::CONNECT | ManagerAccess::CREATE_SERVICE)?;

        let metadata = &config.metadata;
        let mut spec = ServiceSpec::new(name, self.image(name));
        spec.display_name = config.display_name().to_string();
        spec.start_type = metadata.start_type;
        spec.account = metadata.account.clone();
        spec.password = config.password.clone();
        spec.dependencies = metadata.dependencies.clone();
        spec.stop_timeout = Some(Self::stop_timeout(config));

        let service = manager.create_service(&spec, ServiceAccess::ALL_ACCESS)?;
        log::info!("Installed service {}", name);

        let mut report = OperationReport::new();
        Self::secondary_steps(&service, config, &mut report);

        match self.store.write(config) {
            Ok(written) => report.extend(written.warnings),
            Err(e) => {
                log::error!("{}: cannot store launch parameters, rolling back: {}", name, e);
                if let Err(rollback) = service.delete() {
                    log::error!("{}: rollback of the service entry failed: {}", name, rollback);
                }
                if let Err(rollback) = self.store.delete(name) {
                    log::warn!("{}: rollback of stored parameters failed: {}", name, rollback);
                }
                return Err(e);
            }
        }
        drop(service);

        if let Err(e) = manager.open_service(name, ServiceAccess::QUERY_CONFIG) {
            log::warn!("{}: installed entry could not be reopened: {}", name, e);
        }
        Ok(report)
    }

    pub fn remove_service(&self, name: &str) -> Result<OperationReport, ServiceError> {
        self.last_error.track(self.remove(name))
    }

    fn remove(&self, name: &str) -> Result<OperationReport, ServiceError> {
        let mut report = OperationReport::new();
        let manager = self.scm.open_manager(ManagerAccess::CONNECT)?;

        match manager.open_service(name, ServiceAccess::STOP | ServiceAccess::QUERY_STATUS | ServiceAccess::DELETE) {
            Ok(service) => {
                if let Err(e) = self.stop_before_removal(&service) {
                    report.warn("stop service", &e);
                }
                match service.delete() {
                    Ok(()) => log::info!("Removed service {}", name),
                    Err(e) if is_gone(&e) => log::info!("Service {} already removed", name),
                    Err(e) => return Err(e),
                }
            }
            Err(e) if is_gone(&e) => log::info!("Service {} does not exist", name),
            Err(e) => return Err(e),
        }

        if let Err(e) = self.store.delete(name) {
            report.warn("delete stored parameters", &e);
        }
        Ok(report)
    }

    fn stop_before_removal(&self, service: &ServiceHandle) -> Result<(), ServiceError> {
        if service.query_status()?.state == ServiceState::Stopped {
            return Ok(());
        }
        log::info!("Stopping {} before removal", service.name());
        service.control(ControlCode::Stop)?;
        service.wait_for_state(ServiceState::Stopped, self.timeout)?;
        Ok(())
    }

    /// Change a service in place, or replace it when the identifier changes
    pub fn update_service(
        &self,
        existing: &str,
        config: &ServiceConfiguration,
    ) -> Result<OperationReport, ServiceError> {
        self.last_error.track(self.update(existing, config))
    }

    fn update(&self, existing: &str, config: &ServiceConfiguration) -> Result<OperationReport, ServiceError> {
        if config.name != existing {
            {
                let manager = self.scm.open_manager(ManagerAccess::CONNECT)?;
                manager.open_service(existing, ServiceAccess::QUERY_CONFIG)?;
            }
            log::info!("Renaming service {} to {}", existing, config.name);
            let mut report = self.remove(existing)?;
            let installed = self.install(config)?;
            report.extend(installed.warnings);
            return Ok(report);
        }

        validate(config)?;
        let name = config.name.as_str();
        let manager = self.scm.open_manager(ManagerAccess::CONNECT)?;
        let service = manager.open_service(name, ServiceAccess::CHANGE_CONFIG | ServiceAccess::QUERY_CONFIG)?;

        let metadata = &config.metadata;
        let change = ConfigChange {
            display_name: Some(config.display_name().to_string()),
            start_type: Some(metadata.start_type),
            image: Some(self.image(name)),
            account: Some(metadata.account.clone()),
            password: config.password.clone(),
            dependencies: Some(metadata.dependencies.clone()),
            stop_timeout: Some(Self::stop_timeout(config)),
            ..Default::default()
        };
        service.change_config(&change)?;
        log::info!("Updated service {}", name);

        let mut report = OperationReport::new();
        Self::secondary_steps(&service, config, &mut report);
        if metadata.start_type != StartType::DelayedAuto {
            let change = ConfigChange {
                delayed_auto_start: Some(false),
                ..Default::default()
            };
            if let Err(e) = service.change_config(&change) {
                report.warn("clear delayed auto start", &e);
            }
        }

        let written = self.store.write(config)?;
        report.extend(written.warnings);
        Ok(report)
    }

    pub fn start_service(&self, name: &str, timeout: Duration) -> Result<ServiceStatus, ServiceError> {
        self.last_error.track(self.start(name, timeout))
    }

    fn start(&self, name: &str, timeout: Duration) -> Result<ServiceStatus, ServiceError> {
        let manager = self.scm.open_manager(ManagerAccess::CONNECT)?;
        let service = manager.open_service(name, ServiceAccess::START | ServiceAccess::QUERY_STATUS)?;
        let status = service.query_status()?;
        if status.state == ServiceState::Running {
            return Ok(status);
        }
        service.start()?;
        log::info!("Start requested for {}", name);
        service.wait_for_state(ServiceState::Running, timeout)
    }

    pub fn stop_service(&self, name: &str, timeout: Duration) -> Result<ServiceStatus, ServiceError> {
        self.last_error.track(self.stop(name, timeout))
    }

    fn stop(&self, name: &str, timeout: Duration) -> Result<ServiceStatus, ServiceError> {
        let manager = self.scm.open_manager(ManagerAccess::CONNECT)?;
        let service = manager.open_service(name, ServiceAccess::STOP | ServiceAccess::QUERY_STATUS)?;
        let status = service.query_status()?;
        if status.state == ServiceState::Stopped {
            return Ok(status);
        }
        service.control(ControlCode::Stop)?;
        log::info!("Stop requested for {}", name);
        service.wait_for_state(ServiceState::Stopped, timeout)
    }

    /// Ask a running host to rotate its output files
    pub fn rotate_service(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        self.last_error.track(self.rotate(name))
    }

    fn rotate(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        let manager = self.scm.open_manager(ManagerAccess::CONNECT)?;
        let service = manager.open_service(
            name,
            ServiceAccess::USER_DEFINED_CONTROL | ServiceAccess::QUERY_STATUS,
        )?;
        service.control(ControlCode::Rotate)
    }

    pub fn service_info(&self, name: &str) -> Result<ServiceInfo, ServiceError> {
        self.last_error.track(self.info(name))
    }

    fn info(&self, name: &str) -> Result<ServiceInfo, ServiceError> {
        let manager = self.scm.open_manager(ManagerAccess::CONNECT)?;
        let service = manager.open_service(name, ServiceAccess::QUERY_CONFIG | ServiceAccess::QUERY_STATUS)?;
        let native = service.query_config()?;
        let status = service.query_status()?;

        // The OS entry is authoritative for what it holds
        let mut config = self.store.read(name)?;
        config.metadata.display_name = native.display_name;
        config.metadata.description = native.description;
        config.metadata.start_type = native.start_type;
        config.metadata.account = native.account;
        config.metadata.dependencies = native.dependencies;
        Ok(ServiceInfo { config, status })
    }

    /// Identifiers of all services this tool manages
    pub fn list_services(&self) -> Result<BTreeSet<String>, ServiceError> {
        self.last_error.track(self.store.list_all())
    }
}
