//! Admin commands behind the `svcwrap` CLI

mod control;
mod install;
mod list;
mod remove;
mod run;
mod status;

pub use control::{rotate, start, stop};
pub use install::{install, update, InstallArgs};
pub use list::list;
pub use remove::remove;
pub use run::run;
pub use status::status;

use std::sync::Arc;

use svcwrap::error::{OperationReport, ServiceError};
use svcwrap::installer::ServiceInstaller;
use svcwrap::scm::ScmClient;
use svcwrap::settings::Settings;
use svcwrap::store::ConfigStore;

pub type CommandResult = Result<Outcome, Box<dyn std::error::Error>>;

/// How a command ended, mapped onto the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Succeeded with warnings
    Partial,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Done => 0,
            Self::Partial => 2,
        }
    }

    /// Print the warnings of a report
    fn from_report(report: &OperationReport) -> Self {
        for warning in &report.warnings {
            log::warn!("{}", warning);
        }
        if report.is_partial() {
            Self::Partial
        } else {
            Self::Done
        }
    }
}

#[cfg(target_os = "linux")]
fn backend(settings: &Settings) -> Result<ScmClient, ServiceError> {
    use svcwrap::scm::systemd::{SystemdBus, UnitFileBackend};
    let bus = SystemdBus::system()?;
    Ok(ScmClient::new(Arc::new(UnitFileBackend::new(&settings.unit_dir, bus))))
}

#[cfg(windows)]
fn backend(_settings: &Settings) -> Result<ScmClient, ServiceError> {
    Ok(ScmClient::new(Arc::new(svcwrap::scm::windows::WindowsScm::new())))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn backend(_settings: &Settings) -> Result<ScmClient, ServiceError> {
    Err(ServiceError::native(
        "open service manager",
        -1,
        "no supported service manager on this platform",
    ))
}

#[cfg(unix)]
fn store(settings: &Settings) -> Arc<dyn ConfigStore> {
    Arc::new(svcwrap::store::FileStore::new(&settings.store_dir))
}

#[cfg(windows)]
fn store(_settings: &Settings) -> Arc<dyn ConfigStore> {
    Arc::new(svcwrap::store::RegistryStore::new())
}

/// Installer for this platform, registering the running executable
pub fn installer(settings: &Settings) -> Result<ServiceInstaller, ServiceError> {
    let installer = ServiceInstaller::for_current_exe(backend(settings)?, store(settings))?;
    Ok(installer.with_timeout(settings.default_timeout))
}
