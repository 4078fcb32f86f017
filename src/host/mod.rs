//! Host mode: the binary re-entered by the OS as `<bin> --run-as-service <id>`
//!
//! The OS adapter (systemd signals or the Windows control handler) turns
//! control requests into [`HostControl`] messages; [`drive`] feeds them to
//! the supervisor together with the supervisor's own [`HostEvent`]s until
//! the activation ends.

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::ServiceError;
use crate::scm::RUN_AS_SERVICE_FLAG;
use crate::settings::Settings;
use crate::supervisor::{HostEvent, Supervisor, SupervisorOptions};

/// How the process was started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryMode {
    /// Command-line front-end
    Admin,
    /// Service host for one service
    Host { service: String },
}

impl EntryMode {
    /// Inspect the full argument vector, program name included
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut args = args.into_iter().skip(1).map(Into::<OsString>::into);
        if args.next().as_deref() != Some(OsStr::new(RUN_AS_SERVICE_FLAG)) {
            return Self::Admin;
        }
        match args.next() {
            Some(id) => {
                let id = id.to_string_lossy();
                let id = id.trim().trim_matches('"').trim();
                if id.is_empty() {
                    Self::Admin
                } else {
                    Self::Host {
                        service: id.to_string(),
                    }
                }
            }
            None => Self::Admin,
        }
    }
}

/// Requests from the OS to the running host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostControl {
    Stop,
    Rotate,
}

/// How a host run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    /// Clean stop, with the child's exit code when the child ended it
    Stopped { exit_code: Option<i32> },
    /// Die without reporting a stop so OS recovery kicks in
    Suicide { exit_code: i32 },
    Failed(ServiceError),
}

impl HostOutcome {
    pub fn process_exit_code(&self) -> u8 {
        match self {
            Self::Stopped { .. } => 0,
            Self::Failed(_) => 1,
            Self::Suicide { exit_code } => u8::try_from(*exit_code)
                .ok()
                .filter(|c| *c != 0)
                .unwrap_or(1),
        }
    }
}

/// Supervisor wired to this platform's store and process table
#[cfg(unix)]
pub fn supervisor_for(service: &str, settings: &Settings) -> Supervisor {
    Supervisor::new(
        service,
        Arc::new(crate::store::FileStore::new(&settings.store_dir)),
        Arc::new(crate::terminate::unix::ProcTable),
        SupervisorOptions {
            monitor_interval: settings.monitor_interval,
        },
    )
}

#[cfg(windows)]
pub fn supervisor_for(service: &str, settings: &Settings) -> Supervisor {
    Supervisor::new(
        service,
        Arc::new(crate::store::RegistryStore::new()),
        Arc::new(crate::terminate::windows::ToolhelpTable),
        SupervisorOptions {
            monitor_interval: settings.monitor_interval,
        },
    )
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<HostEvent>>) -> Option<HostEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn deactivate(supervisor: &Supervisor, outcome: HostOutcome) -> HostOutcome {
    match supervisor.on_deactivate().await {
        Ok(()) => outcome,
        Err(e) => {
            log::error!("{}: stop failed: {}", supervisor.service(), e);
            HostOutcome::Failed(e)
        }
    }
}

/// Run one activation to its end. `running` is called once the child is up.
pub async fn drive<F>(
    supervisor: &Supervisor,
    controls: &mut mpsc::UnboundedReceiver<HostControl>,
    running: F,
) -> HostOutcome
where
    F: FnOnce(),
{
    let mut events = supervisor.take_events();
    if let Err(e) = supervisor.on_activate().await {
        return HostOutcome::Failed(e);
    }
    running();

    loop {
        tokio::select! {
            control = controls.recv() => match control {
                Some(HostControl::Rotate) => supervisor.rotate_logs(),
                Some(HostControl::Stop) | None => {
                    return deactivate(supervisor, HostOutcome::Stopped { exit_code: None }).await;
                }
            },
            Some(event) = next_event(&mut events) => match event {
                HostEvent::Exit { exit_code } => {
                    log::info!("{}: exit policy ends the service", supervisor.service());
                    return deactivate(supervisor, HostOutcome::Stopped { exit_code: Some(exit_code) }).await;
                }
                HostEvent::Suicide { exit_code } => {
                    log::warn!("{}: exit policy ends the host abnormally", supervisor.service());
                    if let Err(e) = supervisor.on_deactivate().await {
                        log::error!("{}: stop failed: {}", supervisor.service(), e);
                    }
                    return HostOutcome::Suicide { exit_code };
                }
                HostEvent::StartFailed(e) => {
                    return deactivate(supervisor, HostOutcome::Failed(e)).await;
                }
            },
        }
    }
}

/// Host mode as started by the OS
#[cfg(unix)]
pub fn run_host(service: &str, settings: &Settings) -> HostOutcome {
    run_interactive(service, settings)
}

#[cfg(windows)]
pub fn run_host(service: &str, settings: &Settings) -> HostOutcome {
    windows::run(service, settings)
}

fn runtime() -> Result<tokio::runtime::Runtime, ServiceError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ServiceError::from_io("start runtime", "host", &e))
}

/// Host driven from a terminal, stopped with Ctrl+C
pub fn run_interactive(service: &str, settings: &Settings) -> HostOutcome {
    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(e) => return HostOutcome::Failed(e),
    };
    runtime.block_on(async {
        let supervisor = supervisor_for(service, settings);
        #[cfg(unix)]
        let outcome = unix::run(&supervisor).await;
        #[cfg(windows)]
        let outcome = windows::run_console(&supervisor).await;
        outcome
    })
}
