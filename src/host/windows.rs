//! Service Control Manager adapter
//!
//! The dispatcher calls `service_main` on its own thread. The control
//! handler forwards STOP, SHUTDOWN and the user-defined rotate control into
//! the host channel; status is reported around [`drive`].

use std::ffi::OsString;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle};
use windows_service::{define_windows_service, service_dispatcher};

use super::{drive, runtime, supervisor_for, HostControl, HostOutcome};
use crate::error::ServiceError;
use crate::scm::ControlCode;
use crate::settings::Settings;
use crate::supervisor::Supervisor;

/// The process was not started by the SCM
const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: i32 = 1063;

struct HostContext {
    service: String,
    settings: Settings,
}

static CONTEXT: OnceLock<HostContext> = OnceLock::new();
static OUTCOME: Mutex<Option<HostOutcome>> = Mutex::new(None);

define_windows_service!(ffi_service_main, service_main);

fn report(handle: ServiceStatusHandle, state: ServiceState, exit_code: ServiceExitCode, wait_hint: Duration) {
    let controls_accepted = match state {
        ServiceState::Running => ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
        _ => ServiceControlAccept::empty(),
    };
    let status = ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state: state,
        controls_accepted,
        exit_code,
        checkpoint: 0,
        wait_hint,
        process_id: None,
    };
    if let Err(e) = handle.set_service_status(status) {
        log::warn!("Cannot report {:?} to the service manager: {}", state, e);
    }
}

fn service_main(_arguments: Vec<OsString>) {
    let outcome = match CONTEXT.get() {
        Some(ctx) => run_dispatched(ctx),
        None => HostOutcome::Failed(ServiceError::native("service main", -1, "host context missing")),
    };
    if let Ok(mut slot) = OUTCOME.lock() {
        *slot = Some(outcome);
    }
}

fn run_dispatched(ctx: &HostContext) -> HostOutcome {
    let (tx, mut controls) = mpsc::unbounded_channel();
    let handler = move |control| -> ServiceControlHandlerResult {
        match control {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                let _ = tx.send(HostControl::Stop);
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::UserEvent(code) if code.to_raw() == ControlCode::ROTATE_CODE => {
                let _ = tx.send(HostControl::Rotate);
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            _ => ServiceControlHandlerResult::NotImplemented,
        }
    };

    let handle = match service_control_handler::register(&ctx.service, handler) {
        Ok(handle) => handle,
        Err(e) => {
            return HostOutcome::Failed(ServiceError::native(
                "RegisterServiceCtrlHandler",
                -1,
                e.to_string(),
            ))
        }
    };
    report(handle, ServiceState::StartPending, ServiceExitCode::Win32(0), ctx.settings.default_timeout);

    let outcome = match runtime() {
        Ok(runtime) => runtime.block_on(async {
            let supervisor = supervisor_for(&ctx.service, &ctx.settings);
            drive(&supervisor, &mut controls, || {
                report(handle, ServiceState::Running, ServiceExitCode::Win32(0), Duration::ZERO)
            })
            .await
        }),
        Err(e) => HostOutcome::Failed(e),
    };

    match &outcome {
        HostOutcome::Stopped { .. } => {
            report(handle, ServiceState::Stopped, ServiceExitCode::Win32(0), Duration::ZERO)
        }
        HostOutcome::Failed(e) => report(
            handle,
            ServiceState::Stopped,
            ServiceExitCode::ServiceSpecific(e.code() as u32),
            Duration::ZERO,
        ),
        HostOutcome::Suicide { exit_code } => {
            // No stop report, the SCM sees a crash and applies recovery
            log::error!("{}: exiting with code {} without reporting a stop", ctx.service, exit_code);
            std::process::exit(i32::from(outcome.process_exit_code()));
        }
    }
    outcome
}

/// Hand the thread to the service dispatcher. Falls back to a console host
/// when the process was not started by the SCM.
pub fn run(service: &str, settings: &Settings) -> HostOutcome {
    let _ = CONTEXT.set(HostContext {
        service: service.to_string(),
        settings: settings.clone(),
    });

    match service_dispatcher::start(service, ffi_service_main) {
        Ok(()) => OUTCOME
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or(HostOutcome::Stopped { exit_code: None }),
        Err(windows_service::Error::Winapi(e))
            if e.raw_os_error() == Some(ERROR_FAILED_SERVICE_CONTROLLER_CONNECT) =>
        {
            log::warn!("{}: not started by the service manager, running in the console", service);
            super::run_interactive(service, settings)
        }
        Err(e) => HostOutcome::Failed(ServiceError::native("StartServiceCtrlDispatcher", -1, e.to_string())),
    }
}

/// Console host, Ctrl+C stops
pub async fn run_console(supervisor: &Supervisor) -> HostOutcome {
    let (tx, mut controls) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(HostControl::Stop).is_err() {
                break;
            }
        }
    });
    let service = supervisor.service().to_string();
    drive(supervisor, &mut controls, move || log::info!("{}: running", service)).await
}
