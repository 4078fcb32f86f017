//! Signal adapter for systemd and terminals
//!
//! - SIGTERM: stop (what systemd sends on `systemctl stop`)
//! - SIGINT: stop (Ctrl+C when run from a terminal)
//! - SIGHUP: rotate output files

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

use super::{drive, HostControl, HostOutcome};
use crate::error::ServiceError;
use crate::supervisor::Supervisor;

/// Signals the host handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    Term,
    Int,
    Hup,
}

impl HostSignal {
    pub fn control(&self) -> HostControl {
        match self {
            Self::Term | Self::Int => HostControl::Stop,
            Self::Hup => HostControl::Rotate,
        }
    }
}

pub struct SignalHandler {
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> HostSignal {
        tokio::select! {
            _ = self.sigterm.recv() => HostSignal::Term,
            _ = self.sigint.recv() => HostSignal::Int,
            _ = self.sighup.recv() => HostSignal::Hup,
        }
    }

    /// Spawn a task that forwards signals as host controls
    pub fn spawn_forwarder(mut self) -> mpsc::UnboundedReceiver<HostControl> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let sig = self.wait().await;
                log::debug!("Received {:?}", sig);
                if tx.send(sig.control()).is_err() {
                    break;
                }
            }
        });

        rx
    }
}

/// Run the supervisor until a stop signal or the exit policy ends it
pub async fn run(supervisor: &Supervisor) -> HostOutcome {
    let mut controls = match SignalHandler::new() {
        Ok(handler) => handler.spawn_forwarder(),
        Err(e) => return HostOutcome::Failed(ServiceError::from_io("install signal handlers", supervisor.service(), &e)),
    };
    let service = supervisor.service().to_string();
    drive(supervisor, &mut controls, move || log::info!("{}: running", service)).await
}
