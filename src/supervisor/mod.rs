//! Service host: keeps one wrapped program alive
//!
//! `on_activate` reads the launch parameters, spawns the child and hands it
//! to a monitor task that owns it for the rest of the activation. The
//! monitor polls for exit, applies the exit policy and restarts in a loop.
//! `on_deactivate` flips the cancel flag and waits for the monitor to run
//! the termination escalator. Both calls take the same lifecycle lock, so a
//! start always finishes before a stop begins.

pub mod child;
pub mod output;
pub mod rotation;
pub mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::{ExitAction, LaunchParameters};
use crate::error::ServiceError;
use crate::store::ConfigStore;
use crate::terminate::{self, ProcessControl, ProcessTable};

pub use child::{launch, ChildProcess, SpawnError};
pub use state::{HostState, SupervisorStatus};

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// Added to the escalation budget when waiting for a stop
const STOP_MARGIN: Duration = Duration::from_secs(2);

/// Things the host has to act on that the supervisor cannot do itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Exit policy asked for a clean stop
    Exit { exit_code: i32 },
    /// Exit policy asked the host to die without reporting a stop
    Suicide { exit_code: i32 },
    /// A restart could not spawn the program
    StartFailed(ServiceError),
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Liveness poll period of the monitor
    pub monitor_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

struct Activation {
    cancel: watch::Sender<bool>,
    monitor: JoinHandle<()>,
    stop_budget: Duration,
}

/// Everything the monitor task needs, moved into it
struct Monitor {
    service: String,
    params: LaunchParameters,
    table: Arc<dyn ProcessTable>,
    status: Arc<StdMutex<SupervisorStatus>>,
    events: mpsc::UnboundedSender<HostEvent>,
    rotate: Arc<AtomicU64>,
    interval: Duration,
}

pub struct Supervisor {
    service: String,
    store: Arc<dyn ConfigStore>,
    table: Arc<dyn ProcessTable>,
    options: SupervisorOptions,
    status: Arc<StdMutex<SupervisorStatus>>,
    lifecycle: Mutex<Option<Activation>>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<HostEvent>>>,
    rotate: Arc<AtomicU64>,
}

fn update(status: &StdMutex<SupervisorStatus>, f: impl FnOnce(&mut SupervisorStatus)) {
    if let Ok(mut status) = status.lock() {
        f(&mut status);
    }
}

impl Supervisor {
    pub fn new(
        service: impl Into<String>,
        store: Arc<dyn ConfigStore>,
        table: Arc<dyn ProcessTable>,
        options: SupervisorOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            service: service.into(),
            store,
            table,
            options,
            status: Arc::new(StdMutex::new(SupervisorStatus::new())),
            lifecycle: Mutex::new(None),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            rotate: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Receiver for host events, handed out once
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<HostEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Ask the output sinks to rotate on their next write
    pub fn rotate_logs(&self) {
        let generation = self.rotate.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!("{}: output rotation requested ({})", self.service, generation);
    }

    fn fail(&self, err: ServiceError) -> ServiceError {
        log::error!("{}: start failed: {}", self.service, err);
        update(&self.status, |s| s.set_failed(err.to_string()));
        err
    }

    /// Start the child. Activating an active host is a no-op.
    pub async fn on_activate(&self) -> Result<(), ServiceError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(activation) = lifecycle.as_ref() {
            if !activation.monitor.is_finished() {
                log::debug!("{}: already active", self.service);
                return Ok(());
            }
        }
        *lifecycle = None;

        update(&self.status, |s| s.set_starting());
        log::info!("{}: starting", self.service);

        let params = self
            .store
            .read_parameters(&self.service)
            .map_err(|e| self.fail(e))?;
        if params.application.trim().is_empty() {
            return Err(self.fail(SpawnError::NoApplication(self.service.clone()).into()));
        }

        let child = launch(&self.service, &params, &self.rotate)
            .await
            .map_err(|e| self.fail(e.into()))?;
        update(&self.status, |s| s.set_running(child.pid()));

        let (cancel, cancelled) = watch::channel(false);
        let stop_budget = params.stop.total() + STOP_MARGIN;
        let monitor = Monitor {
            service: self.service.clone(),
            params,
            table: Arc::clone(&self.table),
            status: Arc::clone(&self.status),
            events: self.events_tx.clone(),
            rotate: Arc::clone(&self.rotate),
            interval: self.options.monitor_interval,
        };
        *lifecycle = Some(Activation {
            cancel,
            monitor: tokio::spawn(monitor.run(child, cancelled)),
            stop_budget,
        });
        Ok(())
    }

    /// Stop the child. Deactivating an inactive host is a no-op.
    pub async fn on_deactivate(&self) -> Result<(), ServiceError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(mut activation) = lifecycle.take() else {
            log::debug!("{}: not active", self.service);
            return Ok(());
        };

        log::info!("{}: stopping", self.service);
        let _ = activation.cancel.send(true);
        match tokio::time::timeout(activation.stop_budget, &mut activation.monitor).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                update(&self.status, |s| s.set_stopped(None));
                Err(ServiceError::native("monitor", -1, e.to_string()))
            }
            Err(_) => {
                // Dropping the child kills it
                activation.monitor.abort();
                update(&self.status, |s| s.set_stopped(None));
                Err(ServiceError::Timeout(format!(
                    "{} did not stop within {:?}",
                    self.service, activation.stop_budget
                )))
            }
        }
    }
}

/// Resolve on cancellation or when the sender is gone
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

impl Monitor {
    async fn poll_exit(&self, child: &mut ChildProcess) -> i32 {
        loop {
            if let Some(code) = child.try_exit_code() {
                return code;
            }
            sleep(self.interval).await;
        }
    }

    async fn stop(&self, mut child: ChildProcess) {
        update(&self.status, |s| s.set_stopping());
        let exited = match terminate::terminate(&mut child, self.table.as_ref(), &self.params.stop).await {
            Ok(exited) => exited,
            Err(e) => {
                log::error!("{}: cannot terminate pid {}: {}", self.service, child.pid(), e);
                false
            }
        };
        if !exited {
            log::warn!("{}: pid {} did not confirm exit", self.service, child.pid());
        }
        let code = child.try_exit_code();
        update(&self.status, |s| s.set_stopped(code));
        log::info!("{}: stopped", self.service);
    }

    fn restart_wait(&self, child: &ChildProcess) -> Duration {
        let throttled = self.params.throttle.saturating_sub(child.uptime());
        if !throttled.is_zero() {
            log::warn!(
                "{}: program ran for {:?}, throttling restart by {:?}",
                self.service,
                child.uptime(),
                throttled
            );
        }
        throttled + self.params.restart_delay
    }

    async fn run(self, mut child: ChildProcess, mut cancel: watch::Receiver<bool>) {
        loop {
            let exited = tokio::select! {
                code = self.poll_exit(&mut child) => Some(code),
                _ = cancelled(&mut cancel) => None,
            };
            let Some(code) = exited else {
                self.stop(child).await;
                return;
            };
            child.drain_output(Duration::from_millis(200)).await;

            let action = self.params.exit.action_for(code);
            log::info!(
                "{}: pid {} exited with code {}, action {}",
                self.service,
                child.pid(),
                code,
                action.as_str()
            );

            match action {
                ExitAction::Restart => {
                    update(&self.status, |s| s.set_restarting(code));
                    let wait = self.restart_wait(&child);
                    drop(child);
                    tokio::select! {
                        _ = sleep(wait) => {}
                        _ = cancelled(&mut cancel) => {
                            update(&self.status, |s| s.set_stopped(None));
                            return;
                        }
                    }
                    if *cancel.borrow() {
                        update(&self.status, |s| s.set_stopped(None));
                        return;
                    }
                    match launch(&self.service, &self.params, &self.rotate).await {
                        Ok(next) => {
                            update(&self.status, |s| s.set_running(next.pid()));
                            child = next;
                        }
                        Err(e) => {
                            let err: ServiceError = e.into();
                            log::error!("{}: restart failed: {}", self.service, err);
                            update(&self.status, |s| s.set_failed(err.to_string()));
                            let _ = self.events.send(HostEvent::StartFailed(err));
                            return;
                        }
                    }
                }
                ExitAction::Ignore => {
                    update(&self.status, |s| s.set_stopped(Some(code)));
                    log::warn!("{}: program exited, not restarting", self.service);
                    return;
                }
                ExitAction::Exit => {
                    update(&self.status, |s| s.set_stopped(Some(code)));
                    let _ = self.events.send(HostEvent::Exit { exit_code: code });
                    return;
                }
                ExitAction::Suicide => {
                    update(&self.status, |s| s.set_stopped(Some(code)));
                    let _ = self.events.send(HostEvent::Suicide { exit_code: code });
                    return;
                }
            }
        }
    }
}
