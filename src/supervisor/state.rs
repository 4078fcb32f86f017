//! Host state machine
//!
//! ```text
//!     ┌──────────┐
//!     │ Stopped  │◀──────────────────────┐
//!     └────┬─────┘                       │
//!          │ on_activate                 │ start failure
//!     ┌────▼─────┐                       │
//!     │ Starting │───────────────────────┤
//!     └────┬─────┘                       │
//!          │ spawned       ▲ restart     │
//!     ┌────▼─────┐         │             │
//!     │ Running  │─────────┘─────────────┤ exit (ignore/exit/suicide)
//!     └────┬─────┘                       │
//!          │ on_deactivate               │
//!     ┌────▼─────┐                       │
//!     │ Stopping │───────────────────────┘
//!     └──────────┘
//! ```

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Runtime view of the supervised program
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: HostState,
    /// Child pid while one runs
    pub pid: Option<u32>,
    /// Exit code of the last child that ended
    pub exit_code: Option<i32>,
    /// Children spawned over the host's lifetime
    pub start_count: u32,
    /// Spawns caused by the restart policy
    pub restart_count: u32,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub since: Instant,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: HostState::Stopped,
            pid: None,
            exit_code: None,
            start_count: 0,
            restart_count: 0,
            last_error: None,
            since: Instant::now(),
        }
    }
}

impl SupervisorStatus {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&mut self, state: HostState) {
        self.state = state;
        self.since = Instant::now();
    }

    pub fn set_starting(&mut self) {
        self.enter(HostState::Starting);
        self.pid = None;
        self.last_error = None;
    }

    pub fn set_running(&mut self, pid: u32) {
        self.enter(HostState::Running);
        self.pid = Some(pid);
        self.start_count += 1;
    }

    /// Child ended and the restart policy chose to run it again
    pub fn set_restarting(&mut self, exit_code: i32) {
        self.enter(HostState::Starting);
        self.pid = None;
        self.exit_code = Some(exit_code);
        self.restart_count += 1;
    }

    pub fn set_stopping(&mut self) {
        self.enter(HostState::Stopping);
    }

    pub fn set_stopped(&mut self, exit_code: Option<i32>) {
        self.enter(HostState::Stopped);
        self.pid = None;
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
    }

    pub fn set_failed(&mut self, error: String) {
        self.enter(HostState::Stopped);
        self.pid = None;
        self.last_error = Some(error);
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, HostState::Starting | HostState::Running)
    }
}
