//! Service-control-manager client
//!
//! Thin, handle-based wrapper over the OS service database. A backend hands
//! out raw handles; [`ScmClient`] wraps them in [`ManagerHandle`] and
//! [`ServiceHandle`], which release the raw handle when dropped, so no
//! return path can leak one.
//!
//! ```text
//! ScmClient ──open_manager──▶ ManagerHandle ──create/open──▶ ServiceHandle
//!     │                           │ drop → close                │ drop → close
//!     └──────────────── Arc<dyn ScmBackend> ───────────────────┘
//! ```

#[cfg(target_os = "linux")]
pub mod systemd;
pub mod unit;
#[cfg(windows)]
pub mod windows;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{Account, StartType};
use crate::error::ServiceError;

/// Flag the OS-visible command line carries to re-enter host mode
pub const RUN_AS_SERVICE_FLAG: &str = "--run-as-service";

bitflags::bitflags! {
    /// Rights requested on the service manager
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ManagerAccess: u32 {
        const CONNECT = 0x0001;
        const CREATE_SERVICE = 0x0002;
        const ALL_ACCESS = 0xF003F;
    }
}

bitflags::bitflags! {
    /// Rights requested on a single service entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServiceAccess: u32 {
        const QUERY_CONFIG = 0x0001;
        const CHANGE_CONFIG = 0x0002;
        const QUERY_STATUS = 0x0004;
        const START = 0x0010;
        const STOP = 0x0020;
        const PAUSE_CONTINUE = 0x0040;
        const INTERROGATE = 0x0080;
        const USER_DEFINED_CONTROL = 0x0100;
        const DELETE = 0x10000;
        const ALL_ACCESS = 0xF01FF;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServiceType: u32 {
        const OWN_PROCESS = 0x0010;
    }
}

/// What the OS does when the service fails to start at boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorControl {
    Ignore,
    #[default]
    Normal,
    Severe,
    Critical,
}

/// Program plus argument vector, rendered to a command line on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePath {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ImagePath {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `<program> --run-as-service <id>`
    pub fn reentry(program: impl Into<PathBuf>, service: &str) -> Self {
        Self::new(program, vec![RUN_AS_SERVICE_FLAG.to_string(), service.to_string()])
    }

    /// Command line in CommandLineToArgvW quoting
    pub fn to_windows_command_line(&self) -> String {
        let mut out = quote_windows(&self.program.to_string_lossy());
        for arg in &self.args {
            out.push(' ');
            out.push_str(&quote_windows(arg));
        }
        out
    }

    /// Command line in POSIX shell quoting
    pub fn to_shell_command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.to_string_lossy().into_owned());
        parts.extend(self.args.iter().cloned());
        let words: Vec<&str> = parts.iter().map(String::as_str).collect();
        shlex::try_join(words).unwrap_or_else(|_| parts.join(" "))
    }

    /// Command line for this platform
    pub fn render(&self) -> String {
        if cfg!(windows) {
            self.to_windows_command_line()
        } else {
            self.to_shell_command_line()
        }
    }

    /// Parse a shell-quoted command line back
    pub fn parse_shell(line: &str) -> Option<Self> {
        let mut words = shlex::split(line)?.into_iter();
        let program = words.next()?;
        Some(Self::new(program, words.collect()))
    }

    /// Parse a command line in CommandLineToArgvW quoting
    pub fn parse_windows(line: &str) -> Option<Self> {
        let mut words = split_windows(line).into_iter();
        let program = words.next()?;
        Some(Self::new(program, words.collect()))
    }

    /// Service identifier if this is a re-entry command line
    pub fn reentry_service(&self) -> Option<&str> {
        match self.args.as_slice() {
            [flag, id] if flag == RUN_AS_SERVICE_FLAG => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for ImagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Join arguments into one string the launcher splits back the same way
pub fn join_arguments(args: &[String]) -> String {
    if cfg!(windows) {
        args.iter().map(|a| quote_windows(a)).collect::<Vec<_>>().join(" ")
    } else {
        shlex::try_join(args.iter().map(String::as_str)).unwrap_or_else(|_| args.join(" "))
    }
}

fn quote_windows(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    let mut out = String::from("\"");
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.push_str(&"\\".repeat(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            c => {
                out.push_str(&"\\".repeat(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.push_str(&"\\".repeat(backslashes * 2));
    out.push('"');
    out
}

fn split_windows(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ' ' || *c == '\t') {
            chars.next();
        }
        if chars.peek().is_none() {
            return words;
        }

        let mut word = String::new();
        let mut quoted = false;
        let mut backslashes = 0usize;
        while let Some(&c) = chars.peek() {
            match c {
                '\\' => backslashes += 1,
                '"' => {
                    word.push_str(&"\\".repeat(backslashes / 2));
                    if backslashes % 2 == 1 {
                        word.push('"');
                    } else {
                        quoted = !quoted;
                    }
                    backslashes = 0;
                }
                ' ' | '\t' if !quoted => break,
                c => {
                    word.push_str(&"\\".repeat(backslashes));
                    backslashes = 0;
                    word.push(c);
                }
            }
            chars.next();
        }
        word.push_str(&"\\".repeat(backslashes));
        words.push(word);
    }
}

/// Everything needed to create a service entry
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub display_name: String,
    pub service_type: ServiceType,
    pub start_type: StartType,
    pub error_control: ErrorControl,
    pub image: ImagePath,
    pub account: Account,
    pub password: Option<String>,
    pub dependencies: Vec<String>,
    /// Hint for how long the OS should wait for a stop
    pub stop_timeout: Option<Duration>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, image: ImagePath) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            service_type: ServiceType::OWN_PROCESS,
            start_type: StartType::Auto,
            error_control: ErrorControl::Normal,
            image,
            account: Account::LocalSystem,
            password: None,
            dependencies: Vec::new(),
            stop_timeout: None,
        }
    }
}

/// Fields to change in place, `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct ConfigChange {
    pub display_name: Option<String>,
    pub start_type: Option<StartType>,
    pub image: Option<ImagePath>,
    pub account: Option<Account>,
    pub password: Option<String>,
    pub dependencies: Option<Vec<String>>,
    pub stop_timeout: Option<Duration>,
    pub description: Option<String>,
    pub delayed_auto_start: Option<bool>,
}

/// Configuration as the OS service database reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeConfig {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub start_type: StartType,
    pub image: ImagePath,
    pub account: Account,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::StartPending => "start-pending",
            Self::StopPending => "stop-pending",
            Self::Running => "running",
            Self::ContinuePending => "continue-pending",
            Self::PausePending => "pause-pending",
            Self::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

impl ServiceStatus {
    pub fn stopped() -> Self {
        Self {
            state: ServiceState::Stopped,
            pid: None,
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    Stop,
    Pause,
    Continue,
    Interrogate,
    Shutdown,
    /// User-defined control asking the host to rotate its output files
    Rotate,
}

impl ControlCode {
    pub const ROTATE_CODE: u32 = 128;

    /// Right needed to send this control
    pub fn required_access(&self) -> ServiceAccess {
        match self {
            Self::Stop | Self::Shutdown => ServiceAccess::STOP,
            Self::Pause | Self::Continue => ServiceAccess::PAUSE_CONTINUE,
            Self::Interrogate => ServiceAccess::INTERROGATE,
            Self::Rotate => ServiceAccess::USER_DEFINED_CONTROL,
        }
    }
}

/// Opaque handle value issued by a backend
pub type RawHandle = u64;

/// Native service database operations on raw handles
pub trait ScmBackend: Send + Sync {
    fn open_manager(&self, access: ManagerAccess) -> Result<RawHandle, ServiceError>;

    fn create_service(
        &self,
        manager: RawHandle,
        spec: &ServiceSpec,
        access: ServiceAccess,
    ) -> Result<RawHandle, ServiceError>;

    fn open_service(
        &self,
        manager: RawHandle,
        name: &str,
        access: ServiceAccess,
    ) -> Result<RawHandle, ServiceError>;

    fn delete_service(&self, service: RawHandle) -> Result<(), ServiceError>;

    fn change_config(&self, service: RawHandle, change: &ConfigChange) -> Result<(), ServiceError>;

    fn query_config(&self, service: RawHandle) -> Result<NativeConfig, ServiceError>;

    fn query_status(&self, service: RawHandle) -> Result<ServiceStatus, ServiceError>;

    fn start(&self, service: RawHandle, args: &[String]) -> Result<(), ServiceError>;

    fn control(&self, service: RawHandle, code: ControlCode) -> Result<ServiceStatus, ServiceError>;

    /// Release a handle, unknown handles are ignored
    fn close(&self, handle: RawHandle);
}

/// Entry point for service database access
#[derive(Clone)]
pub struct ScmClient {
    backend: Arc<dyn ScmBackend>,
}

impl ScmClient {
    pub fn new(backend: Arc<dyn ScmBackend>) -> Self {
        Self { backend }
    }

    pub fn open_manager(&self, access: ManagerAccess) -> Result<ManagerHandle, ServiceError> {
        let raw = self.backend.open_manager(access)?;
        Ok(ManagerHandle {
            backend: Arc::clone(&self.backend),
            raw,
        })
    }
}

/// Open connection to the service manager, closed on drop
pub struct ManagerHandle {
    backend: Arc<dyn ScmBackend>,
    raw: RawHandle,
}

impl ManagerHandle {
    pub fn create_service(
        &self,
        spec: &ServiceSpec,
        access: ServiceAccess,
    ) -> Result<ServiceHandle, ServiceError> {
        let raw = self.backend.create_service(self.raw, spec, access)?;
        Ok(ServiceHandle {
            backend: Arc::clone(&self.backend),
            raw,
            name: spec.name.clone(),
        })
    }

    pub fn open_service(
        &self,
        name: &str,
        access: ServiceAccess,
    ) -> Result<ServiceHandle, ServiceError> {
        let raw = self.backend.open_service(self.raw, name, access)?;
        Ok(ServiceHandle {
            backend: Arc::clone(&self.backend),
            raw,
            name: name.to_string(),
        })
    }
}

impl Drop for ManagerHandle {
    fn drop(&mut self) {
        self.backend.close(self.raw);
    }
}

/// Open service entry, closed on drop
pub struct ServiceHandle {
    backend: Arc<dyn ScmBackend>,
    raw: RawHandle,
    name: String,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delete(&self) -> Result<(), ServiceError> {
        self.backend.delete_service(self.raw)
    }

    pub fn change_config(&self, change: &ConfigChange) -> Result<(), ServiceError> {
        self.backend.change_config(self.raw, change)
    }

    pub fn query_config(&self) -> Result<NativeConfig, ServiceError> {
        self.backend.query_config(self.raw)
    }

    pub fn query_status(&self) -> Result<ServiceStatus, ServiceError> {
        self.backend.query_status(self.raw)
    }

    pub fn start(&self) -> Result<(), ServiceError> {
        self.backend.start(self.raw, &[])
    }

    pub fn control(&self, code: ControlCode) -> Result<ServiceStatus, ServiceError> {
        self.backend.control(self.raw, code)
    }

    /// Poll until the service reaches `target` or `timeout` passes
    pub fn wait_for_state(
        &self,
        target: ServiceState,
        timeout: Duration,
    ) -> Result<ServiceStatus, ServiceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.query_status()?;
            if status.state == target {
                return Ok(status);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ServiceError::Timeout(format!(
                    "{} did not reach {} within {:?} (currently {})",
                    self.name,
                    target.as_str(),
                    timeout,
                    status.state.as_str()
                )));
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(250)));
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.backend.close(self.raw);
    }
}
