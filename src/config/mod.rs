//! Service configuration model
//!
//! A [`ServiceConfiguration`] is split in two halves that are stored in
//! separate containers: [`ServiceMetadata`] (what the OS service database
//! also knows about) and [`LaunchParameters`] (what only the host needs to
//! start the wrapped program). String values are kept unexpanded; see
//! [`expand`] for resolving environment references.

pub mod expand;
pub mod validate;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

pub use validate::validate;

pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(1500);
pub const DEFAULT_KILL_CONSOLE_DELAY: Duration = Duration::from_millis(1500);
pub const DEFAULT_KILL_WINDOW_DELAY: Duration = Duration::from_millis(1500);
pub const DEFAULT_KILL_THREADS_DELAY: Duration = Duration::from_millis(1000);

/// How the OS starts the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartType {
    #[default]
    Auto,
    DelayedAuto,
    Demand,
    Disabled,
}

impl StartType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" | "auto-start" | "service_auto_start" => Some(Self::Auto),
            "delayed" | "delayed-auto" | "delayed-auto-start" | "service_delayed_auto_start" => {
                Some(Self::DelayedAuto)
            }
            "demand" | "manual" | "demand-start" | "service_demand_start" => Some(Self::Demand),
            "disabled" | "service_disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::DelayedAuto => "delayed-auto",
            Self::Demand => "demand",
            Self::Disabled => "disabled",
        }
    }

    /// Whether the OS starts the service at boot
    pub fn is_automatic(&self) -> bool {
        matches!(self, Self::Auto | Self::DelayedAuto)
    }
}

/// Supervisor response to a child process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitAction {
    /// Start the child again
    Restart,
    /// Stay registered as running without a child
    Ignore,
    /// Stop the service cleanly
    Exit,
    /// Exit the host without reporting a stop, so OS recovery kicks in
    Suicide,
}

impl ExitAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "restart" => Some(Self::Restart),
            "ignore" => Some(Self::Ignore),
            "exit" => Some(Self::Exit),
            "suicide" | "terminate" => Some(Self::Suicide),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "Restart",
            Self::Ignore => "Ignore",
            Self::Exit => "Exit",
            Self::Suicide => "Suicide",
        }
    }
}

/// Exit code to action mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitPolicy {
    /// Entry used when no code-specific one matches
    pub default: Option<ExitAction>,
    pub by_code: BTreeMap<i32, ExitAction>,
}

impl ExitPolicy {
    /// Exact code, then the default entry, then restart
    pub fn action_for(&self, code: i32) -> ExitAction {
        self.by_code
            .get(&code)
            .copied()
            .or(self.default)
            .unwrap_or(ExitAction::Restart)
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_code.is_empty()
    }
}

/// Scheduling priority of the child process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessPriority {
    Realtime,
    High,
    AboveNormal,
    #[default]
    Normal,
    BelowNormal,
    Idle,
}

impl ProcessPriority {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        let s = s.trim_end_matches("_priority_class").replace('_', "-");
        match s.as_str() {
            "realtime" => Some(Self::Realtime),
            "high" => Some(Self::High),
            "above-normal" | "abovenormal" => Some(Self::AboveNormal),
            "normal" => Some(Self::Normal),
            "below-normal" | "belownormal" => Some(Self::BelowNormal),
            "idle" => Some(Self::Idle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::High => "high",
            Self::AboveNormal => "above-normal",
            Self::Normal => "normal",
            Self::BelowNormal => "below-normal",
            Self::Idle => "idle",
        }
    }

    /// Windows priority class constant
    pub fn class(&self) -> u32 {
        match self {
            Self::Realtime => 0x0000_0100,
            Self::High => 0x0000_0080,
            Self::AboveNormal => 0x0000_8000,
            Self::Normal => 0x0000_0020,
            Self::BelowNormal => 0x0000_4000,
            Self::Idle => 0x0000_0040,
        }
    }

    pub fn from_class(class: u32) -> Option<Self> {
        [
            Self::Realtime,
            Self::High,
            Self::AboveNormal,
            Self::Normal,
            Self::BelowNormal,
            Self::Idle,
        ]
        .into_iter()
        .find(|p| p.class() == class)
    }

    /// Equivalent nice(2) value
    pub fn nice(&self) -> i32 {
        match self {
            Self::Realtime => -20,
            Self::High => -10,
            Self::AboveNormal => -5,
            Self::Normal => 0,
            Self::BelowNormal => 5,
            Self::Idle => 19,
        }
    }
}

/// Principal the service runs as
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Account {
    #[default]
    LocalSystem,
    User(String),
}

impl Account {
    pub const LOCAL_SYSTEM: &'static str = "LocalSystem";

    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty()
            || s.eq_ignore_ascii_case(Self::LOCAL_SYSTEM)
            || s.eq_ignore_ascii_case("root")
        {
            Self::LocalSystem
        } else {
            Self::User(s.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::LocalSystem => Self::LOCAL_SYSTEM,
            Self::User(name) => name,
        }
    }
}

bitflags::bitflags! {
    /// Termination phases to leave out when stopping the child
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
    pub struct StopMethods: u32 {
        const CONSOLE = 1;
        const WINDOW = 2;
        const THREADS = 4;
        const TERMINATE = 8;
    }
}

/// Graduated shutdown settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopPolicy {
    pub console_delay: Duration,
    pub window_delay: Duration,
    pub threads_delay: Duration,
    pub kill_tree: bool,
    pub skip: StopMethods,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            console_delay: DEFAULT_KILL_CONSOLE_DELAY,
            window_delay: DEFAULT_KILL_WINDOW_DELAY,
            threads_delay: DEFAULT_KILL_THREADS_DELAY,
            kill_tree: true,
            skip: StopMethods::empty(),
        }
    }
}

impl StopPolicy {
    /// Upper bound of a full escalation
    pub fn total(&self) -> Duration {
        self.console_delay + self.window_delay + self.threads_delay
    }
}

/// Standard stream redirection, empty means not redirected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StdioConfig {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
}

/// Output file rotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationConfig {
    /// Rotate existing files before each start
    pub on_start: bool,
    /// Rotate while the child is running
    pub online: bool,
    /// Only rotate files older than this many seconds (0 = any age)
    pub seconds: u64,
    /// Only rotate files larger than this many bytes (0 = any size)
    pub bytes: u64,
}

/// Everything the host needs to launch the wrapped program
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchParameters {
    pub application: String,
    pub arguments: String,
    /// Empty means the application's directory
    pub directory: String,
    pub priority: ProcessPriority,
    pub exit: ExitPolicy,
    pub throttle: Duration,
    pub restart_delay: Duration,
    pub stop: StopPolicy,
    pub stdio: StdioConfig,
    pub rotation: RotationConfig,
    pub environment: Vec<(String, String)>,
}

impl LaunchParameters {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            arguments: String::new(),
            directory: String::new(),
            priority: ProcessPriority::Normal,
            exit: ExitPolicy::default(),
            throttle: DEFAULT_THROTTLE,
            restart_delay: Duration::ZERO,
            stop: StopPolicy::default(),
            stdio: StdioConfig::default(),
            rotation: RotationConfig::default(),
            environment: Vec::new(),
        }
    }
}

/// OS-level service metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceMetadata {
    pub display_name: String,
    pub description: String,
    pub start_type: StartType,
    pub account: Account,
    pub dependencies: Vec<String>,
}

/// Durable record for one managed service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceConfiguration {
    pub name: String,
    pub metadata: ServiceMetadata,
    pub parameters: LaunchParameters,
    /// Credential for a named account, handed to the OS and never stored
    #[serde(skip)]
    pub password: Option<String>,
}

impl ServiceConfiguration {
    pub fn new(name: impl Into<String>, application: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            metadata: ServiceMetadata {
                display_name: name.clone(),
                ..Default::default()
            },
            name,
            parameters: LaunchParameters::new(application),
            password: None,
        }
    }

    /// Display name, falling back to the identifier
    pub fn display_name(&self) -> &str {
        if self.metadata.display_name.is_empty() {
            &self.name
        } else {
            &self.metadata.display_name
        }
    }
}
