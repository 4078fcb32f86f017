//! Durable per-service configuration store
//!
//! Every service owns one container keyed by its identifier. Launch
//! parameters live in a nested `Parameters` container so either half can be
//! re-read on its own. The value names are shared by all backends:
//!
//! ```text
//! <id>                  DisplayName Description Start DelayedAutostart
//! │                     ObjectName DependOnService
//! └── Parameters        Application AppParameters AppDirectory AppPriority
//!     │                 AppThrottle AppRestartDelay AppStopMethod* ...
//!     └── AppExit       (default) <exit code> = Restart|Ignore|Exit|Suicide
//! ```

#[cfg(unix)]
pub mod file;
#[cfg(windows)]
pub mod registry;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::{
    ExitAction, ExitPolicy, LaunchParameters, ProcessPriority, ServiceConfiguration,
    ServiceMetadata, StopMethods,
};
use crate::error::{OperationReport, ServiceError, Warning};

#[cfg(unix)]
pub use file::FileStore;
#[cfg(windows)]
pub use registry::RegistryStore;

pub const APPLICATION: &str = "Application";
pub const APP_PARAMETERS: &str = "AppParameters";
pub const APP_DIRECTORY: &str = "AppDirectory";
pub const APP_PRIORITY: &str = "AppPriority";
pub const APP_THROTTLE: &str = "AppThrottle";
pub const APP_RESTART_DELAY: &str = "AppRestartDelay";
pub const APP_STOP_METHOD_SKIP: &str = "AppStopMethodSkip";
pub const APP_STOP_METHOD_CONSOLE: &str = "AppStopMethodConsole";
pub const APP_STOP_METHOD_WINDOW: &str = "AppStopMethodWindow";
pub const APP_STOP_METHOD_THREADS: &str = "AppStopMethodThreads";
pub const APP_KILL_PROCESS_TREE: &str = "AppKillProcessTree";
pub const APP_STDIN: &str = "AppStdin";
pub const APP_STDOUT: &str = "AppStdout";
pub const APP_STDERR: &str = "AppStderr";
pub const APP_ROTATE_FILES: &str = "AppRotateFiles";
pub const APP_ROTATE_ONLINE: &str = "AppRotateOnline";
pub const APP_ROTATE_SECONDS: &str = "AppRotateSeconds";
pub const APP_ROTATE_BYTES: &str = "AppRotateBytes";
pub const APP_ROTATE_BYTES_HIGH: &str = "AppRotateBytesHigh";
pub const APP_ENVIRONMENT_EXTRA: &str = "AppEnvironmentExtra";
pub const APP_EXIT: &str = "AppExit";

pub const DISPLAY_NAME: &str = "DisplayName";
pub const DESCRIPTION: &str = "Description";
pub const START: &str = "Start";
pub const DELAYED_AUTOSTART: &str = "DelayedAutostart";
pub const OBJECT_NAME: &str = "ObjectName";
pub const DEPEND_ON_SERVICE: &str = "DependOnService";

/// Value types a store understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    /// Expandable string, references are resolved by the reader
    Text(String),
    Number(u32),
    List(Vec<String>),
}

/// One named value of the parameters container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterValue {
    pub name: &'static str,
    pub value: StoredValue,
    /// A failed write of this value aborts installation
    pub critical: bool,
}

impl ParameterValue {
    fn critical(name: &'static str, value: &str) -> Self {
        Self {
            name,
            value: StoredValue::Text(value.to_string()),
            critical: true,
        }
    }

    fn text(name: &'static str, value: &str) -> Self {
        Self {
            name,
            value: StoredValue::Text(value.to_string()),
            critical: false,
        }
    }

    fn number(name: &'static str, value: u32) -> Self {
        Self {
            name,
            value: StoredValue::Number(value),
            critical: false,
        }
    }
}

/// Durable key/value persistence of service configurations
pub trait ConfigStore: Send + Sync {
    /// Write the launch parameters. Critical value failures are errors,
    /// the other failures are returned as warnings.
    fn write_parameters(&self, name: &str, params: &LaunchParameters)
        -> Result<Vec<Warning>, ServiceError>;

    fn write_metadata(&self, name: &str, metadata: &ServiceMetadata) -> Result<(), ServiceError>;

    fn read_parameters(&self, name: &str) -> Result<LaunchParameters, ServiceError>;

    fn read_metadata(&self, name: &str) -> Result<ServiceMetadata, ServiceError>;

    /// Remove the whole container, absent is not an error
    fn delete(&self, name: &str) -> Result<(), ServiceError>;

    /// Identifiers of services that carry launch parameters
    fn list_all(&self) -> Result<BTreeSet<String>, ServiceError>;

    fn write(&self, config: &ServiceConfiguration) -> Result<OperationReport, ServiceError> {
        let mut report = OperationReport::new();
        report.extend(self.write_parameters(&config.name, &config.parameters)?);
        if let Err(e) = self.write_metadata(&config.name, &config.metadata) {
            report.warn("write service metadata", &e);
        }
        Ok(report)
    }

    fn read(&self, name: &str) -> Result<ServiceConfiguration, ServiceError> {
        let parameters = self.read_parameters(name)?;
        let metadata = match self.read_metadata(name) {
            Ok(metadata) => metadata,
            Err(e) if e.is_not_found() => ServiceMetadata {
                display_name: name.to_string(),
                ..Default::default()
            },
            Err(e) => return Err(e),
        };
        Ok(ServiceConfiguration {
            name: name.to_string(),
            metadata,
            parameters,
            password: None,
        })
    }
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

/// Flatten launch parameters into named values
pub fn encode_parameters(params: &LaunchParameters) -> Vec<ParameterValue> {
    let rotation = &params.rotation;
    let mut values = vec![
        ParameterValue::critical(APPLICATION, &params.application),
        ParameterValue::critical(APP_PARAMETERS, &params.arguments),
        ParameterValue::critical(APP_DIRECTORY, &params.directory),
        ParameterValue::number(APP_PRIORITY, params.priority.class()),
        ParameterValue::number(APP_THROTTLE, millis(params.throttle)),
        ParameterValue::number(APP_RESTART_DELAY, millis(params.restart_delay)),
        ParameterValue::number(APP_STOP_METHOD_SKIP, params.stop.skip.bits()),
        ParameterValue::number(APP_STOP_METHOD_CONSOLE, millis(params.stop.console_delay)),
        ParameterValue::number(APP_STOP_METHOD_WINDOW, millis(params.stop.window_delay)),
        ParameterValue::number(APP_STOP_METHOD_THREADS, millis(params.stop.threads_delay)),
        ParameterValue::number(APP_KILL_PROCESS_TREE, u32::from(params.stop.kill_tree)),
        ParameterValue::text(APP_STDIN, &params.stdio.stdin),
        ParameterValue::text(APP_STDOUT, &params.stdio.stdout),
        ParameterValue::text(APP_STDERR, &params.stdio.stderr),
        ParameterValue::number(APP_ROTATE_FILES, u32::from(rotation.on_start)),
        ParameterValue::number(APP_ROTATE_ONLINE, u32::from(rotation.online)),
        ParameterValue::number(APP_ROTATE_SECONDS, u32::try_from(rotation.seconds).unwrap_or(u32::MAX)),
        ParameterValue::number(APP_ROTATE_BYTES, (rotation.bytes & 0xffff_ffff) as u32),
    ];
    if rotation.bytes > u64::from(u32::MAX) {
        values.push(ParameterValue::number(APP_ROTATE_BYTES_HIGH, (rotation.bytes >> 32) as u32));
    }
    values.push(ParameterValue {
        name: APP_ENVIRONMENT_EXTRA,
        value: StoredValue::List(
            params
                .environment
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        ),
        critical: false,
    });
    values
}

/// Default entry and per-code entries of the exit policy
pub fn encode_exit_policy(policy: &ExitPolicy) -> (Option<&'static str>, Vec<(String, &'static str)>) {
    let default = policy.default.map(|a| a.as_str());
    let by_code = policy
        .by_code
        .iter()
        .map(|(code, action)| (code.to_string(), action.as_str()))
        .collect();
    (default, by_code)
}

/// Rebuild an exit policy, unknown actions are read as `Ignore`
pub fn decode_exit_policy<'a, I>(service: &str, default: Option<&str>, entries: I) -> ExitPolicy
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let action = |raw: &str| {
        ExitAction::parse(raw).unwrap_or_else(|| {
            log::warn!("{}: unknown exit action {:?}, treating as Ignore", service, raw);
            ExitAction::Ignore
        })
    };

    let mut by_code = BTreeMap::new();
    for (key, raw) in entries {
        let key = key.trim();
        let code = key
            .parse::<i32>()
            .ok()
            .or_else(|| key.parse::<u32>().ok().map(|c| c as i32));
        match code {
            Some(code) => {
                by_code.insert(code, action(raw));
            }
            None => log::warn!("{}: ignoring exit action for non-numeric code {:?}", service, key),
        }
    }

    ExitPolicy {
        default: default.filter(|d| !d.trim().is_empty()).map(action),
        by_code,
    }
}

/// Typed access to the values of one parameters container
pub struct ValueReader<'a, F> {
    service: &'a str,
    lookup: F,
}

impl<'a, F> ValueReader<'a, F>
where
    F: Fn(&str) -> Option<StoredValue>,
{
    pub fn new(service: &'a str, lookup: F) -> Self {
        Self { service, lookup }
    }

    fn invalid(&self, key: &str, value: &str) -> ServiceError {
        ServiceError::InvalidConfiguration(vec![format!(
            "{}: invalid value {:?} for {}",
            self.service, value, key
        )])
    }

    pub fn text(&self, key: &str) -> String {
        match (self.lookup)(key) {
            Some(StoredValue::Text(s)) => s,
            Some(StoredValue::Number(n)) => n.to_string(),
            Some(StoredValue::List(items)) => items.join(" "),
            None => String::new(),
        }
    }

    pub fn number(&self, key: &str) -> Result<Option<u32>, ServiceError> {
        match (self.lookup)(key) {
            Some(StoredValue::Number(n)) => Ok(Some(n)),
            Some(StoredValue::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(StoredValue::Text(s)) => {
                let t = s.trim();
                let parsed = match t.strip_prefix("0x") {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => t.parse::<u32>(),
                };
                parsed.map(Some).map_err(|_| self.invalid(key, &s))
            }
            Some(StoredValue::List(items)) => Err(self.invalid(key, &items.join(","))),
            None => Ok(None),
        }
    }

    pub fn millis(&self, key: &str, default: Duration) -> Result<Duration, ServiceError> {
        Ok(self
            .number(key)?
            .map(|ms| Duration::from_millis(u64::from(ms)))
            .unwrap_or(default))
    }

    pub fn flag(&self, key: &str, default: bool) -> Result<bool, ServiceError> {
        Ok(self.number(key)?.map(|n| n != 0).unwrap_or(default))
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        match (self.lookup)(key) {
            Some(StoredValue::List(items)) => items,
            Some(StoredValue::Text(s)) if !s.is_empty() => vec![s],
            _ => Vec::new(),
        }
    }
}

/// Rebuild launch parameters from stored values
pub fn decode_parameters<F>(
    service: &str,
    lookup: F,
    exit: ExitPolicy,
) -> Result<LaunchParameters, ServiceError>
where
    F: Fn(&str) -> Option<StoredValue>,
{
    let r = ValueReader::new(service, lookup);
    let mut params = LaunchParameters::new(r.text(APPLICATION));
    params.arguments = r.text(APP_PARAMETERS);
    params.directory = r.text(APP_DIRECTORY);

    if let Some(class) = r.number(APP_PRIORITY)? {
        params.priority = ProcessPriority::from_class(class)
            .ok_or_else(|| r.invalid(APP_PRIORITY, &class.to_string()))?;
    }

    params.exit = exit;
    params.throttle = r.millis(APP_THROTTLE, params.throttle)?;
    params.restart_delay = r.millis(APP_RESTART_DELAY, params.restart_delay)?;

    let stop = &mut params.stop;
    if let Some(bits) = r.number(APP_STOP_METHOD_SKIP)? {
        stop.skip = StopMethods::from_bits_truncate(bits);
    }
    stop.console_delay = r.millis(APP_STOP_METHOD_CONSOLE, stop.console_delay)?;
    stop.window_delay = r.millis(APP_STOP_METHOD_WINDOW, stop.window_delay)?;
    stop.threads_delay = r.millis(APP_STOP_METHOD_THREADS, stop.threads_delay)?;
    stop.kill_tree = r.flag(APP_KILL_PROCESS_TREE, stop.kill_tree)?;

    params.stdio.stdin = r.text(APP_STDIN);
    params.stdio.stdout = r.text(APP_STDOUT);
    params.stdio.stderr = r.text(APP_STDERR);

    let rotation = &mut params.rotation;
    rotation.on_start = r.flag(APP_ROTATE_FILES, false)?;
    rotation.online = r.flag(APP_ROTATE_ONLINE, false)?;
    rotation.seconds = u64::from(r.number(APP_ROTATE_SECONDS)?.unwrap_or(0));
    let low = u64::from(r.number(APP_ROTATE_BYTES)?.unwrap_or(0));
    let high = u64::from(r.number(APP_ROTATE_BYTES_HIGH)?.unwrap_or(0));
    rotation.bytes = (high << 32) | low;

    for entry in r.list(APP_ENVIRONMENT_EXTRA) {
        match entry.split_once('=') {
            Some((k, v)) if !k.is_empty() => params.environment.push((k.to_string(), v.to_string())),
            _ => log::warn!("{}: ignoring malformed environment entry {:?}", service, entry),
        }
    }

    Ok(params)
}
