//! Application settings
//!
//! Read from the INI file named by `SVCWRAP_CONFIG`, else the first of
//! `/etc/svcwrap/svcwrap.conf` and `<user config dir>/svcwrap/svcwrap.conf`
//! that exists, else built-in defaults.
//!
//! ```ini
//! [Manager]
//! StoreDir=/etc/svcwrap/services
//! UnitDir=/etc/systemd/system
//! LogDir=/var/log/svcwrap
//! DefaultTimeout=30s
//! MonitorInterval=250ms
//! LogLevel=info
//!
//! [Defaults]
//! Throttle=1500ms
//! KillConsoleDelay=1500ms
//! KillWindowDelay=1500ms
//! KillThreadsDelay=1000ms
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;

use crate::config::{
    LaunchParameters, DEFAULT_KILL_CONSOLE_DELAY, DEFAULT_KILL_THREADS_DELAY,
    DEFAULT_KILL_WINDOW_DELAY, DEFAULT_THROTTLE,
};
use crate::ini::{self, IniError, ParsedFile};

pub const CONFIG_ENV: &str = "SVCWRAP_CONFIG";
pub const SYSTEM_CONFIG: &str = "/etc/svcwrap/svcwrap.conf";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(250);

const MANAGER: &str = "[Manager]";
const DEFAULTS: &str = "[Defaults]";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{path}: {source}")]
    Ini {
        path: String,
        #[source]
        source: IniError,
    },

    #[error("Settings file {0} named by SVCWRAP_CONFIG does not exist")]
    Missing(String),
}

/// Defaults applied to newly installed services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDefaults {
    pub throttle: Duration,
    pub kill_console_delay: Duration,
    pub kill_window_delay: Duration,
    pub kill_threads_delay: Duration,
}

impl Default for LaunchDefaults {
    fn default() -> Self {
        Self {
            throttle: DEFAULT_THROTTLE,
            kill_console_delay: DEFAULT_KILL_CONSOLE_DELAY,
            kill_window_delay: DEFAULT_KILL_WINDOW_DELAY,
            kill_threads_delay: DEFAULT_KILL_THREADS_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Root of the file-backed configuration store
    pub store_dir: PathBuf,
    /// Where unit files are written
    pub unit_dir: PathBuf,
    /// Host-mode log files
    pub log_dir: PathBuf,
    /// Bound for start/stop waits and service removal
    pub default_timeout: Duration,
    pub monitor_interval: Duration,
    pub log_level: LevelFilter,
    pub defaults: LaunchDefaults,
}

#[cfg(windows)]
fn program_data() -> PathBuf {
    std::env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
        .join("svcwrap")
}

impl Default for Settings {
    #[cfg(not(windows))]
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/etc/svcwrap/services"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            log_dir: PathBuf::from("/var/log/svcwrap"),
            default_timeout: DEFAULT_TIMEOUT,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            log_level: LevelFilter::Info,
            defaults: LaunchDefaults::default(),
        }
    }

    #[cfg(windows)]
    fn default() -> Self {
        Self {
            store_dir: program_data().join("services"),
            unit_dir: PathBuf::new(),
            log_dir: program_data().join("logs"),
            default_timeout: DEFAULT_TIMEOUT,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            log_level: LevelFilter::Info,
            defaults: LaunchDefaults::default(),
        }
    }
}

fn duration(file: &ParsedFile, section: &str, key: &str, default: Duration) -> Result<Duration, IniError> {
    match ini::get(file, section, key) {
        None => Ok(default),
        Some(raw) => ini::parse_duration(&raw).ok_or(IniError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn path(file: &ParsedFile, key: &str, default: PathBuf) -> PathBuf {
    ini::get(file, MANAGER, key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

impl Settings {
    /// Settings from the standard locations
    pub fn load() -> Result<Self, SettingsError> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            let explicit = PathBuf::from(explicit);
            if !explicit.is_file() {
                return Err(SettingsError::Missing(explicit.display().to_string()));
            }
            return Self::from_path(&explicit);
        }

        let mut candidates = vec![PathBuf::from(SYSTEM_CONFIG)];
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("svcwrap").join("svcwrap.conf"));
        }
        match candidates.iter().find(|p| p.is_file()) {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        let wrap = |source| SettingsError::Ini {
            path: path.display().to_string(),
            source,
        };
        let parsed = ini::parse_path(path).map_err(wrap)?;
        let settings = Self::from_parsed(&parsed).map_err(wrap)?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn parse(content: &str) -> Result<Self, IniError> {
        Self::from_parsed(&ini::parse_file(content)?)
    }

    fn from_parsed(file: &ParsedFile) -> Result<Self, IniError> {
        let base = Self::default();
        let log_level = match ini::get(file, MANAGER, "LogLevel") {
            None => base.log_level,
            Some(raw) => raw.parse().map_err(|_| IniError::InvalidValue {
                key: "LogLevel".to_string(),
                value: raw,
            })?,
        };
        let d = &base.defaults;
        Ok(Self {
            store_dir: path(file, "StoreDir", base.store_dir.clone()),
            unit_dir: path(file, "UnitDir", base.unit_dir.clone()),
            log_dir: path(file, "LogDir", base.log_dir.clone()),
            default_timeout: duration(file, MANAGER, "DefaultTimeout", base.default_timeout)?,
            monitor_interval: duration(file, MANAGER, "MonitorInterval", base.monitor_interval)?,
            log_level,
            defaults: LaunchDefaults {
                throttle: duration(file, DEFAULTS, "Throttle", d.throttle)?,
                kill_console_delay: duration(file, DEFAULTS, "KillConsoleDelay", d.kill_console_delay)?,
                kill_window_delay: duration(file, DEFAULTS, "KillWindowDelay", d.kill_window_delay)?,
                kill_threads_delay: duration(file, DEFAULTS, "KillThreadsDelay", d.kill_threads_delay)?,
            },
        })
    }

    /// Launch parameters for `application` with the configured defaults
    pub fn launch_parameters(&self, application: impl Into<String>) -> LaunchParameters {
        let mut params = LaunchParameters::new(application);
        params.throttle = self.defaults.throttle;
        params.stop.console_delay = self.defaults.kill_console_delay;
        params.stop.window_delay = self.defaults.kill_window_delay;
        params.stop.threads_delay = self.defaults.kill_threads_delay;
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.default_timeout, Duration::from_secs(30));
        assert_eq!(settings.monitor_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_parse_all_keys() {
        let settings = Settings::parse(
            "[Manager]\nstoredir=/srv/store\nUnitDir=/run/units\nLogDir=/srv/log\n\
             DefaultTimeout=2min\nMonitorInterval=100ms\nLogLevel=debug\n\
             [Defaults]\nThrottle=5s\nKillConsoleDelay=200ms\nKillWindowDelay=300ms\nKillThreadsDelay=1\n",
        )
        .unwrap();
        assert_eq!(settings.store_dir, PathBuf::from("/srv/store"));
        assert_eq!(settings.unit_dir, PathBuf::from("/run/units"));
        assert_eq!(settings.log_dir, PathBuf::from("/srv/log"));
        assert_eq!(settings.default_timeout, Duration::from_secs(120));
        assert_eq!(settings.monitor_interval, Duration::from_millis(100));
        assert_eq!(settings.log_level, LevelFilter::Debug);

        let params = settings.launch_parameters("/bin/app");
        assert_eq!(params.throttle, Duration::from_secs(5));
        assert_eq!(params.stop.console_delay, Duration::from_millis(200));
        assert_eq!(params.stop.window_delay, Duration::from_millis(300));
        assert_eq!(params.stop.threads_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_values() {
        let err = Settings::parse("[Manager]\nDefaultTimeout=soon\n").unwrap_err();
        assert!(matches!(err, IniError::InvalidValue { key, .. } if key == "DefaultTimeout"));

        let err = Settings::parse("[Manager]\nLogLevel=loud\n").unwrap_err();
        assert!(matches!(err, IniError::InvalidValue { key, .. } if key == "LogLevel"));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svcwrap.conf");
        std::fs::write(&path, "[Manager]\nLogDir=/tmp/x\n").unwrap();
        assert_eq!(Settings::from_path(&path).unwrap().log_dir, PathBuf::from("/tmp/x"));

        std::fs::write(&path, "[Manager]\n[Manager]\n").unwrap();
        assert!(matches!(
            Settings::from_path(&path),
            Err(SettingsError::Ini { source: IniError::DuplicateSection(_), .. })
        ));
    }
}
