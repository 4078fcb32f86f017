//! systemd unit files for managed services
//!
//! A service entry on Linux is `<unit dir>/<id>.service`. The unit only
//! knows how to launch the host (`svcwrap --run-as-service <id>`); the real
//! program lives in the configuration store. Fields systemd has no key for
//! are kept in `X-` keys so the entry reads back losslessly.

use std::time::Duration;

use super::{ConfigChange, ImagePath, NativeConfig, ServiceSpec};
use crate::config::{Account, StartType};
use crate::error::ServiceError;
use crate::ini::{self, IniWriter};

pub const DEFAULT_TARGET: &str = "multi-user.target";
const UNIT_NAME_MAX: usize = 255;
const HEADER: &str = "Managed by svcwrap, edits are overwritten on update";

/// `<id>.service`
pub fn unit_name(service: &str) -> String {
    format!("{}.service", service)
}

/// Dependency name as a unit name
fn dependency_unit(dep: &str) -> String {
    if dep.contains('.') {
        dep.to_string()
    } else {
        unit_name(dep)
    }
}

fn escape_specifiers(s: &str) -> String {
    s.replace('%', "%%")
}

fn unescape_specifiers(s: &str) -> String {
    s.replace("%%", "%")
}

/// Exec lines also expand `$VAR` and `${VAR}`
fn escape_command_line(s: &str) -> String {
    escape_specifiers(s).replace('$', "$$")
}

fn unescape_command_line(s: &str) -> String {
    unescape_specifiers(s).replace("$$", "$")
}

/// systemd refuses to load units whose names stray outside this set
pub fn check_unit_name(service: &str) -> Result<(), ServiceError> {
    if unit_name(service).len() > UNIT_NAME_MAX {
        return Err(ServiceError::InvalidParameter(format!(
            "{} is too long for a unit name",
            service
        )));
    }
    match service
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.' | '-')))
    {
        Some(c) => Err(ServiceError::InvalidParameter(format!(
            "{:?} is not allowed in a unit name ({})",
            c, service
        ))),
        None => Ok(()),
    }
}

/// Everything a managed unit file carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDefinition {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub start_type: StartType,
    pub image: ImagePath,
    pub account: Account,
    pub dependencies: Vec<String>,
    pub stop_timeout: Option<Duration>,
}

impl UnitDefinition {
    pub fn from_spec(spec: &ServiceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            display_name: spec.display_name.clone(),
            description: String::new(),
            start_type: spec.start_type,
            image: spec.image.clone(),
            account: spec.account.clone(),
            dependencies: spec.dependencies.clone(),
            stop_timeout: spec.stop_timeout,
        }
    }

    /// Apply an in-place change, fields left `None` stay as they are
    pub fn apply(&mut self, change: &ConfigChange) {
        if let Some(display_name) = &change.display_name {
            self.display_name = display_name.clone();
        }
        if let Some(start_type) = change.start_type {
            self.start_type = start_type;
        }
        if let Some(image) = &change.image {
            self.image = image.clone();
        }
        if let Some(account) = &change.account {
            self.account = account.clone();
        }
        if let Some(dependencies) = &change.dependencies {
            self.dependencies = dependencies.clone();
        }
        if let Some(timeout) = change.stop_timeout {
            self.stop_timeout = Some(timeout);
        }
        if let Some(description) = &change.description {
            self.description = description.clone();
        }
        match change.delayed_auto_start {
            Some(true) if self.start_type == StartType::Auto => {
                self.start_type = StartType::DelayedAuto;
            }
            Some(false) if self.start_type == StartType::DelayedAuto => {
                self.start_type = StartType::Auto;
            }
            _ => {}
        }
    }

    pub fn unit_name(&self) -> String {
        unit_name(&self.name)
    }

    /// Whether the unit should be linked into the default target
    pub fn wanted(&self) -> bool {
        self.start_type.is_automatic()
    }

    pub fn render(&self) -> String {
        let mut w = IniWriter::new();
        w.comment(HEADER);

        let title = if self.display_name.is_empty() { &self.name } else { &self.display_name };
        w.section("Unit")
            .raw_entry("Description", &escape_specifiers(&title.replace(['\n', '\r'], " ")))
            .entry("X-Description", &self.description)
            .entry("X-StartType", self.start_type.as_str());
        if !self.dependencies.is_empty() {
            let units: Vec<String> = self.dependencies.iter().map(|d| dependency_unit(d)).collect();
            let units = units.join(" ");
            w.raw_entry("Wants", &units).raw_entry("After", &units);
        }
        if self.start_type == StartType::DelayedAuto {
            w.raw_entry("After", DEFAULT_TARGET);
        }
        if self.start_type == StartType::Disabled {
            w.raw_entry("RefuseManualStart", "yes");
        }

        w.section("Service")
            .raw_entry("Type", "simple")
            .raw_entry("ExecStart", &escape_command_line(&self.image.to_shell_command_line()));
        if let Account::User(user) = &self.account {
            w.raw_entry("User", user);
        }
        // The host escalates on its own child, systemd only signals the host
        w.raw_entry("KillMode", "process");
        if let Some(timeout) = self.stop_timeout {
            w.raw_entry("TimeoutStopSec", &format!("{}ms", timeout.as_millis()));
        }
        w.raw_entry("Restart", "on-failure");

        w.section("Install").raw_entry("WantedBy", DEFAULT_TARGET);
        w.finish()
    }

    pub fn parse(name: &str, content: &str) -> Result<Self, ServiceError> {
        let invalid = |what: String| {
            ServiceError::InvalidConfiguration(vec![format!("{}: {}", unit_name(name), what)])
        };
        let parsed = ini::parse_file(content).map_err(|e| invalid(e.to_string()))?;

        let exec = ini::get_raw(&parsed, "[Service]", "ExecStart")
            .ok_or_else(|| invalid("missing ExecStart".to_string()))?;
        let image = ImagePath::parse_shell(&unescape_command_line(exec))
            .ok_or_else(|| invalid(format!("malformed ExecStart {:?}", exec)))?;

        let start_type = match ini::get(&parsed, "[Unit]", "X-StartType") {
            Some(raw) => StartType::parse(&raw)
                .ok_or_else(|| invalid(format!("invalid X-StartType {:?}", raw)))?,
            None => StartType::Demand,
        };

        let dependencies = ini::get_raw(&parsed, "[Unit]", "Wants")
            .map(|wants| {
                wants
                    .split_whitespace()
                    .map(|u| u.strip_suffix(".service").unwrap_or(u).to_string())
                    .collect()
            })
            .unwrap_or_default();

        let stop_timeout = ini::get_raw(&parsed, "[Service]", "TimeoutStopSec")
            .map(|raw| {
                ini::parse_duration(raw)
                    .ok_or_else(|| invalid(format!("invalid TimeoutStopSec {:?}", raw)))
            })
            .transpose()?;

        Ok(Self {
            name: name.to_string(),
            display_name: ini::get_raw(&parsed, "[Unit]", "Description")
                .map(unescape_specifiers)
                .unwrap_or_default(),
            description: ini::get(&parsed, "[Unit]", "X-Description").unwrap_or_default(),
            start_type,
            image,
            account: ini::get_raw(&parsed, "[Service]", "User")
                .map(Account::parse)
                .unwrap_or_default(),
            dependencies,
            stop_timeout,
        })
    }

    pub fn to_native(&self) -> NativeConfig {
        NativeConfig {
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            start_type: self.start_type,
            image: self.image.clone(),
            account: self.account.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}
