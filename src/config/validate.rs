//! Configuration validation
//!
//! Runs before any native resource is touched. All problems are collected
//! so the operator sees every one of them at once.

use std::path::Path;

use super::expand::expand;
use super::{Account, ServiceConfiguration};
use crate::error::ServiceError;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DISPLAY_NAME_LEN: usize = 256;
pub const MAX_PATH_LEN: usize = 260;
pub const MAX_ARGUMENTS_LEN: usize = 32768;
pub const MAX_DIRECTORY_LEN: usize = 248;

const INVALID_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Validate a service identifier on its own
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Service name is required".to_string());
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(format!("Service name exceeds {} characters", MAX_NAME_LEN));
    }
    if let Some(c) = name
        .chars()
        .find(|c| INVALID_NAME_CHARS.contains(c) || c.is_control())
    {
        return Err(format!("Service name contains invalid character {:?}", c));
    }
    Ok(())
}

/// Check everything required before installation
pub fn validate(config: &ServiceConfiguration) -> Result<(), ServiceError> {
    let mut errors = Vec::new();

    if let Err(e) = validate_name(&config.name) {
        errors.push(e);
    }

    if config.metadata.display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
        errors.push(format!(
            "Display name exceeds {} characters",
            MAX_DISPLAY_NAME_LEN
        ));
    }

    let params = &config.parameters;
    if params.application.trim().is_empty() {
        errors.push("Executable path is required".to_string());
    } else {
        let application = expand(&params.application);
        if application.chars().count() > MAX_PATH_LEN {
            errors.push(format!("Executable path exceeds {} characters", MAX_PATH_LEN));
        } else if !Path::new(&application).is_file() {
            errors.push(format!("Executable not found: {}", application));
        }
    }

    if params.arguments.chars().count() > MAX_ARGUMENTS_LEN {
        errors.push(format!("Arguments exceed {} characters", MAX_ARGUMENTS_LEN));
    }

    if !params.directory.trim().is_empty() {
        let directory = expand(&params.directory);
        if directory.chars().count() > MAX_DIRECTORY_LEN {
            errors.push(format!(
                "Working directory exceeds {} characters",
                MAX_DIRECTORY_LEN
            ));
        } else if !Path::new(&directory).is_dir() {
            errors.push(format!("Working directory not found: {}", directory));
        }
    }

    if let Account::User(user) = &config.metadata.account {
        if user.trim().is_empty() {
            errors.push("Account name is empty".to_string());
        }
    } else if config.password.is_some() {
        errors.push("A password is only valid with a named account".to_string());
    }

    for dep in &config.metadata.dependencies {
        if let Err(e) = validate_name(dep) {
            errors.push(format!("Dependency {:?}: {}", dep, e));
        }
    }

    for (key, _) in &params.environment {
        if key.is_empty() || key.contains('=') {
            errors.push(format!("Invalid environment variable name {:?}", key));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::InvalidConfiguration(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(config: &ServiceConfiguration) -> Vec<String> {
        match validate(config) {
            Err(ServiceError::InvalidConfiguration(msgs)) => msgs,
            other => panic!("expected invalid configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = ServiceConfiguration::new("echoer", "/bin/sh");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("my-service_1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a:b").is_err());
        assert!(validate_name("tab\there").is_err());
        assert!(validate_name(&"x".repeat(256)).is_ok());
        assert!(validate_name(&"x".repeat(257)).is_err());
    }

    #[test]
    fn test_missing_executable() {
        let config = ServiceConfiguration::new("echoer", "/nonexistent/bin/app");
        let msgs = messages(&config);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("not found"));
    }

    #[test]
    fn test_executable_is_directory() {
        let config = ServiceConfiguration::new("echoer", "/");
        assert_eq!(messages(&config).len(), 1);
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = ServiceConfiguration::new("bad|name", "");
        config.parameters.arguments = "a".repeat(MAX_ARGUMENTS_LEN + 1);
        config.parameters.directory = "/nonexistent/dir".into();
        config.password = Some("secret".into());
        let msgs = messages(&config);
        assert_eq!(msgs.len(), 5, "{:?}", msgs);
    }

    #[test]
    fn test_expanded_paths() {
        std::env::set_var("SVCWRAP_VALIDATE_BIN", "/bin");
        let mut config = ServiceConfiguration::new("echoer", "%SVCWRAP_VALIDATE_BIN%/sh");
        config.parameters.directory = "${SVCWRAP_VALIDATE_BIN}".into();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_bad_environment_name() {
        let mut config = ServiceConfiguration::new("echoer", "/bin/sh");
        config.parameters.environment.push(("A=B".into(), "c".into()));
        assert_eq!(messages(&config).len(), 1);
    }
}
