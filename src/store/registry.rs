//! Registry-backed configuration store
//!
//! `HKLM\SYSTEM\CurrentControlSet\Services\<id>` is the service key the SCM
//! creates; launch parameters go to its `Parameters` subkey. Strings are
//! written as `REG_EXPAND_SZ`, numbers as `REG_DWORD`.

use std::collections::BTreeSet;
use std::io;

use winreg::enums::{
    RegType, HKEY_LOCAL_MACHINE, KEY_ALL_ACCESS, KEY_READ, REG_DWORD, REG_EXPAND_SZ,
    REG_MULTI_SZ,
};
use winreg::{RegKey, RegValue};

use super::{
    decode_exit_policy, decode_parameters, encode_exit_policy, encode_parameters, ConfigStore,
    StoredValue, APPLICATION, APP_EXIT, DELAYED_AUTOSTART, DEPEND_ON_SERVICE, DESCRIPTION,
    DISPLAY_NAME, OBJECT_NAME, START,
};
use crate::config::validate::validate_name;
use crate::config::{Account, LaunchParameters, ServiceMetadata, StartType};
use crate::error::{ServiceError, Warning};

const SERVICES_KEY: &str = r"SYSTEM\CurrentControlSet\Services";
const PARAMETERS_KEY: &str = "Parameters";

#[derive(Debug, Default)]
pub struct RegistryStore;

impl RegistryStore {
    pub fn new() -> Self {
        Self
    }

    fn service_path(name: &str) -> Result<String, ServiceError> {
        validate_name(name).map_err(ServiceError::InvalidParameter)?;
        Ok(format!(r"{}\{}", SERVICES_KEY, name))
    }

    fn open(path: &str, name: &str, access: u32) -> Result<RegKey, ServiceError> {
        RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey_with_flags(path, access)
            .map_err(|e| ServiceError::from_io("open registry key", name, &e))
    }

    fn create(path: &str, name: &str) -> Result<RegKey, ServiceError> {
        RegKey::predef(HKEY_LOCAL_MACHINE)
            .create_subkey_with_flags(path, KEY_ALL_ACCESS)
            .map(|(key, _)| key)
            .map_err(|e| ServiceError::from_io("create registry key", name, &e))
    }
}

fn expand_sz(value: &str) -> RegValue {
    let mut bytes = Vec::with_capacity((value.len() + 1) * 2);
    for unit in value.encode_utf16().chain(std::iter::once(0)) {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    RegValue {
        bytes,
        vtype: REG_EXPAND_SZ,
    }
}

fn set(key: &RegKey, name: &str, value: &StoredValue) -> io::Result<()> {
    match value {
        StoredValue::Text(s) => key.set_raw_value(name, &expand_sz(s)),
        StoredValue::Number(n) => key.set_value(name, n),
        StoredValue::List(items) => {
            if items.is_empty() {
                match key.delete_value(name) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                }
            } else {
                key.set_value(name, items)
            }
        }
    }
}

fn get(key: &RegKey, name: &str) -> Option<StoredValue> {
    let raw = key.get_raw_value(name).ok()?;
    match raw.vtype {
        REG_DWORD => key.get_value::<u32, _>(name).ok().map(StoredValue::Number),
        REG_MULTI_SZ => key.get_value::<Vec<String>, _>(name).ok().map(StoredValue::List),
        RegType::REG_SZ | REG_EXPAND_SZ => key.get_value::<String, _>(name).ok().map(StoredValue::Text),
        _ => None,
    }
}

impl ConfigStore for RegistryStore {
    fn write_parameters(
        &self,
        name: &str,
        params: &LaunchParameters,
    ) -> Result<Vec<Warning>, ServiceError> {
        let path = format!(r"{}\{}", Self::service_path(name)?, PARAMETERS_KEY);
        let key = Self::create(&path, name)?;
        let mut warnings = Vec::new();

        for value in encode_parameters(params) {
            if let Err(e) = set(&key, value.name, &value.value) {
                let err = ServiceError::from_io("write registry value", value.name, &e);
                if value.critical {
                    return Err(err);
                }
                log::warn!("{}: failed to write {}: {}", name, value.name, err);
                warnings.push(Warning::new(format!("write {}", value.name), &err));
            }
        }

        let exit_result = (|| -> io::Result<()> {
            match key.delete_subkey_all(APP_EXIT) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
            let (default, by_code) = encode_exit_policy(&params.exit);
            let (exit_key, _) = key.create_subkey(APP_EXIT)?;
            if let Some(default) = default {
                exit_key.set_value("", &default.to_string())?;
            }
            for (code, action) in by_code {
                exit_key.set_value(&code, &action.to_string())?;
            }
            Ok(())
        })();
        if let Err(e) = exit_result {
            let err = ServiceError::from_io("write exit actions", name, &e);
            log::warn!("{}: {}", name, err);
            warnings.push(Warning::new("write AppExit", &err));
        }

        Ok(warnings)
    }

    /// Display name, start type and account belong to the SCM, only the
    /// values it has no API for are written here.
    fn write_metadata(&self, name: &str, metadata: &ServiceMetadata) -> Result<(), ServiceError> {
        let key = Self::open(&Self::service_path(name)?, name, KEY_ALL_ACCESS)?;
        key.set_value(DESCRIPTION, &metadata.description)
            .and_then(|_| {
                key.set_value(
                    DELAYED_AUTOSTART,
                    &u32::from(metadata.start_type == StartType::DelayedAuto),
                )
            })
            .map_err(|e| ServiceError::from_io("write service metadata", name, &e))
    }

    fn read_parameters(&self, name: &str) -> Result<LaunchParameters, ServiceError> {
        let path = format!(r"{}\{}", Self::service_path(name)?, PARAMETERS_KEY);
        let key = Self::open(&path, name, KEY_READ)?;

        let exit = match key.open_subkey_with_flags(APP_EXIT, KEY_READ) {
            Ok(exit_key) => {
                let default: Option<String> = exit_key.get_value("").ok();
                let entries: Vec<(String, String)> = exit_key
                    .enum_values()
                    .flatten()
                    .filter(|(value_name, _)| !value_name.is_empty())
                    .filter_map(|(value_name, _)| {
                        exit_key
                            .get_value::<String, _>(&value_name)
                            .ok()
                            .map(|action| (value_name, action))
                    })
                    .collect();
                decode_exit_policy(
                    name,
                    default.as_deref(),
                    entries.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                )
            }
            Err(_) => Default::default(),
        };

        decode_parameters(name, |value_name| get(&key, value_name), exit)
    }

    fn read_metadata(&self, name: &str) -> Result<ServiceMetadata, ServiceError> {
        let key = Self::open(&Self::service_path(name)?, name, KEY_READ)?;
        let text = |value_name: &str| key.get_value::<String, _>(value_name).unwrap_or_default();

        let start: u32 = key.get_value(START).unwrap_or(2);
        let delayed: u32 = key.get_value(DELAYED_AUTOSTART).unwrap_or(0);
        let start_type = match (start, delayed) {
            (2, 0) => StartType::Auto,
            (2, _) => StartType::DelayedAuto,
            (4, _) => StartType::Disabled,
            _ => StartType::Demand,
        };

        Ok(ServiceMetadata {
            display_name: text(DISPLAY_NAME),
            description: text(DESCRIPTION),
            start_type,
            account: Account::parse(&text(OBJECT_NAME)),
            dependencies: key.get_value(DEPEND_ON_SERVICE).unwrap_or_default(),
        })
    }

    /// Only the `Parameters` subtree is ours, the service key itself goes
    /// away with the SCM entry.
    fn delete(&self, name: &str) -> Result<(), ServiceError> {
        let key = match Self::open(&Self::service_path(name)?, name, KEY_ALL_ACCESS) {
            Ok(key) => key,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        match key.delete_subkey_all(PARAMETERS_KEY) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::from_io("delete configuration", name, &e)),
        }
    }

    fn list_all(&self) -> Result<BTreeSet<String>, ServiceError> {
        let services = Self::open(SERVICES_KEY, "Services", KEY_READ)?;
        let mut names = BTreeSet::new();
        for name in services.enum_keys().flatten() {
            let managed = services
                .open_subkey_with_flags(format!(r"{}\{}", name, PARAMETERS_KEY), KEY_READ)
                .and_then(|params| params.get_value::<String, _>(APPLICATION))
                .map(|application| !application.is_empty())
                .unwrap_or(false);
            if managed {
                names.insert(name);
            }
        }
        Ok(names)
    }
}
