//! File-backed configuration store
//!
//! ```text
//! <root>/<id>/service.conf      [Service]      service metadata
//! <root>/<id>/Parameters.conf   [Parameters]   launch parameters
//!                               [AppExit]      exit-action policy
//! ```
//!
//! Each file is replaced atomically (temporary file + rename).

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{
    decode_exit_policy, decode_parameters, encode_exit_policy, encode_parameters, ConfigStore,
    StoredValue, APPLICATION, APP_EXIT, DELAYED_AUTOSTART, DEPEND_ON_SERVICE, DESCRIPTION,
    DISPLAY_NAME, OBJECT_NAME, START,
};
use crate::config::validate::validate_name;
use crate::config::{Account, LaunchParameters, ServiceMetadata, StartType};
use crate::error::{ServiceError, Warning};
use crate::ini::{self, IniWriter, ParsedFile};

const METADATA_FILE: &str = "service.conf";
const PARAMETERS_FILE: &str = "Parameters.conf";
const SERVICE_SECTION: &str = "[Service]";
const PARAMETERS_SECTION: &str = "[Parameters]";
const EXIT_SECTION: &str = "[AppExit]";
const EXIT_DEFAULT: &str = "Default";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn service_dir(&self, name: &str) -> Result<PathBuf, ServiceError> {
        if name == "." || name == ".." {
            return Err(ServiceError::InvalidParameter(format!("service name {:?}", name)));
        }
        validate_name(name).map_err(ServiceError::InvalidParameter)?;
        Ok(self.root.join(name))
    }

    fn load(&self, name: &str, file: &str) -> Result<ParsedFile, ServiceError> {
        let path = self.service_dir(name)?.join(file);
        match ini::parse_path(&path) {
            Ok(parsed) => Ok(parsed),
            Err(ini::IniError::Io(e)) => Err(ServiceError::from_io("read", name, &e)),
            Err(e) => Err(ServiceError::InvalidConfiguration(vec![format!(
                "{}: {}",
                path.display(),
                e
            )])),
        }
    }
}

/// Replace `path` with `content` so readers never see a partial file
pub(crate) fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn lookup(parsed: &ParsedFile, section: &str, key: &str) -> Option<StoredValue> {
    let mut values = ini::get_all(parsed, section, key);
    match values.len() {
        0 => None,
        1 => values.pop().map(StoredValue::Text),
        _ => Some(StoredValue::List(values)),
    }
}

impl ConfigStore for FileStore {
    fn write_parameters(
        &self,
        name: &str,
        params: &LaunchParameters,
    ) -> Result<Vec<Warning>, ServiceError> {
        let dir = self.service_dir(name)?;

        let mut w = IniWriter::new();
        w.comment(&format!("Launch parameters for {}", name));
        w.section("Parameters");
        for value in encode_parameters(params) {
            match &value.value {
                StoredValue::Text(s) => w.entry(value.name, s),
                StoredValue::Number(n) => w.entry(value.name, &n.to_string()),
                StoredValue::List(items) => {
                    for item in items {
                        w.entry(value.name, item);
                    }
                    &mut w
                }
            };
        }

        let (default, by_code) = encode_exit_policy(&params.exit);
        w.section(APP_EXIT);
        if let Some(default) = default {
            w.entry(EXIT_DEFAULT, default);
        }
        for (code, action) in &by_code {
            w.entry(code, action);
        }

        let path = dir.join(PARAMETERS_FILE);
        write_atomic(&path, &w.finish())
            .map_err(|e| ServiceError::from_io("write launch parameters", name, &e))?;
        log::debug!("Wrote {}", path.display());
        Ok(Vec::new())
    }

    fn write_metadata(&self, name: &str, metadata: &ServiceMetadata) -> Result<(), ServiceError> {
        let dir = self.service_dir(name)?;

        let mut w = IniWriter::new();
        w.section("Service")
            .entry(DISPLAY_NAME, &metadata.display_name)
            .entry(DESCRIPTION, &metadata.description)
            .entry(START, metadata.start_type.as_str())
            .entry(
                DELAYED_AUTOSTART,
                if metadata.start_type == StartType::DelayedAuto { "1" } else { "0" },
            )
            .entry(OBJECT_NAME, metadata.account.as_str());
        for dep in &metadata.dependencies {
            w.entry(DEPEND_ON_SERVICE, dep);
        }

        write_atomic(&dir.join(METADATA_FILE), &w.finish())
            .map_err(|e| ServiceError::from_io("write service metadata", name, &e))
    }

    fn read_parameters(&self, name: &str) -> Result<LaunchParameters, ServiceError> {
        let parsed = self.load(name, PARAMETERS_FILE)?;
        if !parsed.contains_key(PARAMETERS_SECTION) {
            return Err(ServiceError::NotFound(name.to_string()));
        }

        let exit = match parsed.get(EXIT_SECTION) {
            Some(section) => {
                let default_key = EXIT_DEFAULT.to_uppercase();
                let default = ini::get(&parsed, EXIT_SECTION, EXIT_DEFAULT);
                let codes: Vec<(&str, String)> = section
                    .keys()
                    .filter(|key| **key != default_key)
                    .filter_map(|key| {
                        ini::get(&parsed, EXIT_SECTION, key).map(|action| (key.as_str(), action))
                    })
                    .collect();
                decode_exit_policy(
                    name,
                    default.as_deref(),
                    codes.iter().map(|(code, action)| (*code, action.as_str())),
                )
            }
            None => Default::default(),
        };

        decode_parameters(name, |key| lookup(&parsed, PARAMETERS_SECTION, key), exit)
    }

    fn read_metadata(&self, name: &str) -> Result<ServiceMetadata, ServiceError> {
        let parsed = self.load(name, METADATA_FILE)?;
        let get = |key: &str| ini::get(&parsed, SERVICE_SECTION, key).unwrap_or_default();

        let start = get(START);
        let mut start_type = match start.as_str() {
            "" => StartType::default(),
            raw => StartType::parse(raw).ok_or_else(|| {
                ServiceError::InvalidConfiguration(vec![format!(
                    "{}: invalid start type {:?}",
                    name, raw
                )])
            })?,
        };
        if start_type == StartType::Auto && ini::parse_bool(&get(DELAYED_AUTOSTART)) == Some(true) {
            start_type = StartType::DelayedAuto;
        }

        Ok(ServiceMetadata {
            display_name: get(DISPLAY_NAME),
            description: get(DESCRIPTION),
            start_type,
            account: Account::parse(&get(OBJECT_NAME)),
            dependencies: ini::get_all(&parsed, SERVICE_SECTION, DEPEND_ON_SERVICE),
        })
    }

    fn delete(&self, name: &str) -> Result<(), ServiceError> {
        let dir = self.service_dir(name)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                log::debug!("Removed {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::from_io("delete configuration", name, &e)),
        }
    }

    fn list_all(&self) -> Result<BTreeSet<String>, ServiceError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => {
                return Err(ServiceError::from_io(
                    "list services",
                    &self.root.display().to_string(),
                    &e,
                ))
            }
        };

        let mut names = BTreeSet::new();
        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let managed = self
                .load(&name, PARAMETERS_FILE)
                .ok()
                .and_then(|parsed| {
                    ini::get(&parsed, PARAMETERS_SECTION, APPLICATION).map(|a| !a.is_empty())
                })
                .unwrap_or(false);
            if managed {
                names.insert(name);
            }
        }
        Ok(names)
    }
}
