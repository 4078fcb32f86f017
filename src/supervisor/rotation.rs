//! Output file rotation
//!
//! A rotated file keeps its name with a local timestamp spliced in before
//! the extension: `app.log` becomes `app-20240131T235959.123.log`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};

use crate::config::RotationConfig;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3f";

pub fn rotated_name(path: &Path, at: DateTime<Local>) -> PathBuf {
    let stamp = at.format(TIMESTAMP_FORMAT);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, stamp, ext.to_string_lossy()),
        None => format!("{}-{}", stem, stamp),
    };
    path.with_file_name(name)
}

/// Whether an existing file passes the age and size thresholds
fn due(metadata: &std::fs::Metadata, rotation: &RotationConfig, now: SystemTime) -> bool {
    if rotation.bytes > 0 && metadata.len() < rotation.bytes {
        return false;
    }
    if rotation.seconds > 0 {
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or(Duration::ZERO);
        if age < Duration::from_secs(rotation.seconds) {
            return false;
        }
    }
    true
}

/// Rename `path` out of the way if the thresholds say so. Returns the new
/// name, `None` when nothing was rotated.
pub fn rotate_file(path: &Path, rotation: &RotationConfig) -> io::Result<Option<PathBuf>> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if !due(&metadata, rotation, SystemTime::now()) {
        return Ok(None);
    }
    force_rotate(path)
}

/// Rename `path` regardless of thresholds
pub fn force_rotate(path: &Path) -> io::Result<Option<PathBuf>> {
    if !path.is_file() {
        return Ok(None);
    }
    let target = rotated_name(path, Local::now());
    std::fs::rename(path, &target)?;
    log::info!("Rotated {} to {}", path.display(), target.display());
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_rotated_name() {
        let at = Local.with_ymd_and_hms(2024, 1, 31, 23, 59, 58).unwrap();
        assert_eq!(
            rotated_name(Path::new("/var/log/app.out.log"), at),
            PathBuf::from("/var/log/app.out-20240131T235958.000.log")
        );
        assert_eq!(
            rotated_name(Path::new("/var/log/app"), at),
            PathBuf::from("/var/log/app-20240131T235958.000")
        );
    }

    #[test]
    fn test_size_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        std::fs::write(&path, b"short").unwrap();

        let rotation = RotationConfig {
            on_start: true,
            bytes: 1024,
            ..Default::default()
        };
        assert_eq!(rotate_file(&path, &rotation).unwrap(), None);
        assert!(path.exists());

        std::fs::write(&path, vec![b'x'; 2048]).unwrap();
        let rotated = rotate_file(&path, &rotation).unwrap().unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::metadata(rotated).unwrap().len(), 2048);
    }

    #[test]
    fn test_age_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        std::fs::write(&path, b"fresh").unwrap();

        let rotation = RotationConfig {
            on_start: true,
            seconds: 3600,
            ..Default::default()
        };
        assert_eq!(rotate_file(&path, &rotation).unwrap(), None);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let rotation = RotationConfig::default();
        assert_eq!(rotate_file(&dir.path().join("none.log"), &rotation).unwrap(), None);
        assert_eq!(force_rotate(&dir.path().join("none.log")).unwrap(), None);
    }
}
