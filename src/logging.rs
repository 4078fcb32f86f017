//! Log sinks for the two entry modes

use std::path::{Path, PathBuf};

use log::LevelFilter;

/// Admin commands log to stderr, `RUST_LOG` overrides the level
pub fn init_admin() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// `<log_dir>/<id>.log`
pub fn host_log_path(log_dir: &Path, service: &str) -> PathBuf {
    log_dir.join(format!("{}.log", service))
}

/// Host mode logs to stderr and to the service's own log file.
///
/// A log file that cannot be opened leaves stderr as the only sink.
pub fn init_host(service: &str, log_dir: &Path, level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let service_name = service.to_string();
    let mut dispatch = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}[{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                service_name,
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    let path = host_log_path(log_dir, service);
    let file = std::fs::create_dir_all(log_dir).and_then(|_| fern::log_file(&path));
    let file_error = match file {
        Ok(file) => {
            dispatch = dispatch.chain(file);
            None
        }
        Err(e) => Some(e),
    };

    dispatch.apply()?;
    if let Some(e) = file_error {
        log::warn!("Cannot open log file {}: {}", path.display(), e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_log_path() {
        assert_eq!(
            host_log_path(Path::new("/var/log/svcwrap"), "echoer"),
            PathBuf::from("/var/log/svcwrap/echoer.log")
        );
    }
}
