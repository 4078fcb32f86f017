//! Spawning the wrapped program

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::output::{self, FileSink};
use super::rotation;
use crate::config::expand::expand;
use crate::config::LaunchParameters;
use crate::error::ServiceError;
use crate::terminate::ProcessControl;

#[cfg(unix)]
use crate::terminate::unix as platform;
#[cfg(windows)]
use crate::terminate::windows as platform;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Service {0} has no application configured")]
    NoApplication(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Cannot open {path}: {message}")]
    Stdio {
        path: String,
        code: i32,
        message: String,
    },

    #[error("Failed to spawn {program}: {message}")]
    Spawn {
        program: String,
        code: i32,
        message: String,
    },
}

impl From<SpawnError> for ServiceError {
    fn from(err: SpawnError) -> Self {
        match &err {
            SpawnError::NoApplication(_) | SpawnError::InvalidArguments(_) => {
                ServiceError::InvalidConfiguration(vec![err.to_string()])
            }
            SpawnError::Stdio { code, .. } => ServiceError::native("open output", *code, err.to_string()),
            SpawnError::Spawn { code, .. } => ServiceError::native("spawn", *code, err.to_string()),
        }
    }
}

fn stdio_error(path: &Path, e: std::io::Error) -> SpawnError {
    SpawnError::Stdio {
        path: path.display().to_string(),
        code: e.raw_os_error().unwrap_or(-1),
        message: e.to_string(),
    }
}

/// A running child owned by the monitor task
pub struct ChildProcess {
    service: String,
    child: Child,
    pid: u32,
    started: Instant,
    exit_code: Option<i32>,
    pumps: Vec<JoinHandle<()>>,
}

impl ChildProcess {
    /// How long the child has been running
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait for the output pumps to drain, bounded by `timeout`
    pub async fn drain_output(&mut self, timeout: Duration) {
        for pump in self.pumps.drain(..) {
            let _ = tokio::time::timeout(timeout, pump).await;
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(windows)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

impl ProcessControl for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit_code(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit_code = Some(exit_code_of(status)),
                Ok(None) => {}
                Err(e) => log::warn!("{}: cannot query child {}: {}", self.service, self.pid, e),
            }
        }
        self.exit_code
    }

    fn request_close(&mut self) -> bool {
        self.exit_code.is_none() && platform::request_close(self.pid)
    }

    fn interrupt(&mut self) -> bool {
        self.exit_code.is_none() && platform::interrupt(self.pid)
    }

    fn kill(&mut self) -> Result<(), ServiceError> {
        self.child
            .start_kill()
            .map_err(|e| ServiceError::from_io("kill", &format!("process {}", self.pid), &e))
    }
}

/// Where one output stream goes
enum StreamPlan {
    Log,
    Direct(std::fs::File),
    Pumped(Arc<Mutex<FileSink>>),
}

fn open_direct(path: &Path) -> Result<std::fs::File, SpawnError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| stdio_error(path, e))?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| stdio_error(path, e))
}

async fn plan_stream(
    path: &str,
    shared: Option<&StreamPlan>,
    params: &LaunchParameters,
    generation: u64,
) -> Result<StreamPlan, SpawnError> {
    if path.is_empty() {
        return Ok(StreamPlan::Log);
    }
    match shared {
        Some(StreamPlan::Direct(file)) => {
            let file = file.try_clone().map_err(|e| stdio_error(Path::new(path), e))?;
            return Ok(StreamPlan::Direct(file));
        }
        Some(StreamPlan::Pumped(sink)) => return Ok(StreamPlan::Pumped(Arc::clone(sink))),
        _ => {}
    }

    let path = PathBuf::from(path);
    if params.rotation.on_start {
        if let Err(e) = rotation::rotate_file(&path, &params.rotation) {
            log::warn!("Cannot rotate {}: {}", path.display(), e);
        }
    }
    if params.rotation.online {
        let sink = FileSink::open(&path, params.rotation.bytes, generation)
            .await
            .map_err(|e| stdio_error(&path, e))?;
        Ok(StreamPlan::Pumped(Arc::new(Mutex::new(sink))))
    } else {
        Ok(StreamPlan::Direct(open_direct(&path)?))
    }
}

fn stdio_for(plan: &mut Option<StreamPlan>) -> Stdio {
    match plan.take() {
        Some(StreamPlan::Direct(file)) => Stdio::from(file),
        Some(other) => {
            *plan = Some(other);
            Stdio::piped()
        }
        None => Stdio::piped(),
    }
}

/// Working directory, falling back to the application's own directory
fn working_directory(application: &Path, directory: &str) -> Option<PathBuf> {
    if !directory.is_empty() {
        return Some(PathBuf::from(directory));
    }
    application
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// Start the configured program for `service`
pub async fn launch(
    service: &str,
    params: &LaunchParameters,
    rotate: &Arc<AtomicU64>,
) -> Result<ChildProcess, SpawnError> {
    let application = expand(&params.application);
    if application.trim().is_empty() {
        return Err(SpawnError::NoApplication(service.to_string()));
    }
    let application = PathBuf::from(application);
    let arguments = expand(&params.arguments);

    let mut cmd = Command::new(&application);

    #[cfg(unix)]
    {
        let args = shlex::split(&arguments)
            .ok_or_else(|| SpawnError::InvalidArguments(arguments.clone()))?;
        cmd.args(args);
        cmd.process_group(0);

        let nice = params.priority.nice();
        if nice != 0 {
            // Runs after fork, before exec. Raising priority needs privileges,
            // the child still starts when it is refused.
            unsafe {
                cmd.pre_exec(move || {
                    libc::setpriority(libc::PRIO_PROCESS, 0, nice);
                    Ok(())
                });
            }
        }
    }
    #[cfg(windows)]
    {
        if !arguments.is_empty() {
            cmd.raw_arg(&arguments);
        }
        cmd.creation_flags(params.priority.class());
    }

    let directory = expand(&params.directory);
    if let Some(dir) = working_directory(&application, &directory) {
        cmd.current_dir(dir);
    }
    for (key, value) in &params.environment {
        cmd.env(key, expand(value));
    }

    let stdin = expand(&params.stdio.stdin);
    if stdin.is_empty() {
        cmd.stdin(Stdio::null());
    } else {
        let file = std::fs::File::open(&stdin).map_err(|e| stdio_error(Path::new(&stdin), e))?;
        cmd.stdin(Stdio::from(file));
    }

    let generation = rotate.load(Ordering::Relaxed);
    let stdout_path = expand(&params.stdio.stdout);
    let stderr_path = expand(&params.stdio.stderr);
    let mut stdout_plan = Some(plan_stream(&stdout_path, None, params, generation).await?);
    let shared = (stderr_path == stdout_path).then_some(stdout_plan.as_ref()).flatten();
    let mut stderr_plan = Some(plan_stream(&stderr_path, shared, params, generation).await?);

    cmd.stdout(stdio_for(&mut stdout_plan));
    cmd.stderr(stdio_for(&mut stderr_plan));
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| SpawnError::Spawn {
        program: application.display().to_string(),
        code: e.raw_os_error().unwrap_or(-1),
        message: e.to_string(),
    })?;
    let pid = child.id().unwrap_or_default();

    let mut pumps = Vec::new();
    if let Some(out) = child.stdout.take() {
        pumps.push(match stdout_plan {
            Some(StreamPlan::Pumped(sink)) => {
                tokio::spawn(output::pump_to_file(out, sink, Arc::clone(rotate)))
            }
            _ => tokio::spawn(output::pump_to_log(service.to_string(), out, false)),
        });
    }
    if let Some(err) = child.stderr.take() {
        pumps.push(match stderr_plan {
            Some(StreamPlan::Pumped(sink)) => {
                tokio::spawn(output::pump_to_file(err, sink, Arc::clone(rotate)))
            }
            _ => tokio::spawn(output::pump_to_log(service.to_string(), err, true)),
        });
    }

    log::info!(
        "{}: started {} (pid {})",
        service,
        application.display(),
        pid
    );

    Ok(ChildProcess {
        service: service.to_string(),
        child,
        pid,
        started: Instant::now(),
        exit_code: None,
        pumps,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn params(app: &str, args: &str) -> LaunchParameters {
        let mut params = LaunchParameters::new(app);
        params.arguments = args.to_string();
        params
    }

    async fn wait_exit(child: &mut ChildProcess) -> i32 {
        for _ in 0..200 {
            if let Some(code) = child.try_exit_code() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("child did not exit");
    }

    #[tokio::test]
    async fn test_exit_code_and_quoting() {
        let rotate = Arc::new(AtomicU64::new(0));
        let mut child = launch("t", &params("/bin/sh", "-c 'exit 7'"), &rotate).await.unwrap();
        assert_eq!(wait_exit(&mut child).await, 7);
    }

    #[tokio::test]
    async fn test_output_file_environment_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.log");
        let mut p = params("/bin/sh", "-c 'echo \"$GREETING\"; pwd; echo oops >&2'");
        p.directory = dir.path().display().to_string();
        p.environment.push(("GREETING".into(), "hello there".into()));
        p.stdio.stdout = out.display().to_string();
        p.stdio.stderr = out.display().to_string();

        let rotate = Arc::new(AtomicU64::new(0));
        let mut child = launch("t", &p, &rotate).await.unwrap();
        assert_eq!(wait_exit(&mut child).await, 0);
        child.drain_output(Duration::from_secs(1)).await;

        let text = std::fs::read_to_string(&out).unwrap();
        let real_dir = std::fs::canonicalize(dir.path()).unwrap();
        assert!(text.contains("hello there\n"));
        assert!(text.contains(&format!("{}\n", real_dir.display())));
        assert!(text.contains("oops\n"));
    }

    #[tokio::test]
    async fn test_online_rotation_pumps_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.log");
        let mut p = params("/bin/sh", "-c 'echo one'");
        p.stdio.stdout = out.display().to_string();
        p.rotation.online = true;

        let rotate = Arc::new(AtomicU64::new(0));
        let mut child = launch("t", &p, &rotate).await.unwrap();
        wait_exit(&mut child).await;
        child.drain_output(Duration::from_secs(1)).await;
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "one\n");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let rotate = Arc::new(AtomicU64::new(0));
        let err = launch("t", &params("/nonexistent/bin", ""), &rotate).await.err().unwrap();
        assert!(matches!(err, SpawnError::Spawn { code: 2, .. }));

        let err = launch("t", &params("", ""), &rotate).await.err().unwrap();
        assert!(matches!(err, SpawnError::NoApplication(_)));

        let err = launch("t", &params("/bin/sh", "-c 'unterminated"), &rotate).await.err().unwrap();
        assert!(matches!(err, SpawnError::InvalidArguments(_)));
    }

    #[test]
    fn test_working_directory_defaults_to_application_dir() {
        assert_eq!(
            working_directory(Path::new("/opt/app/bin/server"), ""),
            Some(PathBuf::from("/opt/app/bin"))
        );
        assert_eq!(
            working_directory(Path::new("/opt/app/bin/server"), "/srv"),
            Some(PathBuf::from("/srv"))
        );
        assert_eq!(working_directory(Path::new("server"), ""), None);
    }
}
