//! Install or update a service

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use svcwrap::config::{
    Account, ExitAction, ProcessPriority, ServiceConfiguration, StartType, StopMethods,
};
use svcwrap::ini;
use svcwrap::scm::join_arguments;
use svcwrap::settings::Settings;

use super::{installer, CommandResult, Outcome};

#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    /// Service identifier
    pub id: String,

    /// Program to supervise
    pub program: PathBuf,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    #[arg(long)]
    pub display_name: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// Working directory (default: the program's directory)
    #[arg(long)]
    pub dir: Option<String>,

    /// auto, delayed-auto, demand or disabled
    #[arg(long, value_parser = parse_start_type, default_value = "auto")]
    pub start: StartType,

    /// Run as this account instead of LocalSystem
    #[arg(long)]
    pub account: Option<String>,

    #[arg(long, requires = "account")]
    pub password: Option<String>,

    #[arg(long, value_parser = parse_priority, default_value = "normal")]
    pub priority: ProcessPriority,

    /// Default exit action: restart, ignore, exit or suicide
    #[arg(long, value_parser = parse_action)]
    pub exit: Option<ExitAction>,

    /// Exit action for one exit code, CODE=ACTION
    #[arg(long = "exit-code", value_parser = parse_exit_code)]
    pub exit_codes: Vec<(i32, ExitAction)>,

    /// Minimum uptime before a restart is immediate (e.g. 1500ms, 5s)
    #[arg(long, value_parser = parse_duration)]
    pub throttle: Option<Duration>,

    #[arg(long, value_parser = parse_duration)]
    pub restart_delay: Option<Duration>,

    #[arg(long)]
    pub stdin: Option<String>,

    #[arg(long)]
    pub stdout: Option<String>,

    #[arg(long)]
    pub stderr: Option<String>,

    /// Rotate output files when the service starts
    #[arg(long)]
    pub rotate: bool,

    /// Rotate output files while the service runs
    #[arg(long)]
    pub rotate_online: bool,

    /// Only rotate files at least this old, in seconds
    #[arg(long, default_value_t = 0)]
    pub rotate_seconds: u64,

    /// Only rotate files at least this large, in bytes
    #[arg(long, default_value_t = 0)]
    pub rotate_bytes: u64,

    /// Stop only the program, not the processes it started
    #[arg(long)]
    pub no_kill_tree: bool,

    /// Stop phases to skip: console, window, threads, terminate
    #[arg(long = "skip-stop", value_parser = parse_stop_method)]
    pub skip_stop: Vec<StopMethods>,

    /// Extra environment variable, KEY=VALUE
    #[arg(long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Service this one depends on
    #[arg(long = "depend")]
    pub dependencies: Vec<String>,
}

fn parse_start_type(s: &str) -> Result<StartType, String> {
    StartType::parse(s).ok_or_else(|| format!("unknown start type {:?}", s))
}

fn parse_priority(s: &str) -> Result<ProcessPriority, String> {
    ProcessPriority::parse(s).ok_or_else(|| format!("unknown priority {:?}", s))
}

fn parse_action(s: &str) -> Result<ExitAction, String> {
    ExitAction::parse(s).ok_or_else(|| format!("unknown exit action {:?}", s))
}

fn parse_exit_code(s: &str) -> Result<(i32, ExitAction), String> {
    let (code, action) = s
        .split_once('=')
        .ok_or_else(|| format!("expected CODE=ACTION, got {:?}", s))?;
    let code = code
        .trim()
        .parse()
        .map_err(|_| format!("invalid exit code {:?}", code))?;
    Ok((code, parse_action(action.trim())?))
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    ini::parse_duration(s).ok_or_else(|| format!("invalid duration {:?}", s))
}

fn parse_stop_method(s: &str) -> Result<StopMethods, String> {
    match s.to_ascii_lowercase().as_str() {
        "console" => Ok(StopMethods::CONSOLE),
        "window" => Ok(StopMethods::WINDOW),
        "threads" => Ok(StopMethods::THREADS),
        "terminate" => Ok(StopMethods::TERMINATE),
        _ => Err(format!("unknown stop method {:?}", s)),
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

impl InstallArgs {
    /// Service configuration on top of the configured defaults
    pub fn to_config(&self, settings: &Settings) -> ServiceConfiguration {
        let program = std::path::absolute(&self.program).unwrap_or_else(|_| self.program.clone());
        let mut config = ServiceConfiguration::new(&self.id, program.to_string_lossy());
        config.parameters = settings.launch_parameters(program.to_string_lossy());

        let metadata = &mut config.metadata;
        if let Some(name) = &self.display_name {
            metadata.display_name = name.clone();
        }
        metadata.description = self.description.clone().unwrap_or_default();
        metadata.start_type = self.start;
        metadata.account = self.account.as_deref().map(Account::parse).unwrap_or_default();
        metadata.dependencies = self.dependencies.clone();
        config.password = self.password.clone();

        let params = &mut config.parameters;
        params.arguments = join_arguments(&self.args);
        params.directory = self.dir.clone().unwrap_or_default();
        params.priority = self.priority;
        params.exit.default = self.exit;
        params.exit.by_code = self.exit_codes.iter().copied().collect();
        if let Some(throttle) = self.throttle {
            params.throttle = throttle;
        }
        if let Some(delay) = self.restart_delay {
            params.restart_delay = delay;
        }
        params.stdio.stdin = self.stdin.clone().unwrap_or_default();
        params.stdio.stdout = self.stdout.clone().unwrap_or_default();
        params.stdio.stderr = self.stderr.clone().unwrap_or_default();
        params.rotation.on_start = self.rotate;
        params.rotation.online = self.rotate_online;
        params.rotation.seconds = self.rotate_seconds;
        params.rotation.bytes = self.rotate_bytes;
        params.stop.kill_tree = !self.no_kill_tree;
        params.stop.skip = self.skip_stop.iter().copied().collect();
        params.environment = self.env.clone();
        config
    }
}

pub fn install(settings: &Settings, args: &InstallArgs) -> CommandResult {
    let config = args.to_config(settings);
    let report = installer(settings)?.install_service(&config)?;
    println!("Service {} installed", config.name);
    Ok(Outcome::from_report(&report))
}

pub fn update(settings: &Settings, existing: &str, args: &InstallArgs) -> CommandResult {
    let config = args.to_config(settings);
    let report = installer(settings)?.update_service(existing, &config)?;
    println!("Service {} updated", config.name);
    Ok(Outcome::from_report(&report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        install: InstallArgs,
    }

    fn parse(args: &[&str]) -> InstallArgs {
        let mut argv = vec!["svcwrap"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().install
    }

    #[test]
    fn test_minimal() {
        let settings = Settings::default();
        let config = parse(&["echoer", "/bin/sh"]).to_config(&settings);
        assert_eq!(config.name, "echoer");
        assert_eq!(config.parameters.application, "/bin/sh");
        assert_eq!(config.display_name(), "echoer");
        assert_eq!(config.metadata.start_type, StartType::Auto);
        assert_eq!(config.metadata.account, Account::LocalSystem);
        assert!(config.parameters.exit.is_empty());
        assert!(config.parameters.stop.kill_tree);
        assert_eq!(config.parameters.throttle, settings.defaults.throttle);
    }

    #[cfg(unix)]
    #[test]
    fn test_trailing_arguments() {
        let config = parse(&["echoer", "/bin/sh", "-c", "echo hi there"]).to_config(&Settings::default());
        assert_eq!(
            shlex::split(&config.parameters.arguments),
            Some(vec!["-c".to_string(), "echo hi there".to_string()])
        );
    }

    #[test]
    fn test_options() {
        let args = parse(&[
            "--start", "demand",
            "--exit", "ignore",
            "--exit-code", "0=exit",
            "--exit-code", "3=suicide",
            "--throttle", "5s",
            "--restart-delay", "250ms",
            "--rotate-online",
            "--rotate-bytes", "1024",
            "--no-kill-tree",
            "--skip-stop", "window",
            "--skip-stop", "console",
            "--env", "A=1",
            "--depend", "network",
            "--account", "svc",
            "--password", "secret",
            "echoer", "/bin/sh",
        ]);
        let config = args.to_config(&Settings::default());
        let params = &config.parameters;
        assert_eq!(config.metadata.start_type, StartType::Demand);
        assert_eq!(params.exit.action_for(0), ExitAction::Exit);
        assert_eq!(params.exit.action_for(3), ExitAction::Suicide);
        assert_eq!(params.exit.action_for(9), ExitAction::Ignore);
        assert_eq!(params.throttle, Duration::from_secs(5));
        assert_eq!(params.restart_delay, Duration::from_millis(250));
        assert!(params.rotation.online);
        assert_eq!(params.rotation.bytes, 1024);
        assert!(!params.stop.kill_tree);
        assert_eq!(params.stop.skip, StopMethods::WINDOW | StopMethods::CONSOLE);
        assert_eq!(params.environment, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(config.metadata.dependencies, vec!["network".to_string()]);
        assert_eq!(config.metadata.account, Account::User("svc".into()));
        assert_eq!(config.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse_exit_code("x=restart").is_err());
        assert!(parse_exit_code("1").is_err());
        assert!(parse_exit_code("1=explode").is_err());
        assert!(parse_env("=1").is_err());
        assert!(parse_env("A").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(Cli::try_parse_from(["svcwrap", "--password", "p", "echoer", "/bin/sh"]).is_err());
    }
}
