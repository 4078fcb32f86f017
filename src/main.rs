mod commands;

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use svcwrap::host::{self, EntryMode};
use svcwrap::settings::Settings;

use commands::InstallArgs;

#[derive(Parser)]
#[command(name = "svcwrap")]
#[command(about = "Run any program as a supervised system service")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    svcwrap::ini::parse_duration(s).ok_or_else(|| format!("invalid duration {:?}", s))
}

#[derive(Subcommand)]
enum Command {
    /// Install a program as a service
    Install(InstallArgs),

    /// Replace the configuration of an installed service
    Update {
        /// Identifier the service is installed under
        existing: String,

        #[command(flatten)]
        install: InstallArgs,
    },

    /// Stop and remove a service
    Remove {
        id: String,
    },

    /// Start a service and wait until it runs
    Start {
        id: String,

        #[arg(long, value_parser = parse_timeout)]
        timeout: Option<Duration>,
    },

    /// Stop a service and wait until it stopped
    Stop {
        id: String,

        #[arg(long, value_parser = parse_timeout)]
        timeout: Option<Duration>,
    },

    /// Ask a running service to rotate its output files
    Rotate {
        id: String,
    },

    /// Show configuration and state of a service
    Status {
        id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List managed services
    List,

    /// Host a service in the foreground
    Run {
        id: String,
    },
}

fn host_main(service: &str) -> ExitCode {
    let (settings, settings_error) = match Settings::load() {
        Ok(settings) => (settings, None),
        Err(e) => (Settings::default(), Some(e)),
    };
    if let Err(e) = svcwrap::logging::init_host(service, &settings.log_dir, settings.log_level) {
        eprintln!("svcwrap: cannot initialize logging: {}", e);
    }
    if let Some(e) = settings_error {
        log::warn!("Using default settings: {}", e);
    }

    let outcome = host::run_host(service, &settings);
    match &outcome {
        host::HostOutcome::Failed(e) => log::error!("{}: {}", service, e),
        other => log::info!("{}: host finished ({:?})", service, other),
    }
    ExitCode::from(outcome.process_exit_code())
}

fn admin_main() -> ExitCode {
    let args = Args::parse();
    svcwrap::logging::init_admin();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::from(1);
        }
    };

    let result = match &args.command {
        Command::Install(install) => commands::install(&settings, install),
        Command::Update { existing, install } => commands::update(&settings, existing, install),
        Command::Remove { id } => commands::remove(&settings, id),
        Command::Start { id, timeout } => commands::start(&settings, id, *timeout),
        Command::Stop { id, timeout } => commands::stop(&settings, id, *timeout),
        Command::Rotate { id } => commands::rotate(&settings, id),
        Command::Status { id, json } => commands::status(&settings, id, *json),
        Command::List => commands::list(&settings),
        Command::Run { id } => commands::run(&settings, id),
    };

    match result {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(1)
        }
    }
}

fn main() -> ExitCode {
    match EntryMode::from_args(std::env::args_os()) {
        EntryMode::Host { service } => host_main(&service),
        EntryMode::Admin => admin_main(),
    }
}
