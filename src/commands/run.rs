//! Host a service in the foreground

use svcwrap::host::{self, HostOutcome};
use svcwrap::settings::Settings;

use super::{CommandResult, Outcome};

pub fn run(settings: &Settings, id: &str) -> CommandResult {
    log::info!("Hosting {} in the foreground, Ctrl+C stops", id);
    match host::run_interactive(id, settings) {
        HostOutcome::Stopped { .. } => Ok(Outcome::Done),
        HostOutcome::Suicide { exit_code } => {
            Err(format!("{}: exit policy ended the host (child exit code {})", id, exit_code).into())
        }
        HostOutcome::Failed(e) => Err(e.into()),
    }
}
