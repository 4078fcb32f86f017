//! Start, stop and rotate a service

use std::time::Duration;

use svcwrap::scm::ServiceStatus;
use svcwrap::settings::Settings;

use super::{installer, CommandResult, Outcome};

fn print_status(id: &str, status: &ServiceStatus) {
    match status.pid {
        Some(pid) => println!("{}: {} (pid {})", id, status.state.as_str(), pid),
        None => println!("{}: {}", id, status.state.as_str()),
    }
}

pub fn start(settings: &Settings, id: &str, timeout: Option<Duration>) -> CommandResult {
    let timeout = timeout.unwrap_or(settings.default_timeout);
    let status = installer(settings)?.start_service(id, timeout)?;
    print_status(id, &status);
    Ok(Outcome::Done)
}

pub fn stop(settings: &Settings, id: &str, timeout: Option<Duration>) -> CommandResult {
    let timeout = timeout.unwrap_or(settings.default_timeout);
    let status = installer(settings)?.stop_service(id, timeout)?;
    print_status(id, &status);
    Ok(Outcome::Done)
}

pub fn rotate(settings: &Settings, id: &str) -> CommandResult {
    let status = installer(settings)?.rotate_service(id)?;
    println!("Rotation requested");
    print_status(id, &status);
    Ok(Outcome::Done)
}
