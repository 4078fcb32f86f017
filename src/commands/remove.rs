//! Remove a service

use svcwrap::settings::Settings;

use super::{installer, CommandResult, Outcome};

pub fn remove(settings: &Settings, id: &str) -> CommandResult {
    let report = installer(settings)?.remove_service(id)?;
    println!("Service {} removed", id);
    Ok(Outcome::from_report(&report))
}
