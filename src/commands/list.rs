//! List managed services

use svcwrap::settings::Settings;

use super::{installer, CommandResult, Outcome};

pub fn list(settings: &Settings) -> CommandResult {
    let installer = installer(settings)?;
    let names = installer.list_services()?;

    println!("SERVICE                          STATE          PROGRAM");
    let mut missing = 0;
    for name in &names {
        match installer.service_info(name) {
            Ok(info) => {
                let program: String = info.config.parameters.application.chars().take(40).collect();
                println!("{:<32} {:<14} {}", name, info.status.state.as_str(), program);
            }
            Err(e) => {
                missing += 1;
                println!("{:<32} {:<14} ({})", name, "error", e);
            }
        }
    }

    println!();
    println!("{} services listed", names.len());
    Ok(if missing > 0 { Outcome::Partial } else { Outcome::Done })
}
