//! Show service status

use svcwrap::installer::ServiceInfo;
use svcwrap::scm::ServiceState;
use svcwrap::settings::Settings;

use super::{installer, CommandResult, Outcome};

pub fn status(settings: &Settings, id: &str, json: bool) -> CommandResult {
    let info = installer(settings)?.service_info(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print_info(&info);
    }
    Ok(Outcome::Done)
}

fn print_info(info: &ServiceInfo) {
    let config = &info.config;
    let params = &config.parameters;
    let status = &info.status;

    let symbol = match status.state {
        ServiceState::Running => "●",
        ServiceState::Stopped => "○",
        _ => "◐",
    };
    let description = if config.metadata.description.is_empty() {
        "(no description)"
    } else {
        &config.metadata.description
    };
    println!("{} {} - {}", symbol, config.name, description);
    println!("      State: {}", status.state.as_str());
    if let Some(pid) = status.pid {
        println!("   Host PID: {}", pid);
    }
    if let Some(code) = status.exit_code {
        println!("  Last exit: {}", code);
    }
    println!("    Display: {}", config.display_name());
    println!("      Start: {}", config.metadata.start_type.as_str());
    println!("    Account: {}", config.metadata.account.as_str());
    if params.arguments.is_empty() {
        println!("    Program: {}", params.application);
    } else {
        println!("    Program: {} {}", params.application, params.arguments);
    }
    if !params.directory.is_empty() {
        println!("  Directory: {}", params.directory);
    }
    println!("   Priority: {}", params.priority.as_str());
    println!("   Throttle: {:?}", params.throttle);

    match params.exit.default {
        Some(action) => println!("    On exit: {}", action.as_str()),
        None => println!("    On exit: Restart (default)"),
    }
    for (code, action) in &params.exit.by_code {
        println!("  On exit {:>3}: {}", code, action.as_str());
    }

    for (label, path) in [
        ("stdin", &params.stdio.stdin),
        ("stdout", &params.stdio.stdout),
        ("stderr", &params.stdio.stderr),
    ] {
        if !path.is_empty() {
            println!("{:>11}: {}", label, path);
        }
    }
    if !config.metadata.dependencies.is_empty() {
        println!("    Depends: {}", config.metadata.dependencies.join(", "));
    }
}
