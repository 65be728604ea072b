mod daemon;
mod doctor;
mod manage;

use anyhow::Result;
use console::style;

use crate::core::config::KernelConfig;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("run", "Run the kernel in the foreground")
        .command("gateway", "Manage the background daemon (start, stop, status)")
        .command("logs", "Follow the daemon log")
        .print();

    GuideSection::new("Management")
        .command("register", "Register a conversation (--chat --folder [--name --trigger --main])")
        .command("tasks", "List scheduled tasks ([--folder <f>])")
        .print();

    GuideSection::new("Diagnostics")
        .command("doctor", "Check the container runtime, allowlist and data directory")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("kestrel").green()
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Run,
    DaemonRun,
    GatewayStart,
    GatewayStop,
    GatewayStatus,
    Logs,
    Register,
    Tasks,
    Doctor,
    Help,
}

pub(crate) fn parse_command(args: &[String]) -> Result<Command, String> {
    let Some(cmd) = args.get(1) else {
        return Ok(Command::Help);
    };
    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "daemon-run" => Ok(Command::DaemonRun),
        "gateway" => match args.get(2).map(String::as_str) {
            Some("start") => Ok(Command::GatewayStart),
            Some("stop") => Ok(Command::GatewayStop),
            Some("status") => Ok(Command::GatewayStatus),
            _ => Err("Unknown or missing gateway command. Expected: start, stop, status".to_string()),
        },
        "logs" => Ok(Command::Logs),
        "register" => Ok(Command::Register),
        "tasks" => Ok(Command::Tasks),
        "doctor" => Ok(Command::Doctor),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("Unknown command: {}", other)),
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(message) => {
            print_error(&message);
            print_help();
            return Ok(());
        }
    };
    if command == Command::Help {
        print_help();
        return Ok(());
    }

    let config = KernelConfig::load(NativePlatform::data_dir()).await?;
    let run_dir = config.run_dir();

    match command {
        Command::Run => daemon::run_kernel(config, false).await,
        Command::DaemonRun => daemon::run_kernel(config, true).await,
        Command::GatewayStart => daemon::gateway_start(&run_dir).await,
        Command::GatewayStop => daemon::gateway_stop(&run_dir).await,
        Command::GatewayStatus => daemon::gateway_status(&run_dir).await,
        Command::Logs => daemon::follow_logs(&run_dir).await,
        Command::Register => manage::run_register(&config, &args).await,
        Command::Tasks => manage::run_tasks(&config, &args).await,
        Command::Doctor => {
            if !doctor::run_doctor(&config).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Help => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, parse_command};

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_command_maps_subcommands() {
        assert_eq!(parse_command(&args(&["kestrel"])), Ok(Command::Help));
        assert_eq!(parse_command(&args(&["kestrel", "run"])), Ok(Command::Run));
        assert_eq!(
            parse_command(&args(&["kestrel", "gateway", "status"])),
            Ok(Command::GatewayStatus)
        );
        assert_eq!(
            parse_command(&args(&["kestrel", "register", "--chat", "x"])),
            Ok(Command::Register)
        );
    }

    #[test]
    fn parse_command_rejects_unknown_input() {
        assert!(parse_command(&args(&["kestrel", "gateway"])).is_err());
        assert!(parse_command(&args(&["kestrel", "gateway", "restart"])).is_err());
        assert!(parse_command(&args(&["kestrel", "frobnicate"])).is_err());
    }
}
