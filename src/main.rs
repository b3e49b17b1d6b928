//! DSG CLI entry point: parse args, dispatch, render errors, exit.

use std::process;

use dsg::cli::{Cli, Command};
use dsg::transport::close_all_connections;

fn operation_name(command: &Command) -> &'static str {
    match command {
        Command::Init { .. } => "init",
        Command::Clone { .. } => "clone",
        Command::Sync { .. } => "sync",
        Command::Status => "status",
        Command::Log { .. } => "log",
        Command::Blame { .. } => "blame",
        Command::ListFiles { .. } => "list-files",
        Command::ListRepos => "list-repos",
        Command::ValidateConfig { .. } => "validate-config",
        Command::ValidateFile { .. } => "validate-file",
        Command::ValidateSnapshot { .. } => "validate-snapshot",
        Command::ValidateChain => "validate-chain",
    }
}

fn main() {
    let parsed = Cli::parse_args();
    let operation = operation_name(&parsed.command);
    let json_mode = parsed.json;

    let result = dsg::cli::run_cli(parsed);
    close_all_connections();

    if let Err(e) = result {
        dsg::cli::io::write_error(operation, &e, json_mode);
        process::exit(e.exit_code());
    }
}
