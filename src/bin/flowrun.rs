// src/bin/flowrun.rs

use anyhow::Result;
use clap::Parser;
use colored::*;
use flowrun::cli::{Cli, handlers};

// --- Command Definition and Registry ---

/// Defines a system command, its aliases, and its handler function.
struct CommandDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    handler: fn(Vec<String>) -> Result<()>,
}

/// Every action flowrun knows. Any other first word starts a flow.
static COMMAND_REGISTRY: &[CommandDefinition] = &[
    CommandDefinition {
        name: "check",
        aliases: &[],
        handler: handlers::check::handle,
    },
    CommandDefinition {
        name: "clean",
        aliases: &[],
        handler: handlers::clean::handle,
    },
    CommandDefinition {
        name: "run",
        aliases: &["r"],
        handler: handlers::run::handle,
    },
    CommandDefinition {
        name: "sessions",
        aliases: &["ls"],
        handler: handlers::sessions::handle,
    },
];

/// Finds a command definition in the registry by its name or alias.
fn find_command(name: &str) -> Option<&'static CommandDefinition> {
    COMMAND_REGISTRY
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

fn main() {
    env_logger::init();

    if let Err(e) = run_cli(Cli::parse()) {
        // --- Centralized Error Handling ---
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

/// Routes the first word to an action, or treats the whole line as a flow.
fn run_cli(cli: Cli) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);

    let Some(first) = cli.action_or_flow else {
        println!("Usage: flowrun <run|check|sessions|clean> [args...] | flowrun <flow>");
        return Ok(());
    };

    if let Some(command) = find_command(&first) {
        (command.handler)(cli.args)
    } else {
        // Not an action: the words are a flow, a shortcut for `run`.
        let mut run_args = vec![first];
        run_args.extend(cli.args);
        handlers::run::handle(run_args)
    }
}
