use crate::{cli::handlers::commons, system::sessions::SessionStatus};
use anyhow::Result;
use clap::Parser;
use colored::*;

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Lists recorded sessions and their status.")]
struct SessionsArgs {
    /// Print the sessions (with their parsed traces) as JSON.
    #[arg(long)]
    json: bool,
}

pub fn handle(args: Vec<String>) -> Result<()> {
    let sessions_args = SessionsArgs::try_parse_from(&args)?;
    let ws = commons::load_workspace()?;
    let sessions = ws.store.list()?;

    if sessions_args.json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions under '{}'.", ws.store.root().display());
        return Ok(());
    }
    for session in &sessions {
        println!("{}", describe(session));
    }
    Ok(())
}

fn describe(session: &SessionStatus) -> String {
    let status = match &session.trace {
        _ if session.running => "running".blue().bold(),
        Some(trace) if trace.has_failure() => "failed".red(),
        Some(trace) if trace.finished => "succeeded".green(),
        _ => "interrupted".yellow(),
    };
    let flow = session
        .trace
        .as_ref()
        .and_then(|t| t.flow.first())
        .map(String::as_str)
        .unwrap_or("");
    let mut line = format!("{:<24} {:<12} {}", session.dir_name, status, flow.dimmed());
    if let Some(err) = session.trace.as_ref().and_then(|t| t.first_error()) {
        line.push_str(&format!("\n{:<24} {}", "", err.red()));
    }
    line
}
