use crate::cli::handlers::commons;
use anyhow::Result;
use clap::Parser;
use colored::*;

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Removes finished sessions older than the retention period."
)]
struct CleanArgs {}

pub fn handle(args: Vec<String>) -> Result<()> {
    let _clean_args = CleanArgs::try_parse_from(&args)?;
    let ws = commons::load_workspace()?;
    let removed = ws.store.clean_stale();
    println!("{} Removed {} stale session(s).", "✓".green(), removed);
    Ok(())
}
