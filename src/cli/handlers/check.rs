use crate::{
    cli::handlers::commons,
    core::env_ops_checker::check_env_ops,
    system::os_deps::check_os_depends,
};
use anyhow::{Result, anyhow};
use clap::Parser;
use colored::*;

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Checks a flow's declared env reads and writes without running it."
)]
struct CheckArgs {
    /// Only report reads that are certain to fail.
    #[arg(long)]
    ignore_maybe: bool,

    /// The flow to check.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    flow: Vec<String>,
}

pub fn handle(args: Vec<String>) -> Result<()> {
    let check_args = CheckArgs::try_parse_from(&args)?;
    let ws = commons::load_workspace()?;
    let flow = commons::parse_flow(&ws, &check_args.flow)?;

    let findings = check_env_ops(&ws.tree, ws.parser.as_ref(), &flow, &ws.env, check_args.ignore_maybe);
    let missing = check_os_depends(&ws.tree, ws.parser.as_ref(), &flow, &ws.env);

    println!("{} {}", "→".blue(), flow.render_flow().green());
    if findings.is_empty() && missing.is_empty() {
        println!("{} {}", "✓".green(), "No problems found.");
        return Ok(());
    }

    let mut fatal = 0;
    for f in &findings {
        let mark = if f.finding.is_fatal() {
            fatal += 1;
            "✗".red()
        } else {
            "⚠".yellow()
        };
        print!("  {} '{}' in '{}': {}", mark, f.key.cyan(), f.cmd, f.finding);
        if f.may_write_cmds.is_empty() {
            println!();
        } else {
            println!(" (may be written by {})", f.may_write_cmds.join(", "));
        }
    }
    for dep in &missing {
        println!("  {} {}", "✗".red(), dep);
    }

    if fatal > 0 || !missing.is_empty() {
        return Err(anyhow!(
            "The flow would be refused: {} fatal finding(s), {} missing OS command(s).",
            fatal,
            missing.len()
        ));
    }
    Ok(())
}
