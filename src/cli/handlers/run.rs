use crate::{
    cli::handlers::commons,
    constants::{BREAKPOINT_AFTER_KEY, BREAKPOINT_BEFORE_KEY, SYS_KEY_PREFIX},
    core::{env_file::save_env_to_file, executor::Executor},
    system::bg_tasks::BgTaskScheduler,
};
use anyhow::{Result, anyhow};
use clap::Parser;
use colored::*;
use std::sync::Arc;

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Runs a flow: `cmd [arg=value ...] [{key=value}] [%delay=5s] : cmd ...`."
)]
struct RunArgs {
    /// Pause before these commands (comma separated).
    #[arg(long, value_name = "CMDS")]
    break_before: Option<String>,

    /// Pause after these commands (comma separated).
    #[arg(long, value_name = "CMDS")]
    break_after: Option<String>,

    /// Do not carry this run's env over to the next one.
    #[arg(long)]
    no_persist: bool,

    /// The flow itself.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    flow: Vec<String>,
}

/// Main entry point for the `run` command (and for bare flows).
pub fn handle(args: Vec<String>) -> Result<()> {
    let run_args = RunArgs::try_parse_from(&args)?;
    let ws = commons::load_workspace()?;

    let removed = ws.store.clean_stale();
    if removed > 0 {
        log::debug!("Removed {} stale session(s)", removed);
    }

    let flow = commons::parse_flow(&ws, &run_args.flow)?;
    if let Some(cmds) = &run_args.break_before {
        ws.env.set(BREAKPOINT_BEFORE_KEY, cmds);
    }
    if let Some(cmds) = &run_args.break_after {
        ws.env.set(BREAKPOINT_AFTER_KEY, cmds);
    }

    // --- Execute ---
    let session = ws.store.create_session()?;
    let session_dir = session.dir.clone();
    let bg = Arc::new(BgTaskScheduler::new());
    let mut executor = Executor::new(ws.tree.clone(), ws.parser.clone(), bg.clone()).with_session(session);
    let result = executor.run(&ws.env, flow);

    // Background tasks always get to finish, even after a failure.
    let bg_errors = bg.wait_for_all_bg_tasks_finish();
    for e in &bg_errors {
        eprintln!("{} {}", "✗".red(), e);
    }

    if !run_args.no_persist {
        save_env_to_file(&ws.env, &ws.persisted_env_path, false, &[SYS_KEY_PREFIX])?;
    }
    log::debug!("Session trace at '{}'", session_dir.display());

    result?;
    if !bg_errors.is_empty() {
        return Err(anyhow!("{} background task(s) failed", bg_errors.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_keep_flow_words_verbatim() {
        let args: Vec<String> = ["--break-before", "db.start", "db.start", "--port=1", ":", "echo", "msg=hi"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let parsed = RunArgs::try_parse_from(&args).unwrap();

        assert_eq!(parsed.break_before.as_deref(), Some("db.start"));
        assert_eq!(parsed.flow, vec!["db.start", "--port=1", ":", "echo", "msg=hi"]);
    }
}
