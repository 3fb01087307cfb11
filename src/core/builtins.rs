// src/core/builtins.rs

//! Commands compiled into flowrun.

use crate::{
    constants::SYS_KEY_PREFIX,
    core::{
        args::{ArgVals, ConfigError},
        cmd::{CmdCtx, CmdError, CmdKind, CmdTree, PowerResult},
        env::{EnvLayerKind, parse_duration},
        flow::{ParsedCmds, display_name},
    },
};
use colored::Colorize;
use std::thread;

/// Registers every builtin into `tree`.
pub fn register_builtins(tree: &mut CmdTree) -> Result<(), ConfigError> {
    tree.register("noop", CmdKind::normal(|_, _| Ok(true)), "Does nothing.")?
        .set_quiet(true);

    tree.register("echo", CmdKind::normal(echo), "Prints a message.")?
        .set_quiet(true)
        .add_arg("msg", "", &["m"])?;

    tree.register("sleep", CmdKind::normal(sleep), "Pauses the flow.")?
        .add_arg("dur", "1s", &["d"])?;

    tree.register(
        "env.ls",
        CmdKind::normal(env_ls),
        "Lists the visible env (system keys hidden).",
    )?
    .set_quiet(true);

    tree.register(
        "env.set",
        CmdKind::normal(env_set),
        "Writes a key into the session env.",
    )?
    .add_arg("key", "", &["k"])?
    .add_arg("value", "", &["v"])?;

    tree.register(
        "env.rm",
        CmdKind::normal(env_rm),
        "Removes a key from the session env and the layers below it.",
    )?
    .add_arg("key", "", &["k"])?;

    tree.register(
        "bg.wait",
        CmdKind::normal(bg_wait),
        "Waits for every background task.",
    )?;

    tree.register(
        "bg.attach",
        CmdKind::normal(bg_attach),
        "Shows a background task's output and waits for it.",
    )?
    .add_arg("id", "", &["i"])?;

    tree.register(
        "desc",
        CmdKind::power(desc),
        "Describes the rest of the flow instead of running it.",
    )?
    .set_quiet(true);

    Ok(())
}

fn echo(argv: &ArgVals, ctx: &mut CmdCtx<'_>) -> Result<bool, CmdError> {
    writeln!(ctx.out, "{}", argv.get_raw("msg"))?;
    Ok(true)
}

fn sleep(argv: &ArgVals, _ctx: &mut CmdCtx<'_>) -> Result<bool, CmdError> {
    let raw = argv.get_raw("dur");
    let dur = parse_duration(raw).map_err(|e| CmdError::InvalidArg {
        arg: "dur".to_string(),
        reason: e.to_string(),
    })?;
    if let Some(dur) = dur {
        log::debug!("Sleeping {}", humantime::format_duration(dur));
        thread::sleep(dur);
    }
    Ok(true)
}

fn env_ls(_argv: &ArgVals, ctx: &mut CmdCtx<'_>) -> Result<bool, CmdError> {
    for (key, value) in ctx.env.flatten(true, &[SYS_KEY_PREFIX], true) {
        let layer = ctx
            .env
            .defined_in(&key)
            .map(|kind| kind.name())
            .unwrap_or_default();
        writeln!(ctx.out, "{} = {} {}", key.cyan(), value, format!("({})", layer).dimmed())?;
    }
    Ok(true)
}

fn env_set(argv: &ArgVals, ctx: &mut CmdCtx<'_>) -> Result<bool, CmdError> {
    let key = argv.get_raw("key");
    if key.is_empty() {
        return Err(CmdError::InvalidArg {
            arg: "key".to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    let session = ctx.env.get_layer(EnvLayerKind::Session)?;
    ctx.env.delete_through_all(key, EnvLayerKind::Session);
    session.set(key, argv.get_raw("value"));
    Ok(true)
}

fn env_rm(argv: &ArgVals, ctx: &mut CmdCtx<'_>) -> Result<bool, CmdError> {
    let key = argv.get_raw("key");
    ctx.env.delete_through_all(key, EnvLayerKind::Default);
    Ok(true)
}

fn bg_wait(_argv: &ArgVals, ctx: &mut CmdCtx<'_>) -> Result<bool, CmdError> {
    let errors = ctx.bg.wait_for_all_bg_tasks_finish();
    for e in &errors {
        writeln!(ctx.out, "{} {}", "✗".red(), e)?;
    }
    Ok(errors.is_empty())
}

fn bg_attach(argv: &ArgVals, ctx: &mut CmdCtx<'_>) -> Result<bool, CmdError> {
    let given = argv.get_raw("id");
    let found = if given.is_empty() {
        ctx.bg.get_latest_task()
    } else {
        ctx.bg.resolve(given)
    };
    let id = found.ok_or_else(|| CmdError::failed(format!("no background task matches '{}'", given)))?;

    ctx.bg.bring_to_front(&id)?;
    ctx.bg.wait_for_finish(&id)?;
    Ok(true)
}

/// Prints what the remaining flow would do and consumes it.
fn desc(
    _argv: &ArgVals,
    ctx: &mut CmdCtx<'_>,
    flow: &mut ParsedCmds,
    index: usize,
) -> Result<PowerResult, CmdError> {
    let rest = ParsedCmds {
        cmds: flow.cmds.iter().skip(index + 1).cloned().collect(),
        global_env: flow.global_env.clone(),
        global_seq_idx: None,
        tail_mode: false,
    };
    writeln!(ctx.out, "{} {}", "flow:".bold(), rest.render_flow())?;
    for (i, parsed) in rest.cmds.iter().enumerate() {
        let name = display_name(ctx.tree, parsed);
        let Some(cmd) = parsed.last_cmd_id().and_then(|id| ctx.tree.cmd(id)) else {
            writeln!(ctx.out, "  [{}] {}", i, "(env only)".dimmed())?;
            continue;
        };
        writeln!(ctx.out, "  [{}] {} {}", i, name.green(), format!("({})", cmd.kind.type_name()).dimmed())?;
        if !cmd.help.is_empty() {
            writeln!(ctx.out, "      {}", cmd.help)?;
        }
        for (key, op) in cmd.env_ops.iter() {
            writeln!(ctx.out, "      {} {}", format!("{}", op).yellow(), key)?;
        }
        for dep in &cmd.depends {
            writeln!(ctx.out, "      needs {}", dep.os_cmd)?;
        }
        if let Some(delay) = parsed.sys_args.delay {
            writeln!(ctx.out, "      delayed {}", humantime::format_duration(delay))?;
        }
    }
    Ok(PowerResult {
        succeeded: true,
        next: flow.len(),
    })
}
