// src/core/executor.rs

//! Walks a parsed flow and runs it.
//!
//! Every command gets its own `Command` layer over the flow's layer; flow commands
//! are rendered, parsed and run recursively in a `SubFlow` layer; delayed
//! commands are handed to the background scheduler. Persistent writes (fixed
//! `val2env` values, values written back by scripts) land in the `Session` layer.

use crate::{
    constants::{
        BG_TASK_ID_KEY, BREAKPOINT_AFTER_KEY, BREAKPOINT_BEFORE_KEY, SESSION_DIR_VAR, STACK_DEPTH_KEY,
        STACK_KEY, STACK_SEP, STEP_DELAY_KEY, SYS_KEY_PREFIX,
    },
    core::{
        args::ArgVals,
        cmd::{Cmd, CmdCtx, CmdError, CmdKind, CmdTree},
        env::{Env, EnvError, EnvLayerKind, EnvVal},
        env_ops_checker::{EnvOpsCheckResult, MAX_FLOW_DEPTH, check_env_ops},
        flow::{ParsedCmd, ParsedCmds, apply_mapping_gen_env_and_argv, display_name, new_sub_flow_env},
        parser::{FlowParser, ParseError, lines_to_tokens},
        template::{RenderError, render_template},
    },
    system::{
        bg_tasks::{BgTaskCtx, BgTaskError, BgTaskScheduler, TaskOutcome},
        executor::{execute_script, export_env_vars},
        os_deps::{MissingDepend, check_os_depends},
        sessions::Session,
        status_trace::{ExecutedResult, StatusError, StatusWriter},
    },
};
use chrono::{DateTime, Local};
use colored::Colorize;
use dialoguer::{Select, theme::ColorfulTheme};
use scopeguard::ScopeGuard;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Command #{index} '{cmd}' failed: {source}")]
    CmdFailed {
        index: usize,
        cmd: String,
        #[source]
        source: CmdError,
    },
    #[error("Refusing to run the flow:\n{}", describe_findings(.0))]
    EnvOpsFatal(Vec<EnvOpsCheckResult>),
    #[error("Refusing to run the flow, missing OS commands: {}", describe_missing(.0))]
    MissingDepends(Vec<MissingDepend>),
    #[error("Cannot delay '{0}': background tasks cannot schedule other tasks.")]
    NestedSchedule(String),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("Cannot parse the flow of '{cmd}': {source}")]
    SubFlowParse {
        cmd: String,
        #[source]
        source: ParseError,
    },
    #[error("'{0}' expands sub-flows more than {max} levels deep.", max = MAX_FLOW_DEPTH)]
    MaxDepth(String),
    #[error("'{0}' is not an executable command.")]
    NotExecutable(String),
    #[error("Aborted at breakpoint on '{0}'.")]
    Aborted(String),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Bg(#[from] BgTaskError),
}

fn describe_findings(findings: &[EnvOpsCheckResult]) -> String {
    findings
        .iter()
        .map(|f| format!("  - '{}' in '{}': {}", f.key, f.cmd, f.finding))
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_missing(missing: &[MissingDepend]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where the top-level flow is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Pending,
    Running(usize),
    Succeeded,
    Failed(usize),
}

/// One executed (or scheduled, or skipped) command, at any depth.
#[derive(Debug, Clone)]
pub struct CmdRecord {
    pub cmd: String,
    pub depth: usize,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub result: ExecutedResult,
    pub error: Option<String>,
    pub scheduled_task: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakPhase {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakAction {
    Continue,
    /// Before: don't run the command. After: same as continue.
    Skip,
    Abort,
}

/// Asks the user what to do at a breakpoint.
pub trait BreakpointPrompt: Send + Sync {
    fn confirm(&self, cmd: &str, phase: BreakPhase) -> BreakAction;
}

/// Interactive prompt on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl BreakpointPrompt for TerminalPrompt {
    fn confirm(&self, cmd: &str, phase: BreakPhase) -> BreakAction {
        let when = match phase {
            BreakPhase::Before => "before",
            BreakPhase::After => "after",
        };
        let items = ["Continue", "Skip this command", "Abort the flow"];
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Breakpoint {} '{}'", when, cmd))
            .items(&items)
            .default(0)
            .interact();
        match selection {
            Ok(0) => BreakAction::Continue,
            Ok(1) => BreakAction::Skip,
            Ok(_) => BreakAction::Abort,
            Err(e) => {
                log::warn!("Breakpoint prompt failed, aborting: {}", e);
                BreakAction::Abort
            }
        }
    }
}

/// Never stops; for non-interactive runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoContinue;

impl BreakpointPrompt for AutoContinue {
    fn confirm(&self, cmd: &str, _phase: BreakPhase) -> BreakAction {
        log::debug!("Breakpoint on '{}' passed without prompting", cmd);
        BreakAction::Continue
    }
}

pub struct Executor {
    tree: Arc<CmdTree>,
    parser: Arc<dyn FlowParser>,
    bg: Arc<BgTaskScheduler>,
    prompt: Arc<dyn BreakpointPrompt>,
    session: Option<Session>,
    out: Box<dyn Write + Send>,
    state: FlowState,
    records: Vec<CmdRecord>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("state", &self.state)
            .field("session", &self.session.as_ref().map(|s| &s.id))
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

// --- Construction ---

impl Executor {
    pub fn new(tree: Arc<CmdTree>, parser: Arc<dyn FlowParser>, bg: Arc<BgTaskScheduler>) -> Self {
        Self {
            tree,
            parser,
            bg,
            prompt: Arc::new(TerminalPrompt),
            session: None,
            out: Box::new(io::stdout()),
            state: FlowState::Pending,
            records: Vec::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn BreakpointPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Traces the run into the session and exposes its directory to scripts.
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.out = out;
        self
    }

    /// An executor for one background task: same tree and collaborators, its own
    /// output and session.
    fn fork(&self, session: Option<Session>, out: Box<dyn Write + Send>) -> Self {
        Self {
            tree: Arc::clone(&self.tree),
            parser: Arc::clone(&self.parser),
            bg: Arc::clone(&self.bg),
            prompt: Arc::clone(&self.prompt),
            session,
            out,
            state: FlowState::Pending,
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn records(&self) -> &[CmdRecord] {
        &self.records
    }

    pub fn bg(&self) -> &Arc<BgTaskScheduler> {
        &self.bg
    }

    pub fn tree(&self) -> &CmdTree {
        &self.tree
    }
}

// --- Main Public Function ---

impl Executor {
    /// Runs a top-level flow against `env` (the session layer or a layer above it).
    ///
    /// Unless the flow is in tail-mode, it is first checked: a certain read of a
    /// key nothing writes, or a missing OS dependency, stops it before any command
    /// runs. Risky reads are reported and the flow runs anyway.
    pub fn run(&mut self, env: &Env, mut flow: ParsedCmds) -> Result<(), ExecError> {
        if flow.move_priority_to_front() {
            log::debug!("Tail-mode: the priority command runs first, checks are skipped");
        }
        self.begin_trace(env, &flow)?;

        let result = self.verify(env, &flow).and_then(|()| {
            flow.global_env.write_to(env);
            self.execute_flow(env, &mut flow, 0)
        });
        self.end_trace(env);
        result
    }

    fn verify(&mut self, env: &Env, flow: &ParsedCmds) -> Result<(), ExecError> {
        if flow.tail_mode {
            return Ok(());
        }
        let findings = check_env_ops(&self.tree, self.parser.as_ref(), flow, env, false);
        let (fatal, risks): (Vec<_>, Vec<_>) = findings.into_iter().partition(|f| f.finding.is_fatal());
        for risk in &risks {
            log::warn!("Env-ops risk: '{}' in '{}': {}", risk.key, risk.cmd, risk.finding);
            let mut line = format!(
                "{} '{}' in '{}': {}",
                "⚠".yellow(),
                risk.key.cyan(),
                risk.cmd,
                risk.finding
            );
            if !risk.may_write_cmds.is_empty() {
                line.push_str(&format!(" (may be written by {})", risk.may_write_cmds.join(", ")));
            }
            self.say(&line);
        }
        if !fatal.is_empty() {
            return Err(ExecError::EnvOpsFatal(fatal));
        }

        let missing = check_os_depends(&self.tree, self.parser.as_ref(), flow, env);
        if !missing.is_empty() {
            return Err(ExecError::MissingDepends(missing));
        }
        Ok(())
    }

    /// Runs a flow inside a background task: no checks, they ran for the whole flow.
    fn run_detached(&mut self, env: &Env, mut flow: ParsedCmds) -> Result<(), ExecError> {
        self.begin_trace(env, &flow)?;
        let result = self.execute_flow(env, &mut flow, 0);
        self.end_trace(env);
        result
    }

    fn begin_trace(&mut self, env: &Env, flow: &ParsedCmds) -> Result<(), ExecError> {
        self.state = FlowState::Pending;
        if let Some(session) = &self.session {
            session.bind(&env.get_layer(EnvLayerKind::Session)?);
        }
        let rendered = flow.render_flow();
        self.trace(|t| t.flow_start(0, &rendered));
        Ok(())
    }

    fn end_trace(&mut self, env: &Env) {
        self.trace(StatusWriter::finish);
        if let Some(session) = &self.session {
            if let Err(e) = session.save_env(env) {
                log::warn!("Could not save the env of session '{}': {}", session.id, e);
            }
        }
        if let Err(e) = self.out.flush() {
            log::debug!("Could not flush flow output: {}", e);
        }
    }
}

// --- Internal Recursive Executor ---

impl Executor {
    fn execute_flow(&mut self, env: &Env, flow: &mut ParsedCmds, depth: usize) -> Result<(), ExecError> {
        let step_delay = env.get_duration(STEP_DELAY_KEY)?;
        let mut index = 0;

        while index < flow.len() {
            if depth == 0 {
                self.state = FlowState::Running(index);
            }
            if index > 0 {
                if let Some(pause) = step_delay {
                    thread::sleep(pause);
                }
            }
            let Some(parsed) = flow.cmds.get(index).cloned() else {
                break;
            };
            match self.execute_cmd(env, flow, index, &parsed, depth) {
                Ok(next) => index = next,
                Err(e) => {
                    if depth == 0 {
                        self.state = FlowState::Failed(index);
                    }
                    return Err(e);
                }
            }
        }
        if depth == 0 {
            self.state = FlowState::Succeeded;
        }
        Ok(())
    }

    /// Runs the command at `index` and returns the index to continue from.
    fn execute_cmd(
        &mut self,
        env: &Env,
        flow: &mut ParsedCmds,
        index: usize,
        parsed: &ParsedCmd,
        depth: usize,
    ) -> Result<usize, ExecError> {
        if parsed.is_env_only() {
            parsed.apply_env(env);
            return Ok(index + 1);
        }
        let path = display_name(&self.tree, parsed);
        let tree = Arc::clone(&self.tree);
        let Some(cmd) = parsed.last_cmd_id().and_then(|id| tree.cmd(id)) else {
            return Err(ExecError::NotExecutable(path));
        };

        if breakpoint_hit(env, BREAKPOINT_BEFORE_KEY, &path) {
            match self.prompt.confirm(&path, BreakPhase::Before) {
                BreakAction::Continue => {}
                BreakAction::Skip => {
                    let now = Local::now();
                    self.say(&format!("{} {}", "↷".dimmed(), path.dimmed()));
                    self.trace(|t| t.cmd_start(depth, &path, &Default::default()));
                    self.trace(|t| t.cmd_finish(depth, &Default::default(), ExecutedResult::Skipped, None));
                    self.record(&path, depth, now, ExecutedResult::Skipped, None, None);
                    return Ok(index + 1);
                }
                BreakAction::Abort => return Err(ExecError::Aborted(path)),
            }
        }

        if let Some(delay) = parsed.sys_args.delay {
            return self.schedule(env, parsed, &path, delay, depth).map(|()| index + 1);
        }

        let session_env = env.get_layer(EnvLayerKind::Session)?;
        let _stack = push_stack(&session_env, &path);

        let started = Local::now();
        let cmd_env = parsed.gen_cmd_env(env);
        let argv = apply_mapping_gen_env_and_argv(cmd, &cmd_env);
        for (key, value) in cmd.val2env.iter() {
            write_persistent(&cmd_env, &session_env, key, value);
        }

        log::debug!("Running '{}' ({}) at depth {}", path, cmd.kind.type_name(), depth);
        if !cmd.quiet {
            self.say(&format!("{} {}", "→".blue(), path.green()));
        }
        let start_env = visible_env(&cmd_env);
        self.trace(|t| t.cmd_start(depth, &path, &start_env));

        let outcome = self.dispatch(cmd, &cmd_env, &session_env, &argv, flow, index, &path, depth);

        let finish_env = visible_env(&cmd_env);
        let (result, error) = match &outcome {
            Ok(_) => (ExecutedResult::Succeeded, None),
            Err(e) => (ExecutedResult::Failed, Some(e.to_string())),
        };
        self.trace(|t| t.cmd_finish(depth, &finish_env, result, error.as_deref()));
        self.record(&path, depth, started, result, error, None);
        log::debug!("Finished '{}': {}", path, result);
        let next = outcome?;

        if breakpoint_hit(env, BREAKPOINT_AFTER_KEY, &path)
            && self.prompt.confirm(&path, BreakPhase::After) == BreakAction::Abort
        {
            return Err(ExecError::Aborted(path));
        }
        Ok(next)
    }

    fn dispatch(
        &mut self,
        cmd: &Cmd,
        cmd_env: &Env,
        session_env: &Env,
        argv: &ArgVals,
        flow: &mut ParsedCmds,
        index: usize,
        path: &str,
        depth: usize,
    ) -> Result<usize, ExecError> {
        let failed = |source: CmdError| ExecError::CmdFailed {
            index,
            cmd: path.to_string(),
            source,
        };

        match &cmd.kind {
            CmdKind::Normal(handler) => {
                let mut ctx = CmdCtx {
                    env: cmd_env,
                    out: self.out.as_mut(),
                    bg: self.bg.as_ref(),
                    tree: self.tree.as_ref(),
                    cmd_path: path,
                };
                match handler(argv, &mut ctx) {
                    Ok(true) => Ok(index + 1),
                    Ok(false) => Err(failed(CmdError::failed("the command reported failure"))),
                    Err(e) => Err(failed(e)),
                }
            }
            CmdKind::Power(handler) => {
                let mut ctx = CmdCtx {
                    env: cmd_env,
                    out: self.out.as_mut(),
                    bg: self.bg.as_ref(),
                    tree: self.tree.as_ref(),
                    cmd_path: path,
                };
                match handler(argv, &mut ctx, flow, index) {
                    Ok(res) if res.succeeded => Ok(res.next.max(index + 1)),
                    Ok(_) => Err(failed(CmdError::failed("the command reported failure"))),
                    Err(e) => Err(failed(e)),
                }
            }
            CmdKind::File { command_line, cwd } => {
                self.run_script(cmd, command_line, cwd, cmd_env, session_env, argv)
                    .map_err(failed)?;
                Ok(index + 1)
            }
            CmdKind::Dir { dir, entry } => {
                let script = dir.join(entry).display().to_string();
                let command_line = shlex::try_quote(&script)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| script.clone());
                self.run_script(cmd, &command_line, dir, cmd_env, session_env, argv)
                    .map_err(failed)?;
                Ok(index + 1)
            }
            CmdKind::Flow { lines } => {
                if depth >= MAX_FLOW_DEPTH {
                    return Err(ExecError::MaxDepth(path.to_string()));
                }
                let rendered = render_template(path, lines, cmd_env, argv)?;
                let mut sub = lines_to_tokens(&rendered)
                    .and_then(|tokens| self.parser.parse(self.tree.as_ref(), &tokens))
                    .map_err(|source| ExecError::SubFlowParse {
                        cmd: path.to_string(),
                        source,
                    })?;
                let sub_env = new_sub_flow_env(cmd_env, &sub);
                let sub_text = sub.render_flow();

                self.trace(|t| t.subflow_start(depth));
                self.trace(|t| t.flow_start(depth + 1, &sub_text));
                let result = self.execute_flow(&sub_env, &mut sub, depth + 1);
                self.trace(|t| t.subflow_finish(depth));
                result.map(|()| index + 1)
            }
        }
    }

    /// Runs a file or dir command. Values the script writes back go to the session.
    fn run_script(
        &mut self,
        cmd: &Cmd,
        command_line: &str,
        cwd: &std::path::Path,
        cmd_env: &Env,
        session_env: &Env,
        argv: &ArgVals,
    ) -> Result<(), CmdError> {
        let positional: Vec<String> = cmd
            .args
            .names()
            .iter()
            .map(|name| argv.get_raw(name).to_string())
            .collect();
        let mut vars = export_env_vars(&cmd_env.flatten(true, &[], false));
        if let Some(session) = &self.session {
            vars.insert(SESSION_DIR_VAR.to_string(), session.dir.display().to_string());
        }

        let written = execute_script(command_line, &positional, cwd, &vars, self.out.as_mut())?;
        for (key, value) in written {
            log::debug!("'{}' wrote back '{}'", cmd.path, key);
            write_persistent(cmd_env, session_env, &key, &value);
        }
        Ok(())
    }

    /// Hands a delayed command to the scheduler. Scheduling itself is the success.
    fn schedule(
        &mut self,
        env: &Env,
        parsed: &ParsedCmd,
        path: &str,
        delay: Duration,
        depth: usize,
    ) -> Result<(), ExecError> {
        let started = Local::now();
        let bg_env = env.clone_deep();
        let mut single = parsed.clone();
        single.sys_args.delay = None;
        let task_flow = ParsedCmds::from_cmds(vec![single]);

        let parent_session = self.session.clone();
        let template = self.fork(None, Box::new(io::sink()));
        let job = move |ctx: BgTaskCtx| -> TaskOutcome {
            let task_session = parent_session.and_then(|s| match s.task_session(&ctx.id) {
                Ok(task_session) => Some(task_session),
                Err(e) => {
                    log::warn!("Background task {} runs without a session: {}", ctx.id, e);
                    None
                }
            });
            if let Ok(layer) = bg_env.get_layer(EnvLayerKind::Session) {
                layer.set(BG_TASK_ID_KEY, &ctx.id);
            }
            let mut executor = template.fork(task_session, Box::new(ctx.out));
            executor.run_detached(&bg_env, task_flow).map_err(|e| e.to_string())
        };

        let id = self.bg.schedule(path, delay, job).map_err(|e| match e {
            BgTaskError::NestedSchedule(name) => ExecError::NestedSchedule(name),
            other => ExecError::Bg(other),
        })?;

        self.say(&format!(
            "{} {} {}",
            "⏱".blue(),
            path.green(),
            format!("(task {} in {})", id, humantime::format_duration(delay)).dimmed()
        ));
        let snapshot = visible_env(env);
        self.trace(|t| t.cmd_start(depth, path, &snapshot));
        self.trace(|t| t.cmd_scheduled(depth, &id));
        self.trace(|t| t.cmd_finish(depth, &snapshot, ExecutedResult::Scheduled, None));
        self.record(path, depth, started, ExecutedResult::Scheduled, None, Some(id));
        Ok(())
    }
}

// --- Helpers ---

impl Executor {
    fn say(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{}", line) {
            log::debug!("Could not write flow output: {}", e);
        }
    }

    /// Trace failures never stop a flow.
    fn trace(&self, write: impl FnOnce(&StatusWriter) -> Result<(), StatusError>) {
        if let Some(session) = &self.session {
            if let Err(e) = write(&session.trace) {
                log::warn!("Could not write the session trace: {}", e);
            }
        }
    }

    fn record(
        &mut self,
        cmd: &str,
        depth: usize,
        started: DateTime<Local>,
        result: ExecutedResult,
        error: Option<String>,
        scheduled_task: Option<String>,
    ) {
        self.records.push(CmdRecord {
            cmd: cmd.to_string(),
            depth,
            started,
            finished: Local::now(),
            result,
            error,
            scheduled_task,
        });
    }
}

fn visible_env(env: &Env) -> std::collections::BTreeMap<String, String> {
    env.flatten(false, &[SYS_KEY_PREFIX], false)
}

/// Writes a value that outlives the command: into the session layer, clearing
/// any shadowing copy between the command layer and the session.
fn write_persistent(cmd_env: &Env, session_env: &Env, key: &str, value: &str) {
    cmd_env.delete_through_all(key, EnvLayerKind::Session);
    session_env.set(key, value);
}

/// True if `key` holds a comma list naming `path`.
fn breakpoint_hit(env: &Env, key: &str, path: &str) -> bool {
    env.get_raw(key)
        .split(',')
        .map(str::trim)
        .any(|name| !name.is_empty() && name == path)
}

/// The session layer and its stack values before a push.
type SavedStack = (Env, Option<EnvVal>, Option<EnvVal>);

/// Pushes `path` onto the call stack kept in the session layer. The returned
/// guard restores the caller's stack when dropped, on every exit path.
fn push_stack(session_env: &Env, path: &str) -> ScopeGuard<SavedStack, impl FnOnce(SavedStack) + use<>> {
    let saved_stack = session_env.get_opt(STACK_KEY);
    let saved_depth = session_env.get_opt(STACK_DEPTH_KEY);

    let mut frames: Vec<String> = saved_stack
        .as_ref()
        .map(|v| {
            v.raw
                .split(STACK_SEP)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    frames.push(path.to_string());
    session_env.set(STACK_KEY, &frames.join(STACK_SEP));
    session_env.set_int(STACK_DEPTH_KEY, i64::try_from(frames.len()).unwrap_or(i64::MAX));

    scopeguard::guard(
        (session_env.clone(), saved_stack, saved_depth),
        |(layer, stack, depth)| {
            restore(&layer, STACK_KEY, stack);
            restore(&layer, STACK_DEPTH_KEY, depth);
        },
    )
}

fn restore(layer: &Env, key: &str, saved: Option<EnvVal>) {
    match saved {
        Some(val) => {
            layer.set_ext(key, &val.raw, val.is_arg);
        }
        None => {
            layer.delete(key);
        }
    }
}
