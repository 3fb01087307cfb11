// src/core/cmd.rs

//! Registered commands and the tree they are registered in.
//!
//! Nodes live in an arena (`Vec`) and are addressed by [`CmdId`]. Paths are
//! dotted (`db.restart`); every path segment can carry abbreviations.

use crate::{
    constants::CMD_PATH_SEP,
    core::{
        args::{Arg2Env, ArgVals, Args, ConfigError, EnvOp, EnvOps, Val2Env},
        auto_map::ArgsAutoMapStatus,
        env::{Env, EnvError},
        flow::ParsedCmds,
    },
    system::{bg_tasks::BgTaskError, bg_tasks::BgTaskScheduler, executor::ExecutionError},
};
use std::{fmt, io::Write, path::PathBuf, sync::Arc};
use thiserror::Error;

/// Index of a node in a [`CmdTree`].
pub type CmdId = usize;

/// A failure raised by a command handler. The executor attaches the flow position.
#[derive(Error, Debug)]
pub enum CmdError {
    #[error("{reason}")]
    Failed { reason: String },
    #[error("Argument '{arg}' is invalid: {reason}")]
    InvalidArg { arg: String, reason: String },
    #[error(transparent)]
    Exec(#[from] ExecutionError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Bg(#[from] BgTaskError),
    #[error("Output error: {0}")]
    Io(#[from] std::io::Error),
}

impl CmdError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// What a handler gets to work with besides its arguments.
pub struct CmdCtx<'a> {
    /// The command-layer environment. Persistent writes go to its session layer.
    pub env: &'a Env,
    pub out: &'a mut (dyn Write + Send),
    pub bg: &'a BgTaskScheduler,
    pub tree: &'a CmdTree,
    pub cmd_path: &'a str,
}

impl fmt::Debug for CmdCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdCtx")
            .field("cmd_path", &self.cmd_path)
            .finish_non_exhaustive()
    }
}

/// Result of a power command: success and the flow index to continue from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerResult {
    pub succeeded: bool,
    pub next: usize,
}

pub type NormalHandler = Arc<dyn Fn(&ArgVals, &mut CmdCtx<'_>) -> Result<bool, CmdError> + Send + Sync>;

/// Power handlers see (and may rewrite) the flow they run in.
pub type PowerHandler = Arc<
    dyn Fn(&ArgVals, &mut CmdCtx<'_>, &mut ParsedCmds, usize) -> Result<PowerResult, CmdError>
        + Send
        + Sync,
>;

/// How a command runs. Each variant carries only what it needs.
#[derive(Clone)]
pub enum CmdKind {
    /// A builtin handler.
    Normal(NormalHandler),
    /// A builtin handler with access to the surrounding flow.
    Power(PowerHandler),
    /// An external command line (e.g. `./deploy.sh` or `python3 tool.py`), run in `cwd`.
    File { command_line: String, cwd: PathBuf },
    /// A directory holding an entry script, run with the directory as cwd.
    Dir { dir: PathBuf, entry: String },
    /// A sub-flow template, rendered against the environment when invoked.
    Flow { lines: Vec<String> },
}

impl CmdKind {
    pub fn normal<F>(handler: F) -> Self
    where
        F: Fn(&ArgVals, &mut CmdCtx<'_>) -> Result<bool, CmdError> + Send + Sync + 'static,
    {
        Self::Normal(Arc::new(handler))
    }

    pub fn power<F>(handler: F) -> Self
    where
        F: Fn(&ArgVals, &mut CmdCtx<'_>, &mut ParsedCmds, usize) -> Result<PowerResult, CmdError>
            + Send
            + Sync
            + 'static,
    {
        Self::Power(Arc::new(handler))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Normal(_) => "normal",
            Self::Power(_) => "power",
            Self::File { .. } => "file",
            Self::Dir { .. } => "dir",
            Self::Flow { .. } => "flow",
        }
    }
}

impl fmt::Debug for CmdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal(_) => f.write_str("Normal(..)"),
            Self::Power(_) => f.write_str("Power(..)"),
            Self::File { command_line, cwd } => f
                .debug_struct("File")
                .field("command_line", command_line)
                .field("cwd", cwd)
                .finish(),
            Self::Dir { dir, entry } => f
                .debug_struct("Dir")
                .field("dir", dir)
                .field("entry", entry)
                .finish(),
            Self::Flow { lines } => f.debug_struct("Flow").field("lines", lines).finish(),
        }
    }
}

/// An OS executable a command needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Depend {
    pub os_cmd: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Cmd {
    pub path: String,
    pub help: String,
    pub kind: CmdKind,
    pub args: Args,
    pub arg2env: Arg2Env,
    pub val2env: Val2Env,
    pub env_ops: EnvOps,
    pub depends: Vec<Depend>,
    pub auto_map: ArgsAutoMapStatus,
    pub quiet: bool,
}

impl Cmd {
    pub fn new(path: &str, kind: CmdKind, help: &str) -> Self {
        Self {
            path: path.to_string(),
            help: help.to_string(),
            kind,
            args: Args::new(),
            arg2env: Arg2Env::default(),
            val2env: Val2Env::default(),
            env_ops: EnvOps::default(),
            depends: Vec::new(),
            auto_map: ArgsAutoMapStatus::default(),
            quiet: false,
        }
    }

    pub fn is_flow(&self) -> bool {
        matches!(self.kind, CmdKind::Flow { .. })
    }

    pub fn add_arg(&mut self, name: &str, default: &str, abbrs: &[&str]) -> Result<&mut Self, ConfigError> {
        let abbrs: Vec<String> = abbrs.iter().map(|s| s.to_string()).collect();
        self.args.add_arg(&self.path, name, default, &abbrs)?;
        Ok(self)
    }

    /// Binds an already declared argument to an env key.
    pub fn add_arg2env(&mut self, key: &str, arg: &str) -> Result<&mut Self, ConfigError> {
        if !self.args.has(arg) {
            return Err(ConfigError::MappingUnknownArg {
                cmd: self.path.clone(),
                arg: arg.to_string(),
            });
        }
        self.arg2env.add(&self.path, key, arg)?;
        Ok(self)
    }

    pub fn add_val2env(&mut self, key: &str, value: &str) -> &mut Self {
        self.val2env.add(key, value);
        self
    }

    pub fn add_env_op(&mut self, key: &str, op: EnvOp) -> &mut Self {
        self.env_ops.add(key, op);
        self
    }

    pub fn add_depend(&mut self, os_cmd: &str, reason: &str) -> &mut Self {
        self.depends.push(Depend {
            os_cmd: os_cmd.to_string(),
            reason: reason.to_string(),
        });
        self
    }

    pub fn set_quiet(&mut self, quiet: bool) -> &mut Self {
        self.quiet = quiet;
        self
    }
}

#[derive(Debug)]
struct CmdNode {
    name: String,
    abbrs: Vec<String>,
    parent: Option<CmdId>,
    children: Vec<CmdId>,
    cmd: Option<Cmd>,
}

/// The registry of commands. Node 0 is the unnamed root.
#[derive(Debug)]
pub struct CmdTree {
    nodes: Vec<CmdNode>,
}

impl Default for CmdTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CmdTree {
    pub const ROOT: CmdId = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![CmdNode {
                name: String::new(),
                abbrs: Vec::new(),
                parent: None,
                children: Vec::new(),
                cmd: None,
            }],
        }
    }

    fn node(&self, id: CmdId) -> Option<&CmdNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn name(&self, id: CmdId) -> &str {
        self.node(id).map(|n| n.name.as_str()).unwrap_or("")
    }

    pub fn abbrs(&self, id: CmdId) -> &[String] {
        self.node(id).map(|n| n.abbrs.as_slice()).unwrap_or(&[])
    }

    pub fn children(&self, id: CmdId) -> &[CmdId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: CmdId) -> Option<CmdId> {
        self.node(id).and_then(|n| n.parent)
    }

    /// The dotted path of a node (`db.restart`). The root has an empty path.
    pub fn display_path(&self, id: CmdId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(cid) = current {
            if cid == Self::ROOT {
                break;
            }
            segments.push(self.name(cid));
            current = self.parent(cid);
        }
        segments.reverse();
        segments.join(&CMD_PATH_SEP.to_string())
    }

    pub fn cmd(&self, id: CmdId) -> Option<&Cmd> {
        self.node(id).and_then(|n| n.cmd.as_ref())
    }

    pub fn cmd_mut(&mut self, id: CmdId) -> Option<&mut Cmd> {
        self.nodes.get_mut(id).and_then(|n| n.cmd.as_mut())
    }

    /// Finds a direct child by name or abbreviation.
    pub fn find_child(&self, parent: CmdId, name: &str) -> Option<CmdId> {
        let children = self.children(parent);
        children
            .iter()
            .copied()
            .find(|&c| self.name(c) == name)
            .or_else(|| {
                children
                    .iter()
                    .copied()
                    .find(|&c| self.abbrs(c).iter().any(|a| a == name))
            })
    }

    /// Resolves a dotted path, segment by segment, honouring abbreviations.
    pub fn find(&self, path: &str) -> Option<CmdId> {
        let mut current = Self::ROOT;
        for segment in path.split(CMD_PATH_SEP) {
            current = self.find_child(current, segment)?;
        }
        Some(current)
    }

    fn name_taken(&self, parent: CmdId, name: &str) -> bool {
        self.children(parent)
            .iter()
            .any(|&c| self.name(c) == name || self.abbrs(c).iter().any(|a| a == name))
    }

    /// Returns the child `name` of `parent`, creating it if needed.
    pub fn ensure_child(&mut self, parent: CmdId, name: &str) -> Result<CmdId, ConfigError> {
        if name.is_empty() || name.contains(char::is_whitespace) || name.contains(['{', '}', '=', ':']) {
            return Err(ConfigError::InvalidCmdName(name.to_string()));
        }
        if let Some(existing) = self
            .children(parent)
            .iter()
            .copied()
            .find(|&c| self.name(c) == name)
        {
            return Ok(existing);
        }
        if self.name_taken(parent, name) {
            return Err(ConfigError::CmdNameConflict {
                parent: self.display_path(parent),
                name: name.to_string(),
            });
        }
        let id = self.nodes.len();
        self.nodes.push(CmdNode {
            name: name.to_string(),
            abbrs: Vec::new(),
            parent: Some(parent),
            children: Vec::new(),
            cmd: None,
        });
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    pub fn ensure_path(&mut self, path: &str) -> Result<CmdId, ConfigError> {
        let mut current = Self::ROOT;
        for segment in path.split(CMD_PATH_SEP) {
            current = self.ensure_child(current, segment)?;
        }
        Ok(current)
    }

    /// Adds abbreviations to the last segment of a node.
    pub fn add_abbrs(&mut self, id: CmdId, abbrs: &[String]) -> Result<(), ConfigError> {
        let parent = self.parent(id).unwrap_or(Self::ROOT);
        for abbr in abbrs {
            if self.name_taken(parent, abbr) {
                return Err(ConfigError::CmdNameConflict {
                    parent: self.display_path(parent),
                    name: abbr.clone(),
                });
            }
            if let Some(node) = self.nodes.get_mut(id) {
                node.abbrs.push(abbr.clone());
            }
        }
        Ok(())
    }

    /// Registers a command at `path`. A path can hold only one command.
    pub fn register(&mut self, path: &str, kind: CmdKind, help: &str) -> Result<&mut Cmd, ConfigError> {
        let id = self.ensure_path(path)?;
        let display = self.display_path(id);
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ConfigError::InvalidCmdName(path.to_string()))?;
        if node.cmd.is_some() {
            return Err(ConfigError::DuplicateCmd { path: display });
        }
        log::trace!("Registering {} command '{}'", kind.type_name(), display);
        Ok(node.cmd.insert(Cmd::new(&display, kind, help)))
    }

    /// Ids of every node that carries a command, in registration order.
    pub fn cmd_ids(&self) -> Vec<CmdId> {
        (0..self.nodes.len())
            .filter(|&id| self.cmd(id).is_some())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> CmdKind {
        CmdKind::normal(|_, _| Ok(true))
    }

    #[test]
    fn test_register_and_find_with_abbrs() {
        let mut tree = CmdTree::new();
        tree.register("db.restart", noop(), "restart db").unwrap();
        let db = tree.find("db").unwrap();
        tree.add_abbrs(db, &["d".to_string()]).unwrap();

        let id = tree.find("d.restart").unwrap();
        assert_eq!(tree.display_path(id), "db.restart");
        assert!(tree.cmd(id).is_some());
        assert!(tree.cmd(db).is_none());
    }

    #[test]
    fn test_duplicate_registration_is_config_error() {
        let mut tree = CmdTree::new();
        tree.register("echo", noop(), "").unwrap();
        let again = tree.register("echo", noop(), "");
        assert!(matches!(again, Err(ConfigError::DuplicateCmd { .. })));
    }

    #[test]
    fn test_abbr_conflicting_with_sibling_name() {
        let mut tree = CmdTree::new();
        tree.register("build", noop(), "").unwrap();
        let test_id = tree.ensure_path("test").unwrap();
        let result = tree.add_abbrs(test_id, &["build".to_string()]);
        assert!(matches!(result, Err(ConfigError::CmdNameConflict { .. })));
    }

    #[test]
    fn test_mapping_requires_declared_arg() {
        let mut tree = CmdTree::new();
        let cmd = tree.register("deploy", noop(), "").unwrap();
        assert!(matches!(
            cmd.add_arg2env("deploy.target", "target"),
            Err(ConfigError::MappingUnknownArg { .. })
        ));
        cmd.add_arg("target", "staging", &["t"]).unwrap();
        cmd.add_arg2env("deploy.target", "target").unwrap();
        assert_eq!(cmd.arg2env.get_env_key("target"), Some("deploy.target"));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let mut tree = CmdTree::new();
        assert!(tree.register("bad name", noop(), "").is_err());
        assert!(tree.register("a..b", noop(), "").is_err());
    }
}
