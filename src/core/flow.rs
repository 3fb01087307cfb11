// src/core/flow.rs

//! The parsed representation of a flow and the per-command environment
//! derived from it.

use crate::{
    constants::{CMD_PATH_SEP, FLOW_SEP},
    core::{
        args::ArgVals,
        cmd::{Cmd, CmdId, CmdTree},
        env::{Env, EnvLayerKind},
    },
};
use indexmap::IndexMap;
use std::time::Duration;

/// One override declared in flow text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEnvVal {
    pub val: String,
    pub is_arg: bool,
    /// The segment names of the command the value was written against.
    pub matched_path: Vec<String>,
}

/// Ordered env overrides. Re-declaring a key keeps its first position and the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEnv(IndexMap<String, ParsedEnvVal>);

impl ParsedEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, val: &str, is_arg: bool, matched_path: Vec<String>) {
        self.0.insert(
            key.to_string(),
            ParsedEnvVal {
                val: val.to_string(),
                is_arg,
                matched_path,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&ParsedEnvVal> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParsedEnvVal)> {
        self.0.iter()
    }

    pub fn write_to(&self, env: &Env) {
        for (key, v) in &self.0 {
            env.set_ext(key, &v.val, v.is_arg);
        }
    }

    pub fn write_not_arg_to(&self, env: &Env) {
        for (key, v) in self.0.iter().filter(|(_, v)| !v.is_arg) {
            env.set(key, &v.val);
        }
    }
}

/// A segment name as written, and the tree node it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedCmd {
    pub name: String,
    pub cmd: Option<CmdId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCmdSeg {
    pub matched: MatchedCmd,
    pub env: ParsedEnv,
}

/// Arguments addressed to the engine rather than to the command (`%delay=2s`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SysArgs {
    pub delay: Option<Duration>,
}

/// One command invocation of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCmd {
    pub segments: Vec<ParsedCmdSeg>,
    pub sys_args: SysArgs,
    /// Written with a trailing `!`: run first, in tail-mode.
    pub priority: bool,
}

impl ParsedCmd {
    /// The node of the last segment, if it resolved to one.
    pub fn last_cmd_id(&self) -> Option<CmdId> {
        self.segments.last().and_then(|seg| seg.matched.cmd)
    }

    /// An invocation made only of `{...}` overrides.
    pub fn is_env_only(&self) -> bool {
        self.segments.iter().all(|seg| seg.matched.cmd.is_none())
    }

    pub fn display_path(&self) -> String {
        self.segments
            .iter()
            .filter(|seg| !seg.matched.name.is_empty())
            .map(|seg| seg.matched.name.as_str())
            .collect::<Vec<_>>()
            .join(&CMD_PATH_SEP.to_string())
    }

    /// Applies every segment's overrides in segment order.
    pub fn apply_env(&self, env: &Env) {
        for seg in &self.segments {
            seg.env.write_to(env);
        }
    }

    /// Builds the command layer: a fresh `Command` layer over `parent` carrying this
    /// invocation's overrides.
    pub fn gen_cmd_env(&self, parent: &Env) -> Env {
        let cmd_env = parent.new_layer(EnvLayerKind::Command);
        self.apply_env(&cmd_env);
        cmd_env
    }

    /// Renders the invocation back to flow syntax.
    pub fn render(&self) -> String {
        let path = self.display_path();
        let mut parts = Vec::new();
        if !path.is_empty() {
            parts.push(path.clone());
        }
        let arg_prefix = format!("{}{}", path, CMD_PATH_SEP);
        let mut env_pairs = Vec::new();
        for seg in &self.segments {
            for (key, v) in seg.env.iter() {
                if v.is_arg {
                    let name = key.strip_prefix(&arg_prefix).unwrap_or(key.as_str());
                    parts.push(format!("{}={}", name, quote(&v.val)));
                } else {
                    env_pairs.push(format!("{}={}", key, quote(&v.val)));
                }
            }
        }
        if !env_pairs.is_empty() {
            parts.push(format!("{{{}}}", env_pairs.join(" ")));
        }
        if let Some(delay) = self.sys_args.delay {
            parts.push(format!("%delay={}", humantime::format_duration(delay)));
        }
        if self.priority {
            parts.push("!".to_string());
        }
        parts.join(" ")
    }
}

fn quote(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || "'\"\\{}:".contains(c)) {
        return value.to_string();
    }
    shlex::try_quote(value)
        .map(|q| q.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

/// A parsed flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCmds {
    pub cmds: Vec<ParsedCmd>,
    /// Overrides written before the first command; they apply to the whole flow.
    pub global_env: ParsedEnv,
    /// Position of the global block in the written flow, if there was one.
    pub global_seq_idx: Option<usize>,
    pub tail_mode: bool,
}

impl ParsedCmds {
    pub fn from_cmds(cmds: Vec<ParsedCmd>) -> Self {
        Self {
            cmds,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// Moves a trailing priority command to the front and switches to tail-mode.
    /// Returns true if the flow was reordered.
    pub fn move_priority_to_front(&mut self) -> bool {
        if !self.cmds.last().is_some_and(|cmd| cmd.priority) {
            return false;
        }
        if let Some(last) = self.cmds.pop() {
            self.cmds.insert(0, last);
            self.tail_mode = true;
            if let Some(idx) = self.global_seq_idx.as_mut() {
                *idx += 1;
            }
        }
        true
    }

    /// Renders the flow back to text.
    pub fn render_flow(&self) -> String {
        let mut pieces: Vec<String> = self.cmds.iter().map(ParsedCmd::render).collect();
        if !self.global_env.is_empty() {
            let pairs: Vec<String> = self
                .global_env
                .iter()
                .map(|(k, v)| format!("{}={}", k, quote(&v.val)))
                .collect();
            let block = format!("{{{}}}", pairs.join(" "));
            let at = self.global_seq_idx.unwrap_or(0).min(pieces.len());
            pieces.insert(at, block);
        }
        pieces.join(&format!(" {} ", FLOW_SEP))
    }

    /// Every command node referenced by the flow, in order (env-only entries skipped).
    pub fn cmd_ids(&self) -> Vec<CmdId> {
        self.cmds.iter().filter_map(ParsedCmd::last_cmd_id).collect()
    }
}

/// Resolves the argument values for one invocation.
///
/// For each declared argument: an explicit value (`<cmd.path>.<arg>` in the command
/// layer chain) wins and is copied onto the mapped env key in `cmd_env`; otherwise
/// the mapped env key supplies it; otherwise the declared default is used.
pub fn apply_mapping_gen_env_and_argv(cmd: &Cmd, cmd_env: &Env) -> ArgVals {
    let mut argv = ArgVals::new();
    for name in cmd.args.names() {
        let arg_key = format!("{}{}{}", cmd.path, CMD_PATH_SEP, name);
        let mapped_key = cmd.arg2env.get_env_key(name);

        if let Some(explicit) = cmd_env.get_opt(&arg_key) {
            if let Some(key) = mapped_key {
                cmd_env.set(key, &explicit.raw);
            }
            argv.insert(name, &explicit.raw, true);
            continue;
        }
        if let Some(from_env) = mapped_key.and_then(|key| cmd_env.get_opt(key)) {
            argv.insert(name, &from_env.raw, true);
            continue;
        }
        argv.insert(name, cmd.args.default_val(name).unwrap_or(""), false);
    }
    argv
}

/// Creates the layer a sub-flow runs in: a `SubFlow` layer over the invoking
/// command's parent, seeded with the command layer's plain values and the
/// sub-flow's own global overrides.
pub fn new_sub_flow_env(cmd_env: &Env, sub: &ParsedCmds) -> Env {
    let base = cmd_env.parent().unwrap_or(cmd_env);
    let sub_env = base.new_layer(EnvLayerKind::SubFlow);
    cmd_env.write_not_arg_to(&sub_env);
    sub.global_env.write_not_arg_to(&sub_env);
    sub_env
}

/// Display path of a node for messages, falling back to the written name.
pub fn display_name(tree: &CmdTree, cmd: &ParsedCmd) -> String {
    match cmd.last_cmd_id() {
        Some(id) => tree.display_path(id),
        None => cmd.display_path(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cmd::CmdKind;

    fn seg(name: &str, cmd: Option<CmdId>) -> ParsedCmdSeg {
        ParsedCmdSeg {
            matched: MatchedCmd {
                name: name.to_string(),
                cmd,
            },
            env: ParsedEnv::new(),
        }
    }

    #[test]
    fn test_gen_cmd_env_later_segment_wins() {
        // --- Setup ---
        let session = Env::new_session_chain();
        let mut first = seg("db", Some(1));
        first.env.insert("k", "from-db", false, vec!["db".into()]);
        let mut second = seg("restart", Some(2));
        second.env.insert("k", "from-restart", false, vec!["db".into(), "restart".into()]);
        let cmd = ParsedCmd {
            segments: vec![first, second],
            ..ParsedCmd::default()
        };

        // --- Execute ---
        let cmd_env = cmd.gen_cmd_env(&session);

        // --- Assert ---
        assert_eq!(cmd_env.kind(), EnvLayerKind::Command);
        assert_eq!(cmd_env.get_raw("k"), "from-restart");
        assert!(!session.has("k"));
    }

    #[test]
    fn test_mapping_prefers_explicit_then_env_then_default() {
        let mut tree = CmdTree::new();
        let cmd = tree
            .register("deploy", CmdKind::normal(|_, _| Ok(true)), "")
            .unwrap();
        cmd.add_arg("target", "staging", &[]).unwrap();
        cmd.add_arg("tag", "latest", &[]).unwrap();
        cmd.add_arg("region", "eu", &[]).unwrap();
        cmd.add_arg2env("deploy.target", "target").unwrap();
        cmd.add_arg2env("deploy.tag", "tag").unwrap();
        let cmd = cmd.clone();

        let session = Env::new_session_chain();
        session.set("deploy.tag", "v2");
        let cmd_env = session.new_layer(EnvLayerKind::Command);
        cmd_env.set_arg("deploy.target", "prod");

        let argv = apply_mapping_gen_env_and_argv(&cmd, &cmd_env);
        assert_eq!(argv.get_raw("target"), "prod");
        assert!(argv.is_provided("target"));
        assert_eq!(argv.get_raw("tag"), "v2");
        assert!(argv.is_provided("tag"));
        assert_eq!(argv.get_raw("region"), "eu");
        assert!(!argv.is_provided("region"));
        assert!(!session.has("deploy.target"));
    }

    #[test]
    fn test_priority_moves_to_front() {
        let mut last = ParsedCmd {
            segments: vec![seg("desc", Some(3))],
            ..ParsedCmd::default()
        };
        last.priority = true;
        let mut flow = ParsedCmds::from_cmds(vec![
            ParsedCmd {
                segments: vec![seg("a", Some(1))],
                ..ParsedCmd::default()
            },
            last,
        ]);
        assert!(flow.move_priority_to_front());
        assert!(flow.tail_mode);
        assert_eq!(flow.cmds.first().map(ParsedCmd::display_path).as_deref(), Some("desc"));
        assert!(!ParsedCmds::default().move_priority_to_front());
    }

    #[test]
    fn test_render_flow() {
        let mut echo = seg("echo", Some(1));
        echo.env.insert("echo.msg", "hello", true, vec!["echo".into()]);
        echo.env.insert("color", "red", false, vec!["echo".into()]);
        let mut flow = ParsedCmds::from_cmds(vec![
            ParsedCmd {
                segments: vec![echo],
                ..ParsedCmd::default()
            },
            ParsedCmd {
                segments: vec![seg("noop", Some(2))],
                sys_args: SysArgs {
                    delay: Some(Duration::from_secs(2)),
                },
                priority: false,
            },
        ]);
        flow.global_env.insert("g", "1", false, Vec::new());
        flow.global_seq_idx = Some(0);
        assert_eq!(
            flow.render_flow(),
            "{g=1} : echo msg=hello {color=red} : noop %delay=2s"
        );
    }

    #[test]
    fn test_sub_flow_env_drops_args_and_keeps_parent() {
        let session = Env::new_session_chain();
        let cmd_env = session.new_layer(EnvLayerKind::Command);
        cmd_env.set("plain", "1");
        cmd_env.set_arg("outer.arg", "2");
        let mut sub = ParsedCmds::default();
        sub.global_env.insert("sub.global", "3", false, Vec::new());

        let sub_env = new_sub_flow_env(&cmd_env, &sub);
        assert_eq!(sub_env.kind(), EnvLayerKind::SubFlow);
        assert!(sub_env.parent().is_some_and(|p| p.same_layer(&session)));
        assert_eq!(sub_env.get_raw("plain"), "1");
        assert_eq!(sub_env.get_raw("sub.global"), "3");
        assert!(!sub_env.has("outer.arg"));
    }
}
