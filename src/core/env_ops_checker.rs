// src/core/env_ops_checker.rs

//! Static read-before-write analysis over a flow.
//!
//! The checker replays a flow the way the executor would (same per-command
//! layers, same argument mapping, same sub-flow rendering) without running any
//! handler, and classifies every declared env read against the writes seen so far.

use crate::core::{
    args::EnvOp,
    cmd::{CmdKind, CmdTree},
    env::{Env, EnvLayerKind},
    flow::{ParsedCmds, apply_mapping_gen_env_and_argv, new_sub_flow_env},
    parser::{FlowParser, lines_to_tokens},
    template::render_template,
};
use std::collections::HashMap;
use std::fmt;

/// Sub-flows nested deeper than this are not followed.
pub const MAX_FLOW_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvOpsFinding {
    /// A certain read of a key nothing writes.
    ReadNotExist,
    MayReadNotExist,
    /// A certain read of a key that is only possibly written.
    ReadMayWrite,
    MayReadMayWrite,
}

impl EnvOpsFinding {
    pub fn is_fatal(self) -> bool {
        self == Self::ReadNotExist
    }
}

impl fmt::Display for EnvOpsFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadNotExist => "read but never written",
            Self::MayReadNotExist => "may be read but never written",
            Self::ReadMayWrite => "read but only possibly written",
            Self::MayReadMayWrite => "may be read and only possibly written",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOpsCheckResult {
    pub key: String,
    pub cmd: String,
    pub finding: EnvOpsFinding,
    /// Commands that may (but might not) have written the key.
    pub may_write_cmds: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct KeyState {
    ops: EnvOp,
    may_writers: Vec<String>,
    /// Written only by a sub-flow's own globals, not by any command.
    seeded: bool,
}

/// The running key → operations table of one check.
#[derive(Debug, Clone, Default)]
pub struct EnvOpsChecker {
    table: HashMap<String, KeyState>,
}

impl EnvOpsChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `op` against what was seen so far, then records it.
    pub fn on_call_op(&mut self, cmd: &str, key: &str, op: EnvOp) -> Option<EnvOpsFinding> {
        let state = self.table.entry(key.to_string()).or_default();
        let written = state.ops.contains(EnvOp::WRITE);
        let may_written = state.ops.contains(EnvOp::MAY_WRITE);

        let finding = if written {
            None
        } else if op.contains(EnvOp::READ) {
            Some(if may_written {
                EnvOpsFinding::ReadMayWrite
            } else {
                EnvOpsFinding::ReadNotExist
            })
        } else if op.contains(EnvOp::MAY_READ) {
            Some(if may_written {
                EnvOpsFinding::MayReadMayWrite
            } else {
                EnvOpsFinding::MayReadNotExist
            })
        } else {
            None
        };

        state.ops |= op;
        if op.contains(EnvOp::WRITE) {
            state.seeded = false;
        }
        if op.contains(EnvOp::MAY_WRITE) && !state.may_writers.iter().any(|c| c == cmd) {
            state.may_writers.push(cmd.to_string());
        }
        finding
    }

    pub fn may_writers(&self, key: &str) -> Vec<String> {
        self.table
            .get(key)
            .map(|s| s.may_writers.clone())
            .unwrap_or_default()
    }

    pub fn ops_of(&self, key: &str) -> EnvOp {
        self.table.get(key).map(|s| s.ops).unwrap_or_default()
    }

    /// A copy of the table for a sub-flow, with the sub-flow's globals counted as written.
    pub fn scoped<'k>(&self, globals: impl IntoIterator<Item = &'k str>) -> Self {
        let mut scope = self.clone();
        for key in globals {
            let state = scope.table.entry(key.to_string()).or_default();
            if !state.ops.contains(EnvOp::WRITE) {
                state.ops |= EnvOp::WRITE;
                state.seeded = true;
            }
        }
        scope
    }

    /// Takes back what a sub-flow's commands recorded. Keys only the sub-flow's
    /// globals wrote keep the state they had before the sub-flow.
    pub fn merge_scope(&mut self, scope: Self) {
        for (key, state) in scope.table {
            if !state.seeded {
                self.table.insert(key, state);
            }
        }
    }
}

/// Checks a whole flow against `env` (which is never modified).
///
/// With `ignore_maybe`, only fatal findings are returned.
pub fn check_env_ops(
    tree: &CmdTree,
    parser: &dyn FlowParser,
    flow: &ParsedCmds,
    env: &Env,
    ignore_maybe: bool,
) -> Vec<EnvOpsCheckResult> {
    let scratch = env.new_layer(EnvLayerKind::Session);
    flow.global_env.write_to(&scratch);
    let mut walk = CheckWalk {
        tree,
        parser,
        ignore_maybe,
        checker: EnvOpsChecker::new(),
        results: Vec::new(),
    };
    walk.check_flow(flow, &scratch, 0);
    walk.results
}

struct CheckWalk<'a> {
    tree: &'a CmdTree,
    parser: &'a dyn FlowParser,
    ignore_maybe: bool,
    checker: EnvOpsChecker,
    results: Vec<EnvOpsCheckResult>,
}

impl CheckWalk<'_> {
    fn check_flow(&mut self, flow: &ParsedCmds, env: &Env, depth: usize) {
        if depth > MAX_FLOW_DEPTH {
            log::warn!("Env-ops check stopped at sub-flow depth {}", depth);
            return;
        }
        let tree = self.tree;
        for parsed in &flow.cmds {
            if parsed.is_env_only() {
                parsed.apply_env(env);
                continue;
            }
            let Some(id) = parsed.last_cmd_id() else {
                continue;
            };
            let Some(cmd) = tree.cmd(id) else {
                continue;
            };

            let cmd_env = parsed.gen_cmd_env(env);
            let argv = apply_mapping_gen_env_and_argv(cmd, &cmd_env);
            for (key, value) in cmd.val2env.iter() {
                env.set(key, value);
                self.checker.on_call_op(&cmd.path, key, EnvOp::WRITE);
            }

            for (key, op) in cmd.env_ops.iter() {
                let Some(finding) = self.checker.on_call_op(&cmd.path, key, op) else {
                    continue;
                };
                if cmd_env.has_non_empty(key) {
                    continue;
                }
                if self.ignore_maybe && !finding.is_fatal() {
                    continue;
                }
                log::debug!("Env-ops finding: '{}' in '{}': {}", key, cmd.path, finding);
                self.results.push(EnvOpsCheckResult {
                    key: key.to_string(),
                    cmd: cmd.path.clone(),
                    finding,
                    may_write_cmds: self.checker.may_writers(key),
                });
            }

            if let CmdKind::Flow { lines } = &cmd.kind {
                let rendered = match render_template(&cmd.path, lines, &cmd_env, &argv) {
                    Ok(rendered) => rendered,
                    Err(e) => {
                        log::debug!("Env-ops check skips sub-flow of '{}': {}", cmd.path, e);
                        continue;
                    }
                };
                let sub = match lines_to_tokens(&rendered)
                    .and_then(|tokens| self.parser.parse(tree, &tokens))
                {
                    Ok(sub) => sub,
                    Err(e) => {
                        log::debug!("Env-ops check skips sub-flow of '{}': {}", cmd.path, e);
                        continue;
                    }
                };
                let sub_env = new_sub_flow_env(&cmd_env, &sub);
                let scope = self.checker.scoped(sub.global_env.iter().map(|(key, _)| key.as_str()));
                let parent = std::mem::replace(&mut self.checker, scope);
                self.check_flow(&sub, &sub_env, depth + 1);
                let scope = std::mem::replace(&mut self.checker, parent);
                self.checker.merge_scope(scope);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::SimpleFlowParser;

    fn noop() -> CmdKind {
        CmdKind::normal(|_, _| Ok(true))
    }

    fn tree() -> CmdTree {
        let mut tree = CmdTree::new();
        tree.register("write-x", noop(), "").unwrap().add_env_op("x", EnvOp::WRITE);
        tree.register("maybe-x", noop(), "").unwrap().add_env_op("x", EnvOp::MAY_WRITE);
        tree.register("read-x", noop(), "").unwrap().add_env_op("x", EnvOp::READ);
        tree.register("peek-x", noop(), "").unwrap().add_env_op("x", EnvOp::MAY_READ);
        tree.register(
            "wrap",
            CmdKind::Flow {
                lines: vec!["write-x : read-x".to_string()],
            },
            "",
        )
        .unwrap();
        tree.register(
            "wrap-write",
            CmdKind::Flow {
                lines: vec!["write-x".to_string()],
            },
            "",
        )
        .unwrap();
        tree
    }

    fn check(tree: &CmdTree, text: &str, env: &Env) -> Vec<EnvOpsCheckResult> {
        let tokens = lines_to_tokens(&[text.to_string()]).unwrap();
        let flow = SimpleFlowParser.parse(tree, &tokens).unwrap();
        check_env_ops(tree, &SimpleFlowParser, &flow, env, false)
    }

    #[test]
    fn test_write_then_read_is_clean() {
        let tree = tree();
        assert!(check(&tree, "write-x : read-x", &Env::new_session_chain()).is_empty());
    }

    #[test]
    fn test_read_without_write_is_fatal() {
        // --- Setup ---
        let tree = tree();
        let env = Env::new_session_chain();

        // --- Execute ---
        let results = check(&tree, "read-x", &env);

        // --- Assert ---
        assert_eq!(results.len(), 1);
        let only = results.first().unwrap();
        assert_eq!(only.key, "x");
        assert_eq!(only.cmd, "read-x");
        assert_eq!(only.finding, EnvOpsFinding::ReadNotExist);
        assert!(only.finding.is_fatal());
    }

    #[test]
    fn test_ambient_value_suppresses_finding() {
        let tree = tree();
        let env = Env::new_session_chain();
        env.set("x", "already");
        assert!(check(&tree, "read-x", &env).is_empty());
        assert!(check(&tree, "{x=inline} : read-x", &Env::new_session_chain()).is_empty());
    }

    #[test]
    fn test_may_write_makes_risks_not_fatal() {
        let tree = tree();
        let results = check(&tree, "maybe-x : read-x : peek-x", &Env::new_session_chain());
        let findings: Vec<_> = results.iter().map(|r| r.finding).collect();
        assert_eq!(
            findings,
            vec![EnvOpsFinding::ReadMayWrite, EnvOpsFinding::MayReadMayWrite]
        );
        assert_eq!(results.first().unwrap().may_write_cmds, vec!["maybe-x".to_string()]);

        let tokens = lines_to_tokens(&["maybe-x : read-x".to_string()]).unwrap();
        let flow = SimpleFlowParser.parse(&tree, &tokens).unwrap();
        assert!(check_env_ops(&tree, &SimpleFlowParser, &flow, &Env::new_session_chain(), true).is_empty());
    }

    #[test]
    fn test_sub_flow_is_followed() {
        let tree = tree();
        let env = Env::new_session_chain();
        assert!(check(&tree, "wrap", &env).is_empty());
        assert!(check(&tree, "wrap-write : read-x", &env).is_empty());
        assert_eq!(check(&tree, "read-x : wrap-write", &env).len(), 1);
    }

    #[test]
    fn test_sub_flow_globals_stay_in_the_sub_flow() {
        // --- Setup ---
        let mut tree = tree();
        tree.register(
            "scope-x",
            CmdKind::Flow {
                lines: vec!["{x=1} : read-x".to_string()],
            },
            "",
        )
        .unwrap();
        let env = Env::new_session_chain();

        // --- Execute ---
        let inside = check(&tree, "scope-x", &env);
        let after = check(&tree, "scope-x : read-x", &env);
        let written_inside = check(&tree, "wrap-write : read-x", &env);

        // --- Assert ---
        assert!(inside.is_empty(), "unexpected findings: {:?}", inside);
        assert_eq!(after.len(), 1);
        assert_eq!(after.first().unwrap().finding, EnvOpsFinding::ReadNotExist);
        assert!(written_inside.is_empty());
    }

    #[test]
    fn test_scope_merge_keeps_command_writes_only() {
        let mut checker = EnvOpsChecker::new();
        checker.on_call_op("a", "shared", EnvOp::MAY_WRITE);

        let mut scope = checker.scoped(["g", "shared"]);
        assert!(scope.on_call_op("inner", "g", EnvOp::READ).is_none());
        scope.on_call_op("inner", "y", EnvOp::WRITE);
        checker.merge_scope(scope);

        assert_eq!(checker.ops_of("g"), EnvOp::default());
        assert!(checker.ops_of("y").contains(EnvOp::WRITE));
        assert!(!checker.ops_of("shared").contains(EnvOp::WRITE));
        assert_eq!(checker.may_writers("shared"), vec!["a".to_string()]);
    }

    #[test]
    fn test_checker_does_not_touch_env() {
        let mut tree = tree();
        tree.register("set-y", noop(), "").unwrap().add_val2env("y", "1");
        let env = Env::new_session_chain();
        check(&tree, "{g=1} : set-y", &env);
        assert!(!env.has("y"));
        assert!(!env.has("g"));
    }
}
