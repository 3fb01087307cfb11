// src/system/os_deps.rs

use crate::core::{
    cmd::{Cmd, CmdKind, CmdTree},
    env::{Env, EnvLayerKind},
    env_ops_checker::MAX_FLOW_DEPTH,
    flow::{ParsedCmds, apply_mapping_gen_env_and_argv, new_sub_flow_env},
    parser::{FlowParser, lines_to_tokens},
    template::render_template,
};
use std::fmt;

/// A declared OS executable that is not on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDepend {
    pub os_cmd: String,
    pub reason: String,
    /// The command that declared it.
    pub cmd: String,
}

impl fmt::Display for MissingDepend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' (needed by '{}'", self.os_cmd, self.cmd)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        f.write_str(")")
    }
}

/// Looks up every dependency declared by the commands of `flow` and of the
/// sub-flows they expand to. Each missing executable is reported once, for the
/// first command that needs it.
pub fn check_os_depends(
    tree: &CmdTree,
    parser: &dyn FlowParser,
    flow: &ParsedCmds,
    env: &Env,
) -> Vec<MissingDepend> {
    let scratch = env.new_layer(EnvLayerKind::Session);
    flow.global_env.write_to(&scratch);
    let mut walk = DependsWalk {
        tree,
        parser,
        missing: Vec::new(),
    };
    walk.check_flow(flow, &scratch, 0);
    walk.missing
}

struct DependsWalk<'a> {
    tree: &'a CmdTree,
    parser: &'a dyn FlowParser,
    missing: Vec<MissingDepend>,
}

impl DependsWalk<'_> {
    fn check_flow(&mut self, flow: &ParsedCmds, env: &Env, depth: usize) {
        if depth > MAX_FLOW_DEPTH {
            log::warn!("Dependency check stopped at sub-flow depth {}", depth);
            return;
        }
        let tree = self.tree;
        for parsed in &flow.cmds {
            if parsed.is_env_only() {
                parsed.apply_env(env);
                continue;
            }
            let Some(cmd) = parsed.last_cmd_id().and_then(|id| tree.cmd(id)) else {
                continue;
            };
            self.check_cmd(cmd);

            let cmd_env = parsed.gen_cmd_env(env);
            let argv = apply_mapping_gen_env_and_argv(cmd, &cmd_env);
            for (key, value) in cmd.val2env.iter() {
                env.set(key, value);
            }
            let CmdKind::Flow { lines } = &cmd.kind else {
                continue;
            };
            let sub = match render_template(&cmd.path, lines, &cmd_env, &argv)
                .map_err(|e| e.to_string())
                .and_then(|rendered| lines_to_tokens(&rendered).map_err(|e| e.to_string()))
                .and_then(|tokens| self.parser.parse(tree, &tokens).map_err(|e| e.to_string()))
            {
                Ok(sub) => sub,
                Err(e) => {
                    log::debug!("Dependency check skips sub-flow of '{}': {}", cmd.path, e);
                    continue;
                }
            };
            let sub_env = new_sub_flow_env(&cmd_env, &sub);
            self.check_flow(&sub, &sub_env, depth + 1);
        }
    }

    fn check_cmd(&mut self, cmd: &Cmd) {
        for dep in &cmd.depends {
            if self.missing.iter().any(|m| m.os_cmd == dep.os_cmd) {
                continue;
            }
            if let Err(e) = which::which(&dep.os_cmd) {
                log::debug!("Dependency '{}' of '{}' not found: {}", dep.os_cmd, cmd.path, e);
                self.missing.push(MissingDepend {
                    os_cmd: dep.os_cmd.clone(),
                    reason: dep.reason.clone(),
                    cmd: cmd.path.clone(),
                });
            }
        }
    }
}
