// src/core/auto_map.rs

//! Discovers the env-mapped arguments a flow command should expose.
//!
//! A flow command may ask for some (or all) of the arguments its sub-flow's
//! commands read through their `arg2env` mappings. Discovery dry-runs the
//! sub-flow: it renders and parses the body, walks every command in it (and
//! recursively every nested flow), and collects candidates. Candidates are
//! cached on the target and committed by [`ArgsAutoMapStatus::flush_cache`].

use crate::core::{
    args::{Arg2Env, Args, ConfigError},
    cmd::{Cmd, CmdId, CmdKind, CmdTree},
    env::{Env, EnvLayerKind},
    flow::{apply_mapping_gen_env_and_argv, new_sub_flow_env},
    parser::{FlowParser, lines_to_tokens},
    template::render_template,
};
use crate::constants::CMD_PATH_SEP;
use std::collections::HashSet;

const AUTO_MAP_ALL: &str = "*";

/// Which arguments a command wants discovered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AutoMapRequest {
    #[default]
    Nothing,
    All,
    Names(Vec<String>),
}

/// A mapping found in a sub-flow, not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoMapCandidate {
    /// The command the mapping was found on.
    pub src: String,
    pub key: String,
    pub arg: String,
    pub default: String,
    pub abbrs: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ArgsAutoMapStatus {
    request: AutoMapRequest,
    cache: Vec<AutoMapCandidate>,
}

impl ArgsAutoMapStatus {
    /// Adds names to the request; `*` asks for everything.
    pub fn request(&mut self, names: &[String]) {
        if names.iter().any(|n| n == AUTO_MAP_ALL) {
            self.request = AutoMapRequest::All;
            return;
        }
        match &mut self.request {
            AutoMapRequest::All => {}
            AutoMapRequest::Names(existing) => {
                for name in names {
                    if !existing.contains(name) {
                        existing.push(name.clone());
                    }
                }
            }
            AutoMapRequest::Nothing if names.is_empty() => {}
            AutoMapRequest::Nothing => self.request = AutoMapRequest::Names(names.to_vec()),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.request != AutoMapRequest::Nothing
    }

    pub fn wants(&self, arg: &str) -> bool {
        match &self.request {
            AutoMapRequest::Nothing => false,
            AutoMapRequest::All => true,
            AutoMapRequest::Names(names) => names.iter().any(|n| n == arg),
        }
    }

    /// True when every requested name is already an argument (never for `*`).
    pub fn fully_mapped(&self, args: &Args) -> bool {
        match &self.request {
            AutoMapRequest::Nothing => true,
            AutoMapRequest::All => false,
            AutoMapRequest::Names(names) => names.iter().all(|n| args.has(n)),
        }
    }

    fn fully_mapped_with(&self, args: &Args, found: &[AutoMapCandidate]) -> bool {
        match &self.request {
            AutoMapRequest::Names(names) => names
                .iter()
                .all(|n| args.has(n) || found.iter().any(|c| &c.arg == n)),
            _ => self.fully_mapped(args),
        }
    }

    pub fn cached(&self) -> &[AutoMapCandidate] {
        &self.cache
    }

    pub fn cache(&mut self, candidates: Vec<AutoMapCandidate>) {
        self.cache.extend(candidates);
    }

    /// Commits cached candidates into `args`/`arg2env`. The first candidate for an
    /// argument name or env key wins; later ones are dropped, as are candidates
    /// whose name or key the command already has. Conflicting abbreviations are
    /// left out. Returns how many arguments were added.
    pub fn flush_cache(
        &mut self,
        owner: &str,
        args: &mut Args,
        arg2env: &mut Arg2Env,
    ) -> Result<usize, ConfigError> {
        let mut added = 0;
        for cand in std::mem::take(&mut self.cache) {
            if args.has(&cand.arg) || arg2env.has_env_key(&cand.key) || arg2env.has_arg(&cand.arg) {
                log::trace!(
                    "Auto-map on '{}': dropping '{}' -> '{}' from '{}'",
                    owner,
                    cand.arg,
                    cand.key,
                    cand.src
                );
                continue;
            }
            let abbrs: Vec<String> = cand
                .abbrs
                .into_iter()
                .filter(|a| a != &cand.arg && args.realname(a).is_none())
                .collect();
            args.add_arg(owner, &cand.arg, &cand.default, &abbrs)?;
            arg2env.add(owner, &cand.key, &cand.arg)?;
            log::debug!(
                "Auto-mapped '{}' arg '{}' to env key '{}' (found on '{}')",
                owner,
                cand.arg,
                cand.key,
                cand.src
            );
            added += 1;
        }
        Ok(added)
    }
}

/// Runs discovery for one flow command and commits what it finds.
pub fn auto_map_arg2env(
    tree: &mut CmdTree,
    parser: &dyn FlowParser,
    env: &Env,
    target: CmdId,
) -> Result<usize, ConfigError> {
    let candidates = {
        let tree: &CmdTree = tree;
        let Some(cmd) = tree.cmd(target) else {
            return Ok(0);
        };
        if !cmd.auto_map.is_requested() || cmd.auto_map.fully_mapped(&cmd.args) {
            return Ok(0);
        }
        let mut visited = HashSet::from([target]);
        let mut found = Vec::new();
        let dry_env = env.new_layer(EnvLayerKind::Command);
        collect_candidates(tree, parser, &dry_env, cmd, cmd, &mut visited, &mut found);
        found
    };

    let Some(cmd) = tree.cmd_mut(target) else {
        return Ok(0);
    };
    cmd.auto_map.cache(candidates);
    let Cmd {
        path,
        args,
        arg2env,
        auto_map,
        ..
    } = cmd;
    auto_map.flush_cache(path, args, arg2env)
}

/// Auto-maps every command that asked for it, in registration order.
pub fn auto_map_all(tree: &mut CmdTree, parser: &dyn FlowParser, env: &Env) -> Result<usize, ConfigError> {
    let mut total = 0;
    for id in tree.cmd_ids() {
        total += auto_map_arg2env(tree, parser, env, id)?;
    }
    Ok(total)
}

/// Dry-runs `src`'s body and gathers the mappings `target` wants.
///
/// `cmd_env` is the command layer `src` would run in. Every nested invocation
/// gets its own layer built the way the executor builds it, so overrides written
/// on the invocation reach the nested body's template.
fn collect_candidates(
    tree: &CmdTree,
    parser: &dyn FlowParser,
    cmd_env: &Env,
    target: &Cmd,
    src: &Cmd,
    visited: &mut HashSet<CmdId>,
    found: &mut Vec<AutoMapCandidate>,
) {
    let CmdKind::Flow { lines } = &src.kind else {
        return;
    };
    let argv = apply_mapping_gen_env_and_argv(src, cmd_env);
    let sub = match render_template(&src.path, lines, cmd_env, &argv)
        .map_err(|e| e.to_string())
        .and_then(|rendered| lines_to_tokens(&rendered).map_err(|e| e.to_string()))
        .and_then(|tokens| parser.parse(tree, &tokens).map_err(|e| e.to_string()))
    {
        Ok(sub) => sub,
        Err(e) => {
            log::debug!("Auto-map of '{}' stops at '{}': {}", target.path, src.path, e);
            return;
        }
    };

    let sub_env = new_sub_flow_env(cmd_env, &sub);
    for parsed in &sub.cmds {
        if target.auto_map.fully_mapped_with(&target.args, found) {
            return;
        }
        let Some(id) = parsed.last_cmd_id() else {
            continue;
        };
        if !visited.insert(id) {
            continue;
        }
        let Some(inner) = tree.cmd(id) else {
            continue;
        };

        for (key, arg) in inner.arg2env.iter() {
            let arg_key = format!("{}{}{}", inner.path, CMD_PATH_SEP, arg);
            let pinned = parsed
                .segments
                .iter()
                .any(|seg| seg.env.contains_key(&arg_key) || seg.env.contains_key(key))
                || sub.global_env.contains_key(key);
            if pinned || !target.auto_map.wants(arg) {
                continue;
            }
            found.push(AutoMapCandidate {
                src: inner.path.clone(),
                key: key.to_string(),
                arg: arg.to_string(),
                default: inner.args.default_val(arg).unwrap_or_default().to_string(),
                abbrs: inner.args.abbrs(arg).to_vec(),
            });
        }

        if matches!(inner.kind, CmdKind::Flow { .. }) {
            let inner_env = parsed.gen_cmd_env(&sub_env);
            collect_candidates(tree, parser, &inner_env, target, inner, visited, found);
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

    fn flow(lines: &[&str]) -> CmdKind {
        CmdKind::Flow {
            lines: lines.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn tree() -> CmdTree {
        let mut tree = CmdTree::new();
        let restart = tree.register("db.restart", noop(), "").unwrap();
        restart.add_arg("host", "localhost", &["h"]).unwrap();
        restart.add_arg2env("db.host", "host").unwrap();
        restart.add_arg("port", "5432", &["p"]).unwrap();
        restart.add_arg2env("db.port", "port").unwrap();

        let deploy = tree.register("app.deploy", noop(), "").unwrap();
        deploy.add_arg("host", "app-host", &[]).unwrap();
        deploy.add_arg2env("app.host", "host").unwrap();
        deploy.add_arg("tag", "latest", &["t"]).unwrap();
        deploy.add_arg2env("app.tag", "tag").unwrap();
        tree
    }

    #[test]
    fn test_request_parsing() {
        let mut status = ArgsAutoMapStatus::default();
        assert!(!status.is_requested());
        status.request(&["host".to_string()]);
        assert!(status.wants("host"));
        assert!(!status.wants("port"));
        status.request(&["*".to_string()]);
        assert_eq!(status.request, AutoMapRequest::All);
        assert!(status.wants("anything"));
    }

    #[test]
    fn test_wildcard_first_discovered_wins() {
        // --- Setup ---
        let mut tree = tree();
        tree.register("release", flow(&["db.restart : app.deploy"]), "")
            .unwrap()
            .auto_map
            .request(&["*".to_string()]);
        let id = tree.find("release").unwrap();
        let env = Env::new_session_chain();

        // --- Execute ---
        let added = auto_map_arg2env(&mut tree, &SimpleFlowParser, &env, id).unwrap();

        // --- Assert ---
        assert_eq!(added, 3);
        let release = tree.cmd(id).unwrap();
        assert_eq!(release.args.names(), ["host", "port", "tag"]);
        assert_eq!(release.arg2env.get_env_key("host"), Some("db.host"));
        assert_eq!(release.args.default_val("port"), Some("5432"));
        assert_eq!(release.args.realname("t"), Some("tag"));
        assert!(release.auto_map.cached().is_empty());
    }

    #[test]
    fn test_pinned_args_are_not_exposed() {
        let mut tree = tree();
        tree.register("restart-local", flow(&["db.restart host=127.0.0.1"]), "")
            .unwrap()
            .auto_map
            .request(&["*".to_string()]);
        let id = tree.find("restart-local").unwrap();
        auto_map_arg2env(&mut tree, &SimpleFlowParser, &Env::new_session_chain(), id).unwrap();
        let cmd = tree.cmd(id).unwrap();
        assert!(!cmd.args.has("host"));
        assert!(cmd.args.has("port"));
    }

    #[test]
    fn test_nested_flows_and_cycles() {
        let mut tree = tree();
        tree.register("inner", flow(&["db.restart : outer"]), "").unwrap();
        tree.register("outer", flow(&["inner"]), "")
            .unwrap()
            .auto_map
            .request(&["port".to_string()]);
        let id = tree.find("outer").unwrap();
        let added = auto_map_arg2env(&mut tree, &SimpleFlowParser, &Env::new_session_chain(), id).unwrap();
        assert_eq!(added, 1);
        assert_eq!(tree.cmd(id).unwrap().args.names(), ["port"]);
    }

    #[test]
    fn test_invocation_overrides_reach_nested_templates() {
        // --- Setup ---
        let mut tree = tree();
        tree.register("echo", noop(), "")
            .unwrap()
            .add_arg("msg", "", &[])
            .unwrap();
        tree.register("inner", flow(&["echo msg=[[greeting]] : db.restart"]), "")
            .unwrap();
        tree.register("outer", flow(&["inner {greeting=hi}"]), "")
            .unwrap()
            .auto_map
            .request(&["*".to_string()]);
        let id = tree.find("outer").unwrap();

        // --- Execute ---
        let added = auto_map_arg2env(&mut tree, &SimpleFlowParser, &Env::new_session_chain(), id).unwrap();

        // --- Assert ---
        assert_eq!(added, 2);
        let outer = tree.cmd(id).unwrap();
        assert_eq!(outer.args.names(), ["host", "port"]);
        assert_eq!(outer.arg2env.get_env_key("host"), Some("db.host"));
    }

    #[test]
    fn test_unrenderable_body_stops_quietly() {
        let mut tree = tree();
        tree.register("needs-target", flow(&["[[target]] : db.restart"]), "")
            .unwrap()
            .auto_map
            .request(&["*".to_string()]);
        let added = auto_map_all(&mut tree, &SimpleFlowParser, &Env::new_session_chain()).unwrap();
        assert_eq!(added, 0);
    }

    #[test]
    fn test_flush_skips_taken_names_and_keys() {
        let mut args = Args::new();
        args.add_arg("me", "host", "", &["h".to_string()]).unwrap();
        let mut arg2env = Arg2Env::default();
        arg2env.add("me", "db.host", "host").unwrap();

        let mut status = ArgsAutoMapStatus::default();
        status.cache(vec![
            AutoMapCandidate {
                src: "a".into(),
                key: "other.key".into(),
                arg: "host".into(),
                default: String::new(),
                abbrs: Vec::new(),
            },
            AutoMapCandidate {
                src: "a".into(),
                key: "db.host".into(),
                arg: "addr".into(),
                default: String::new(),
                abbrs: Vec::new(),
            },
            AutoMapCandidate {
                src: "b".into(),
                key: "db.port".into(),
                arg: "port".into(),
                default: "1".into(),
                abbrs: vec!["h".into(), "p".into()],
            },
        ]);
        assert_eq!(status.flush_cache("me", &mut args, &mut arg2env).unwrap(), 1);
        assert_eq!(args.abbrs("port"), ["p".to_string()]);
        assert_eq!(arg2env.get_arg("db.port"), Some("port"));
    }
}
