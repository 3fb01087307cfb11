// src/cli/handlers/commons.rs

// Shared set-up used by the handlers: catalog, command tree, env layers, sessions.

use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    constants::{DEFAULT_SESSION_KEEP, STEP_DELAY_KEY},
    core::{
        auto_map::auto_map_all,
        builtins::register_builtins,
        catalog::{apply_catalog_env, load_catalog, register_catalog},
        cmd::CmdTree,
        env::{Env, EnvLayerKind, parse_duration},
        env_file::load_env_from_file,
        flow::ParsedCmds,
        parser::{FlowParser, SimpleFlowParser},
        paths,
    },
    models::CatalogFile,
    system::sessions::SessionStore,
};

/// Everything a handler needs to parse and run flows.
pub struct Workspace {
    pub tree: Arc<CmdTree>,
    pub parser: Arc<dyn FlowParser>,
    /// The session layer (`Default <- Persisted <- Session`).
    pub env: Env,
    pub persisted_env_path: PathBuf,
    pub store: SessionStore,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("commands", &self.tree.len())
            .field("persisted_env_path", &self.persisted_env_path)
            .field("store", &self.store)
            .finish()
    }
}

/// Loads the catalog from the flowrun home and builds the workspace around it.
pub fn load_workspace() -> Result<Workspace> {
    let catalog_path = paths::get_catalog_path()?;
    let catalog = load_catalog(&catalog_path)?;
    let base_dir = catalog_path
        .parent()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("Catalog path '{}' has no parent directory", catalog_path.display()))?;
    build_workspace(&catalog, &base_dir, paths::get_persisted_env_path()?)
}

/// Builds the command tree and the env layers from an already loaded catalog.
pub fn build_workspace(catalog: &CatalogFile, base_dir: &Path, persisted_env_path: PathBuf) -> Result<Workspace> {
    // --- Env layers ---
    let env = Env::new_session_chain();
    let defaults = env.get_layer(EnvLayerKind::Default)?;
    if let Some(step_delay) = &catalog.options.step_delay {
        parse_duration(step_delay).with_context(|| format!("Invalid step_delay '{}'", step_delay))?;
        defaults.set(STEP_DELAY_KEY, step_delay);
    }
    apply_catalog_env(catalog, &defaults);

    let persisted = env.get_layer(EnvLayerKind::Persisted)?;
    let unknown = load_env_from_file(&persisted, &persisted_env_path)?;
    if !unknown.is_empty() {
        log::warn!(
            "Ignored {} unrecognised line(s) in '{}'",
            unknown.len(),
            persisted_env_path.display()
        );
    }

    // --- Commands ---
    let mut tree = CmdTree::new();
    register_builtins(&mut tree)?;
    register_catalog(&mut tree, catalog, base_dir)?;
    let parser: Arc<dyn FlowParser> = Arc::new(SimpleFlowParser);
    let mapped = auto_map_all(&mut tree, parser.as_ref(), &env)?;
    log::debug!("Auto-mapped {} argument(s)", mapped);

    // --- Sessions ---
    let keep_raw = catalog
        .options
        .session_keep
        .clone()
        .unwrap_or_else(|| DEFAULT_SESSION_KEEP.to_string());
    let keep: Duration = humantime::parse_duration(&keep_raw)
        .with_context(|| format!("Invalid session_keep '{}'", keep_raw))?;
    let store = SessionStore::new(
        paths::get_sessions_dir(catalog.options.sessions_dir.as_deref())?,
        keep,
    );

    Ok(Workspace {
        tree: Arc::new(tree),
        parser,
        env,
        persisted_env_path,
        store,
    })
}

/// Parses command-line words into a flow.
pub fn parse_flow(ws: &Workspace, tokens: &[String]) -> Result<ParsedCmds> {
    if tokens.is_empty() {
        return Err(anyhow!("No flow given. Try `flowrun desc : <command>`."));
    }
    let flow = ws.parser.parse(&ws.tree, tokens)?;
    if flow.is_empty() && flow.global_env.is_empty() {
        return Err(anyhow!("The flow '{}' has no commands.", tokens.join(" ")));
    }
    Ok(flow)
}
