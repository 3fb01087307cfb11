// src/core/catalog.rs

//! Loads `flowrun.toml` and registers its commands into a [`CmdTree`].

use crate::{
    core::{
        args::{ConfigError, EnvOp},
        cmd::{CmdKind, CmdTree},
        env::Env,
        paths::{PathError, expand_path},
    },
    models::{CatalogFile, CommandConfig, CommandKindConfig},
};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_DIR_ENTRY: &str = "main";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Could not read catalog '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse catalog '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Command '{cmd}': {reason}")]
    Invalid { cmd: String, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Reads a catalog. A missing file is an empty catalog.
pub fn load_catalog(path: &Path) -> Result<CatalogFile, CatalogError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No catalog at '{}', starting with builtins only", path.display());
            return Ok(CatalogFile::default());
        }
        Err(source) => {
            return Err(CatalogError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&content).map_err(|source| CatalogError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes the catalog's `[env]` table into `env` (meant for the default layer).
pub fn apply_catalog_env(catalog: &CatalogFile, env: &Env) {
    for (key, value) in &catalog.env {
        env.set(key, value);
    }
}

/// Registers every catalog command. Relative paths resolve against `base_dir`.
pub fn register_catalog(tree: &mut CmdTree, catalog: &CatalogFile, base_dir: &Path) -> Result<(), CatalogError> {
    for (path, config) in &catalog.commands {
        register_command(tree, path, config, base_dir)?;
    }
    log::debug!("Registered {} catalog command(s)", catalog.commands.len());
    Ok(())
}

fn register_command(
    tree: &mut CmdTree,
    path: &str,
    config: &CommandConfig,
    base_dir: &Path,
) -> Result<(), CatalogError> {
    let invalid = |reason: &str| CatalogError::Invalid {
        cmd: path.to_string(),
        reason: reason.to_string(),
    };

    let kind = match config.kind {
        CommandKindConfig::Flow => {
            let lines = config.flow.clone().into_vec();
            if lines.iter().all(|l| l.trim().is_empty()) {
                return Err(invalid("a flow command needs a non-empty 'flow'"));
            }
            CmdKind::Flow { lines }
        }
        CommandKindConfig::File => {
            let command_line = config
                .path
                .clone()
                .ok_or_else(|| invalid("a file command needs a 'path'"))?;
            CmdKind::File {
                command_line,
                cwd: base_dir.to_path_buf(),
            }
        }
        CommandKindConfig::Dir => {
            let raw = config
                .path
                .as_deref()
                .ok_or_else(|| invalid("a dir command needs a 'path'"))?;
            let dir = expand_path(raw)?;
            CmdKind::Dir {
                dir: if dir.is_absolute() { dir } else { base_dir.join(dir) },
                entry: config.entry.clone().unwrap_or_else(|| DEFAULT_DIR_ENTRY.to_string()),
            }
        }
    };

    let cmd = tree.register(path, kind, &config.help)?;
    for arg in &config.args {
        let abbrs: Vec<&str> = arg.abbrs.iter().map(String::as_str).collect();
        cmd.add_arg(&arg.name, &arg.default, &abbrs)?;
    }
    for (arg, key) in &config.arg2env {
        cmd.add_arg2env(key, arg)?;
    }
    for (key, value) in &config.val2env {
        cmd.add_val2env(key, value);
    }
    for (key, specs) in &config.env_ops {
        for spec in specs.clone().into_vec() {
            cmd.add_env_op(key, EnvOp::parse(&spec)?);
        }
    }
    for dep in &config.depends {
        cmd.add_depend(&dep.os_cmd, &dep.reason);
    }
    cmd.auto_map.request(&config.auto_map.clone().into_vec());
    cmd.set_quiet(config.quiet);

    if !config.abbrs.is_empty() {
        let id = tree.ensure_path(path)?;
        tree.add_abbrs(id, &config.abbrs)?;
    }
    Ok(())
}
