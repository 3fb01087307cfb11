// src/models.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- `flowrun.toml` MODELS (What is read from the catalog file) ---

/// Accepts either a single string or a list of strings.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

impl Default for OneOrMany {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct OptionsConfig {
    /// Where session directories go. `~` and `$VARS` are expanded.
    pub sessions_dir: Option<String>,
    /// How long finished sessions of dead processes are kept (`3d`, `12h`).
    pub session_keep: Option<String>,
    /// Pause between the commands of a flow.
    pub step_delay: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandKindConfig {
    #[default]
    Flow,
    File,
    Dir,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ArgConfig {
    pub name: String,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub abbrs: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct DependConfig {
    pub os_cmd: String,
    #[serde(default)]
    pub reason: String,
}

/// One `[commands."dotted.name"]` table.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct CommandConfig {
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub kind: CommandKindConfig,
    /// Flow body, one command sequence per line.
    #[serde(default)]
    pub flow: OneOrMany,
    /// The command line of a file command, or the directory of a dir command.
    pub path: Option<String>,
    /// Entry script of a dir command.
    pub entry: Option<String>,
    #[serde(default)]
    pub args: Vec<ArgConfig>,
    /// `arg = "env.key"`
    #[serde(default)]
    pub arg2env: BTreeMap<String, String>,
    /// `"env.key" = "value"`
    #[serde(default)]
    pub val2env: BTreeMap<String, String>,
    /// `"env.key" = "read"` or `["read", "may-write"]`
    #[serde(default)]
    pub env_ops: BTreeMap<String, OneOrMany>,
    #[serde(default)]
    pub depends: Vec<DependConfig>,
    /// Argument names to discover from the flow body, or `"*"`.
    #[serde(default)]
    pub auto_map: OneOrMany,
    #[serde(default)]
    pub abbrs: Vec<String>,
    #[serde(default)]
    pub quiet: bool,
}

/// Represents the deserialized structure of a `flowrun.toml` file.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct CatalogFile {
    #[serde(default)]
    pub options: OptionsConfig,
    /// Loaded into the default env layer.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_deserializes_flexible_fields() {
        let text = r#"
            [options]
            session_keep = "12h"

            [env]
            "db.host" = "localhost"

            [commands."db.restart"]
            help = "Restart the database"
            flow = "db.stop : db.start"
            auto_map = "*"
            env_ops = { "db.host" = ["read", "may-write"] }

            [commands.deploy]
            kind = "file"
            path = "./deploy.sh"
            args = [{ name = "target", default = "staging", abbrs = ["t"] }]
            arg2env = { target = "deploy.target" }
        "#;

        let catalog: CatalogFile = toml::from_str(text).unwrap();

        assert_eq!(catalog.options.session_keep.as_deref(), Some("12h"));
        assert_eq!(catalog.env.get("db.host").map(String::as_str), Some("localhost"));
        let restart = catalog.commands.get("db.restart").unwrap();
        assert_eq!(restart.kind, CommandKindConfig::Flow);
        assert_eq!(restart.flow.clone().into_vec(), vec!["db.stop : db.start"]);
        assert_eq!(restart.auto_map.clone().into_vec(), vec!["*"]);
        let deploy = catalog.commands.get("deploy").unwrap();
        assert_eq!(deploy.kind, CommandKindConfig::File);
        assert_eq!(deploy.args.first().unwrap().abbrs, vec!["t"]);
    }
}
