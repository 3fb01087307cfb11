// src/core/env.rs

//! The layered key-value environment every command reads and writes through.
//!
//! An [`Env`] is a cheap handle to one layer. Layers form a parent chain
//! (`Default <- Persisted <- Session <- SubFlow/Command ...`); many child layers
//! may share one parent. Lookups walk from the leaf towards the root, writes
//! always target the layer the handle points at.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

/// The scope a layer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvLayerKind {
    Default,
    Persisted,
    Session,
    Command,
    SubFlow,
}

impl EnvLayerKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Persisted => "persisted",
            Self::Session => "session",
            Self::Command => "command",
            Self::SubFlow => "subflow",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::Default),
            "persisted" => Some(Self::Persisted),
            "session" => Some(Self::Session),
            "command" => Some(Self::Command),
            "subflow" => Some(Self::SubFlow),
            _ => None,
        }
    }
}

impl fmt::Display for EnvLayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One stored value. `is_arg` marks values that came from a command argument
/// rather than from a plain env assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVal {
    pub raw: String,
    pub is_arg: bool,
}

#[derive(Error, Debug)]
pub enum EnvError {
    /// The chain was built without a layer the caller relies on.
    #[error("Environment layer '{0}' not found in the layer chain.")]
    LayerNotFound(EnvLayerKind),
    #[error("Invalid duration '{value}' for env key '{key}': {source}")]
    InvalidDuration {
        key: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("Invalid integer '{value}' for env key '{key}'.")]
    InvalidInt { key: String, value: String },
    #[error("Filesystem Error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct EnvNode {
    kind: EnvLayerKind,
    pairs: RwLock<HashMap<String, EnvVal>>,
    parent: Option<Env>,
}

/// A handle to one environment layer. Cloning the handle shares the layer.
#[derive(Debug, Clone)]
pub struct Env {
    node: Arc<EnvNode>,
}

impl Env {
    /// Creates a root layer with no parent.
    pub fn new(kind: EnvLayerKind) -> Self {
        Self {
            node: Arc::new(EnvNode {
                kind,
                pairs: RwLock::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    /// Creates an empty child layer on top of this one.
    pub fn new_layer(&self, kind: EnvLayerKind) -> Self {
        Self {
            node: Arc::new(EnvNode {
                kind,
                pairs: RwLock::new(HashMap::new()),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Builds `Default <- Persisted <- Session` and returns the session layer.
    pub fn new_session_chain() -> Self {
        Self::new(EnvLayerKind::Default)
            .new_layer(EnvLayerKind::Persisted)
            .new_layer(EnvLayerKind::Session)
    }

    pub fn kind(&self) -> EnvLayerKind {
        self.node.kind
    }

    pub fn parent(&self) -> Option<&Env> {
        self.node.parent.as_ref()
    }

    /// True if both handles point at the same layer.
    pub fn same_layer(&self, other: &Env) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, EnvVal>> {
        self.node.pairs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, EnvVal>> {
        self.node.pairs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Iterates the chain from this layer up to the root.
    pub fn layers(&self) -> impl Iterator<Item = &Env> {
        std::iter::successors(Some(self), |env| (*env).parent())
    }

    /// Returns the nearest layer of the given kind, walking towards the root.
    pub fn get_layer(&self, kind: EnvLayerKind) -> Result<Env, EnvError> {
        self.layers()
            .find(|layer| layer.kind() == kind)
            .cloned()
            .ok_or(EnvError::LayerNotFound(kind))
    }

    /// Looks a key up through the chain. `None` when no layer defines it.
    pub fn get_opt(&self, key: &str) -> Option<EnvVal> {
        self.layers().find_map(|layer| layer.read().get(key).cloned())
    }

    /// Looks a key up through the chain; an undefined key yields an empty value.
    pub fn get(&self, key: &str) -> EnvVal {
        self.get_opt(key).unwrap_or_default()
    }

    pub fn get_raw(&self, key: &str) -> String {
        self.get(key).raw
    }

    pub fn has(&self, key: &str) -> bool {
        self.layers().any(|layer| layer.read().contains_key(key))
    }

    pub fn has_non_empty(&self, key: &str) -> bool {
        self.get_opt(key).is_some_and(|v| !v.raw.is_empty())
    }

    /// The kind of the nearest layer that defines `key`.
    pub fn defined_in(&self, key: &str) -> Option<EnvLayerKind> {
        self.layers()
            .find(|layer| layer.read().contains_key(key))
            .map(Env::kind)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        parse_bool(&self.get_raw(key))
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>, EnvError> {
        let raw = self.get_raw(key);
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let parsed = raw.trim().parse::<i64>();
        parsed.map(Some).map_err(|_| EnvError::InvalidInt {
            key: key.to_string(),
            value: raw,
        })
    }

    /// Reads a humantime duration (`2s`, `500ms`, `1m 30s`). A bare number is seconds.
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, EnvError> {
        let raw = self.get_raw(key);
        parse_duration(&raw).map_err(|source| EnvError::InvalidDuration {
            key: key.to_string(),
            value: raw,
            source,
        })
    }

    /// Writes a plain value into this layer. Returns false if nothing changed.
    pub fn set(&self, key: &str, value: &str) -> bool {
        self.set_ext(key, value, false)
    }

    pub fn set_arg(&self, key: &str, value: &str) -> bool {
        self.set_ext(key, value, true)
    }

    /// Writes into this layer only. Writing the value already stored here is a no-op.
    pub fn set_ext(&self, key: &str, value: &str, is_arg: bool) -> bool {
        let mut pairs = self.write();
        if let Some(old) = pairs.get(key) {
            if old.raw == value {
                return false;
            }
        }
        pairs.insert(
            key.to_string(),
            EnvVal {
                raw: value.to_string(),
                is_arg,
            },
        );
        true
    }

    pub fn set_bool(&self, key: &str, value: bool) -> bool {
        self.set(key, if value { "true" } else { "false" })
    }

    pub fn set_int(&self, key: &str, value: i64) -> bool {
        self.set(key, &value.to_string())
    }

    /// Removes a key from this layer only; ancestors keep theirs.
    pub fn delete(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    /// Removes a key from this layer and every ancestor up to, not including,
    /// the first layer of kind `stop`.
    pub fn delete_through_all(&self, key: &str, stop: EnvLayerKind) {
        for layer in self.layers() {
            if layer.kind() == stop {
                break;
            }
            layer.delete(key);
        }
    }

    /// The pairs stored in this layer, sorted by key.
    pub fn local_pairs(&self) -> Vec<(String, EnvVal)> {
        let mut pairs: Vec<_> = self
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }

    pub fn local_len(&self) -> usize {
        self.read().len()
    }

    /// Merges every visible key, root first so closer layers win.
    pub fn flatten(
        &self,
        include_default: bool,
        exclude_prefixes: &[&str],
        exclude_args: bool,
    ) -> BTreeMap<String, String> {
        let chain: Vec<&Env> = self.layers().collect();
        let mut merged = BTreeMap::new();
        for layer in chain.into_iter().rev() {
            if !include_default && layer.kind() == EnvLayerKind::Default {
                continue;
            }
            for (key, val) in layer.read().iter() {
                if exclude_args && val.is_arg {
                    continue;
                }
                if exclude_prefixes.iter().any(|p| key.starts_with(p)) {
                    continue;
                }
                merged.insert(key.clone(), val.raw.clone());
            }
        }
        merged
    }

    /// Copies the non-argument values of this layer into `target`.
    pub fn write_not_arg_to(&self, target: &Env) {
        for (key, val) in self.local_pairs() {
            if !val.is_arg {
                target.set(&key, &val.raw);
            }
        }
    }

    /// Copies the whole chain into fresh, unshared layers of the same kinds.
    pub fn clone_deep(&self) -> Env {
        let chain: Vec<&Env> = self.layers().collect();
        let mut copy: Option<Env> = None;
        for layer in chain.into_iter().rev() {
            let fresh = match &copy {
                Some(parent) => parent.new_layer(layer.kind()),
                None => Env::new(layer.kind()),
            };
            fresh.write().extend(layer.read().iter().map(|(k, v)| (k.clone(), v.clone())));
            copy = Some(fresh);
        }
        // The chain always contains at least `self`.
        copy.unwrap_or_else(|| Env::new(self.kind()))
    }
}

/// Accepts `true/yes/on/1` (any case) as true.
pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "true" | "yes" | "on" | "1" | "y"
    )
}

/// Parses a duration; empty input means "no duration", a bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Option<Duration>, humantime::DurationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Some(Duration::from_secs(secs)));
    }
    humantime::parse_duration(trimmed).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get_is_identity() {
        let env = Env::new(EnvLayerKind::Session);
        assert!(env.set("db.host", "127.0.0.1"));
        assert_eq!(env.get_raw("db.host"), "127.0.0.1");
    }

    #[test]
    fn test_setting_same_value_twice_mutates_once() {
        let env = Env::new(EnvLayerKind::Session);
        assert!(env.set("k", "v"));
        assert!(!env.set("k", "v"));
        assert!(env.set("k", "w"));
        assert_eq!(env.local_len(), 1);
    }

    #[test]
    fn test_child_sees_parent_values() {
        let parent = Env::new(EnvLayerKind::Default);
        parent.set("k", "from-parent");
        let child = parent.new_layer(EnvLayerKind::Session);
        assert_eq!(child.get_raw("k"), "from-parent");

        child.set("k", "from-child");
        assert_eq!(child.get_raw("k"), "from-child");
        assert_eq!(parent.get_raw("k"), "from-parent");
    }

    #[test]
    fn test_missing_key_is_empty_not_error() {
        let env = Env::new_session_chain();
        assert_eq!(env.get("nope"), EnvVal::default());
        assert!(!env.has("nope"));
    }

    #[test]
    fn test_get_layer_walks_up_and_fails_for_unknown_kind() {
        let session = Env::new_session_chain();
        let cmd = session.new_layer(EnvLayerKind::Command);
        let found = cmd.get_layer(EnvLayerKind::Session).unwrap();
        assert!(found.same_layer(&session));
        assert!(matches!(
            cmd.get_layer(EnvLayerKind::SubFlow),
            Err(EnvError::LayerNotFound(EnvLayerKind::SubFlow))
        ));
    }

    #[test]
    fn test_delete_vs_delete_through_all() {
        let session = Env::new_session_chain();
        let persisted = session.get_layer(EnvLayerKind::Persisted).unwrap();
        let default = session.get_layer(EnvLayerKind::Default).unwrap();
        default.set("k", "d");
        persisted.set("k", "p");
        session.set("k", "s");

        session.delete("k");
        assert_eq!(session.get_raw("k"), "p");

        session.set("k", "s");
        session.delete_through_all("k", EnvLayerKind::Default);
        assert_eq!(session.get_raw("k"), "d");
        assert_eq!(persisted.local_len(), 0);
    }

    #[test]
    fn test_flatten_filters() {
        let session = Env::new_session_chain();
        let default = session.get_layer(EnvLayerKind::Default).unwrap();
        default.set("only.default", "1");
        default.set("shared", "old");
        session.set("shared", "new");
        session.set("sys.stack", "a");
        session.set_arg("echo.msg", "hi");

        let all = session.flatten(true, &[], false);
        assert_eq!(all.get("shared").map(String::as_str), Some("new"));
        assert!(all.contains_key("only.default"));

        let visible = session.flatten(false, &["sys."], true);
        assert!(!visible.contains_key("only.default"));
        assert!(!visible.contains_key("sys.stack"));
        assert!(!visible.contains_key("echo.msg"));
        assert_eq!(visible.get("shared").map(String::as_str), Some("new"));
    }

    #[test]
    fn test_clone_deep_is_independent() {
        let session = Env::new_session_chain();
        session.set("k", "v");
        let copy = session.clone_deep();
        copy.set("k", "changed");
        assert_eq!(session.get_raw("k"), "v");
        assert_eq!(copy.kind(), EnvLayerKind::Session);
        assert!(copy.get_layer(EnvLayerKind::Default).is_ok());
    }

    #[test]
    fn test_duration_parsing() {
        let env = Env::new(EnvLayerKind::Session);
        env.set("a", "2s");
        env.set("b", "3");
        env.set("c", "soon");
        assert_eq!(env.get_duration("a").unwrap(), Some(Duration::from_secs(2)));
        assert_eq!(env.get_duration("b").unwrap(), Some(Duration::from_secs(3)));
        assert_eq!(env.get_duration("missing").unwrap(), None);
        assert!(env.get_duration("c").is_err());
    }
}
