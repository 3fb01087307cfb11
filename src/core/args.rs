// src/core/args.rs

//! Per-command argument declarations and their bindings to environment keys.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;

/// Malformed command declarations. These surface at registration time and abort start-up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Command '{cmd}': argument '{name}' is declared more than once.")]
    DuplicateArg { cmd: String, name: String },
    #[error("Command '{cmd}': abbreviation '{abbr}' of argument '{name}' is already used by '{other}'.")]
    ArgAbbrConflict {
        cmd: String,
        name: String,
        abbr: String,
        other: String,
    },
    #[error("Command '{cmd}': env key '{key}' is already mapped from argument '{arg}'.")]
    EnvKeyMappedTwice { cmd: String, key: String, arg: String },
    #[error("Command '{cmd}': argument '{arg}' is already mapped to env key '{key}'.")]
    ArgMappedTwice { cmd: String, arg: String, key: String },
    #[error("Command '{cmd}': cannot map undeclared argument '{arg}' to an env key.")]
    MappingUnknownArg { cmd: String, arg: String },
    #[error("Command '{path}' is already registered.")]
    DuplicateCmd { path: String },
    #[error("Name or abbreviation '{name}' is already used under '{parent}'.")]
    CmdNameConflict { parent: String, name: String },
    #[error("Invalid command name '{0}'.")]
    InvalidCmdName(String),
    #[error("Unknown env op '{0}' (expected read, write, may-read or may-write).")]
    UnknownEnvOp(String),
}

/// The ordered, named parameters a command accepts.
#[derive(Debug, Clone, Default)]
pub struct Args {
    names: Vec<String>,
    defaults: HashMap<String, String>,
    abbrs: HashMap<String, Vec<String>>,
    lookup: HashMap<String, String>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an argument. Names and abbreviations share one namespace per command.
    pub fn add_arg(
        &mut self,
        owner: &str,
        name: &str,
        default: &str,
        abbrs: &[String],
    ) -> Result<(), ConfigError> {
        if self.defaults.contains_key(name) {
            return Err(ConfigError::DuplicateArg {
                cmd: owner.to_string(),
                name: name.to_string(),
            });
        }
        for alias in std::iter::once(name).chain(abbrs.iter().map(String::as_str)) {
            if let Some(other) = self.lookup.get(alias) {
                return Err(ConfigError::ArgAbbrConflict {
                    cmd: owner.to_string(),
                    name: name.to_string(),
                    abbr: alias.to_string(),
                    other: other.clone(),
                });
            }
        }

        self.names.push(name.to_string());
        self.defaults.insert(name.to_string(), default.to_string());
        self.lookup.insert(name.to_string(), name.to_string());
        for abbr in abbrs {
            self.lookup.insert(abbr.clone(), name.to_string());
        }
        self.abbrs.insert(name.to_string(), abbrs.to_vec());
        Ok(())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        self.defaults.contains_key(name)
    }

    /// Resolves a name or abbreviation to the declared name.
    pub fn realname(&self, name_or_abbr: &str) -> Option<&str> {
        self.lookup.get(name_or_abbr).map(String::as_str)
    }

    /// Like [`Args::realname`] but tolerant of `-`/`_` spelling differences.
    pub fn match_name(&self, given: &str) -> Option<&str> {
        self.realname(given).or_else(|| {
            let wanted = given.replace('_', "-");
            self.lookup
                .iter()
                .find(|(alias, _)| alias.replace('_', "-") == wanted)
                .map(|(_, real)| real.as_str())
        })
    }

    pub fn default_val(&self, name: &str) -> Option<&str> {
        self.defaults.get(name).map(String::as_str)
    }

    pub fn abbrs(&self, name: &str) -> &[String] {
        self.abbrs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The positional slot of an argument.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// One resolved argument value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgVal {
    pub raw: String,
    /// True when the value came from the invocation or a mapped env key, not the default.
    pub provided: bool,
}

/// The resolved argument values handed to a command handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgVals(HashMap<String, ArgVal>);

impl ArgVals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, raw: &str, provided: bool) {
        self.0.insert(
            name.to_string(),
            ArgVal {
                raw: raw.to_string(),
                provided,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ArgVal> {
        self.0.get(name)
    }

    pub fn get_raw(&self, name: &str) -> &str {
        self.0.get(name).map(|v| v.raw.as_str()).unwrap_or("")
    }

    pub fn get_bool(&self, name: &str) -> bool {
        crate::core::env::parse_bool(self.get_raw(name))
    }

    pub fn is_provided(&self, name: &str) -> bool {
        self.0.get(name).is_some_and(|v| v.provided)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgVal)> {
        self.0.iter()
    }
}

/// Fixed key/value writes a command always performs.
#[derive(Debug, Clone, Default)]
pub struct Val2Env {
    pairs: Vec<(String, String)>,
}

impl Val2Env {
    /// Adds a write; re-adding a key replaces its value but keeps its position.
    pub fn add(&mut self, key: &str, value: &str) {
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.to_string(),
            None => self.pairs.push((key.to_string(), value.to_string())),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// An ordered one-to-one binding between argument names and env keys.
#[derive(Debug, Clone, Default)]
pub struct Arg2Env {
    keys: Vec<String>,
    key_to_arg: HashMap<String, String>,
    arg_to_key: HashMap<String, String>,
}

impl Arg2Env {
    pub fn add(&mut self, owner: &str, key: &str, arg: &str) -> Result<(), ConfigError> {
        if let Some(existing) = self.key_to_arg.get(key) {
            return Err(ConfigError::EnvKeyMappedTwice {
                cmd: owner.to_string(),
                key: key.to_string(),
                arg: existing.clone(),
            });
        }
        if let Some(existing) = self.arg_to_key.get(arg) {
            return Err(ConfigError::ArgMappedTwice {
                cmd: owner.to_string(),
                arg: arg.to_string(),
                key: existing.clone(),
            });
        }
        self.keys.push(key.to_string());
        self.key_to_arg.insert(key.to_string(), arg.to_string());
        self.arg_to_key.insert(arg.to_string(), key.to_string());
        Ok(())
    }

    pub fn get_env_key(&self, arg: &str) -> Option<&str> {
        self.arg_to_key.get(arg).map(String::as_str)
    }

    pub fn get_arg(&self, key: &str) -> Option<&str> {
        self.key_to_arg.get(key).map(String::as_str)
    }

    pub fn has_env_key(&self, key: &str) -> bool {
        self.key_to_arg.contains_key(key)
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.arg_to_key.contains_key(arg)
    }

    /// `(env key, arg name)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keys.iter().filter_map(|key| {
            self.key_to_arg
                .get(key)
                .map(|arg| (key.as_str(), arg.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A set of declared env operation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EnvOp(u8);

impl EnvOp {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(1 << 1);
    pub const MAY_READ: Self = Self(1 << 2);
    pub const MAY_WRITE: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Parses `read|may-write` style strings (also accepts `,` and `+` as separators).
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut op = Self::NONE;
        for part in spec.split(['|', ',', '+']) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            op |= match part.to_lowercase().replace('_', "-").as_str() {
                "read" | "r" => Self::READ,
                "write" | "w" => Self::WRITE,
                "may-read" | "mayread" => Self::MAY_READ,
                "may-write" | "maywrite" => Self::MAY_WRITE,
                _ => return Err(ConfigError::UnknownEnvOp(part.to_string())),
            };
        }
        if op.is_empty() {
            return Err(ConfigError::UnknownEnvOp(spec.to_string()));
        }
        Ok(op)
    }
}

impl BitOr for EnvOp {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EnvOp {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EnvOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::READ, "read"),
            (Self::WRITE, "write"),
            (Self::MAY_READ, "may-read"),
            (Self::MAY_WRITE, "may-write"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Author-declared env operations, used only by the static checker.
#[derive(Debug, Clone, Default)]
pub struct EnvOps {
    keys: Vec<String>,
    ops: HashMap<String, Vec<EnvOp>>,
}

impl EnvOps {
    pub fn add(&mut self, key: &str, op: EnvOp) {
        if !self.ops.contains_key(key) {
            self.keys.push(key.to_string());
        }
        self.ops.entry(key.to_string()).or_default().push(op);
    }

    /// `(key, op)` pairs: keys in declaration order, each key's ops in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, EnvOp)> {
        self.keys.iter().flat_map(move |key| {
            self.ops
                .get(key)
                .into_iter()
                .flatten()
                .map(move |op| (key.as_str(), *op))
        })
    }

    pub fn ops_of(&self, key: &str) -> &[EnvOp] {
        self.ops.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abbrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_args_reject_duplicates_and_abbr_conflicts() {
        let mut args = Args::new();
        args.add_arg("db.dump", "table", "", &abbrs(&["t"])).unwrap();

        let dup = args.add_arg("db.dump", "table", "x", &[]);
        assert!(matches!(dup, Err(ConfigError::DuplicateArg { .. })));

        let conflict = args.add_arg("db.dump", "target", "", &abbrs(&["t"]));
        assert!(matches!(
            conflict,
            Err(ConfigError::ArgAbbrConflict { ref other, .. }) if other == "table"
        ));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_args_lookup_by_abbr() {
        let mut args = Args::new();
        args.add_arg("x", "dry-run", "false", &abbrs(&["n"])).unwrap();
        assert_eq!(args.realname("n"), Some("dry-run"));
        assert_eq!(args.match_name("dry_run"), Some("dry-run"));
        assert_eq!(args.default_val("dry-run"), Some("false"));
        assert_eq!(args.index_of("dry-run"), Some(0));
    }

    #[test]
    fn test_arg2env_is_one_to_one() {
        let mut m = Arg2Env::default();
        m.add("c", "db.host", "host").unwrap();
        assert!(matches!(
            m.add("c", "db.host", "other"),
            Err(ConfigError::EnvKeyMappedTwice { .. })
        ));
        assert!(matches!(
            m.add("c", "db.addr", "host"),
            Err(ConfigError::ArgMappedTwice { .. })
        ));
        m.add("c", "db.port", "port").unwrap();
        let pairs: Vec<_> = m.iter().collect();
        assert_eq!(pairs, vec![("db.host", "host"), ("db.port", "port")]);
    }

    #[test]
    fn test_env_op_parse_and_display() {
        let op = EnvOp::parse("read|may-write").unwrap();
        assert!(op.contains(EnvOp::READ));
        assert!(op.contains(EnvOp::MAY_WRITE));
        assert!(!op.contains(EnvOp::WRITE));
        assert_eq!(op.to_string(), "read|may-write");
        assert!(EnvOp::parse("peek").is_err());
    }

    #[test]
    fn test_env_ops_keep_declaration_order() {
        let mut ops = EnvOps::default();
        ops.add("b", EnvOp::READ);
        ops.add("a", EnvOp::WRITE);
        ops.add("b", EnvOp::WRITE);
        let seen: Vec<_> = ops.iter().collect();
        assert_eq!(
            seen,
            vec![("b", EnvOp::READ), ("b", EnvOp::WRITE), ("a", EnvOp::WRITE)]
        );
    }

    #[test]
    fn test_val2env_replaces_in_place() {
        let mut v = Val2Env::default();
        v.add("a", "1");
        v.add("b", "2");
        v.add("a", "3");
        let pairs: Vec<_> = v.iter().collect();
        assert_eq!(pairs, vec![("a", "3"), ("b", "2")]);
    }
}
