// src/core/env_file.rs

//! Line-oriented environment snapshots.
//!
//! Every persisted pair is one line: `env<TAB>key<TAB>value<TAB>layer`.
//! Blank values are never written. Lines that do not follow the format are
//! kept verbatim when a file is rewritten, so newer tools can add their own.

use crate::core::env::{Env, EnvError, EnvLayerKind};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const ENV_LINE_MARK: &str = "env";
pub const ENV_LINE_SEP: char = '\t';

/// A parsed snapshot line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLine {
    pub key: String,
    pub value: String,
    pub layer: Option<EnvLayerKind>,
}

/// Escapes a value so it fits on one line and never contains the separator.
pub fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

pub fn format_env_line(key: &str, value: &str, layer: EnvLayerKind) -> String {
    format!(
        "{mark}{sep}{key}{sep}{value}{sep}{layer}",
        mark = ENV_LINE_MARK,
        sep = ENV_LINE_SEP,
        key = escape_value(key),
        value = escape_value(value),
        layer = layer.name()
    )
}

/// Parses one snapshot line. Anything that is not a well-formed env line yields `None`.
pub fn parse_env_line(line: &str) -> Option<EnvLine> {
    let mut fields = line.split(ENV_LINE_SEP);
    if fields.next()? != ENV_LINE_MARK {
        return None;
    }
    let key = fields.next()?;
    let value = fields.next()?;
    let layer = fields.next()?;
    if fields.next().is_some() || key.is_empty() {
        return None;
    }
    Some(EnvLine {
        key: unescape_value(key),
        value: unescape_value(value),
        layer: EnvLayerKind::from_name(layer),
    })
}

/// Writes the visible, non-argument, non-`exclude_prefixes` pairs of `env` to `path`.
/// Unrecognised lines already present in the file survive the rewrite.
pub fn save_env_to_file(
    env: &Env,
    path: &Path,
    include_default: bool,
    exclude_prefixes: &[&str],
) -> Result<(), EnvError> {
    let passthrough = match fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .filter(|line| !line.trim().is_empty() && parse_env_line(line).is_none())
            .map(str::to_string)
            .collect(),
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut content = String::new();
    for (key, value) in env.flatten(include_default, exclude_prefixes, true) {
        if value.is_empty() {
            continue;
        }
        let layer = env.defined_in(&key).unwrap_or(env.kind());
        content.push_str(&format_env_line(&key, &value, layer));
        content.push('\n');
    }
    for line in passthrough {
        content.push_str(&line);
        content.push('\n');
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    log::debug!("Saved env snapshot to '{}'", path.display());
    Ok(())
}

/// Loads a snapshot into `env` (this layer only). A missing file is an empty snapshot.
/// Returns the lines that were not recognised.
pub fn load_env_from_file(env: &Env, path: &Path) -> Result<Vec<String>, EnvError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut unknown = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_env_line(line) {
            Some(parsed) if !parsed.value.is_empty() => {
                env.set(&parsed.key, &parsed.value);
            }
            Some(_) => {}
            None => unknown.push(line.to_string()),
        }
    }
    log::debug!(
        "Loaded env snapshot from '{}' ({} unrecognised line(s))",
        path.display(),
        unknown.len()
    );
    Ok(unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip_keeps_flattened_pairs() {
        // --- Setup ---
        let dir = tempdir().unwrap();
        let path = dir.path().join("env");
        let session = Env::new_session_chain();
        session.set("db.host", "localhost");
        session.set("multi", "line one\nline two\twith tab");
        session.set("blank", "");
        session
            .get_layer(EnvLayerKind::Persisted)
            .unwrap()
            .set("from.persisted", "yes");

        // --- Execute ---
        save_env_to_file(&session, &path, false, &["sys."]).unwrap();
        let reloaded = Env::new(EnvLayerKind::Persisted);
        let unknown = load_env_from_file(&reloaded, &path).unwrap();

        // --- Assert ---
        assert!(unknown.is_empty());
        let mut expected = session.flatten(false, &["sys."], true);
        expected.remove("blank");
        assert_eq!(reloaded.flatten(true, &[], false), expected);
    }

    #[test]
    fn test_unknown_lines_pass_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env");
        fs::write(&path, "# written by a newer version\nenv\ta\t1\tsession\n").unwrap();

        let env = Env::new(EnvLayerKind::Session);
        let unknown = load_env_from_file(&env, &path).unwrap();
        assert_eq!(unknown, vec!["# written by a newer version".to_string()]);
        assert_eq!(env.get_raw("a"), "1");

        env.set("b", "2");
        save_env_to_file(&env, &path, true, &[]).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("# written by a newer version"));
        assert!(content.contains("env\tb\t2\tsession"));
    }

    #[test]
    fn test_missing_file_is_empty_snapshot() {
        let dir = tempdir().unwrap();
        let env = Env::new(EnvLayerKind::Persisted);
        let unknown = load_env_from_file(&env, &dir.path().join("absent")).unwrap();
        assert!(unknown.is_empty());
        assert_eq!(env.local_len(), 0);
    }

    #[test]
    fn test_parse_env_line_rejects_malformed() {
        assert!(parse_env_line("env\tonly-key").is_none());
        assert!(parse_env_line("other\tk\tv\tsession").is_none());
        let line = parse_env_line("env\tk\tv\tpersisted").unwrap();
        assert_eq!(line.layer, Some(EnvLayerKind::Persisted));
    }
}
