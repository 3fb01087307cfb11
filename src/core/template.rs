// src/core/template.rs

//! `[[key]]` placeholders in sub-flow bodies.

use crate::core::{args::ArgVals, env::Env};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use thiserror::Error;

lazy_static! {
    // [[key]] or [[key:default]]; the default may be empty.
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\[\[\s*([^\[\]:\s]+)\s*(?::([^\]]*))?\]\]").expect("placeholder regex is valid");
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Cannot render flow of '{cmd}': no value for {}", keys.join(", "))]
    MissingKeys { cmd: String, keys: Vec<String> },
}

/// One placeholder found in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub key: String,
    pub default: Option<String>,
}

/// Lists the placeholders of `lines` in order of appearance (duplicates kept once).
pub fn placeholders(lines: &[String]) -> Vec<Placeholder> {
    let mut found: Vec<Placeholder> = Vec::new();
    for line in lines {
        for caps in PLACEHOLDER_RE.captures_iter(line) {
            let Some(key) = caps.get(1).map(|m| m.as_str().to_string()) else {
                continue;
            };
            if found.iter().any(|p| p.key == key) {
                continue;
            }
            found.push(Placeholder {
                key,
                default: caps.get(2).map(|m| m.as_str().to_string()),
            });
        }
    }
    found
}

/// Renders every line. A placeholder is filled from the invocation's arguments
/// first, then from the environment, then from its inline default.
pub fn render_template(
    cmd: &str,
    lines: &[String],
    env: &Env,
    argv: &ArgVals,
) -> Result<Vec<String>, RenderError> {
    let mut missing: Vec<String> = Vec::new();
    let rendered: Vec<String> = lines
        .iter()
        .map(|line| {
            PLACEHOLDER_RE
                .replace_all(line, |caps: &Captures<'_>| {
                    let key = caps.get(1).map_or("", |m| m.as_str());
                    if let Some(val) = argv.get(key) {
                        return val.raw.clone();
                    }
                    if let Some(val) = env.get_opt(key) {
                        return val.raw;
                    }
                    if let Some(default) = caps.get(2) {
                        return default.as_str().to_string();
                    }
                    if !missing.iter().any(|k| k == key) {
                        missing.push(key.to_string());
                    }
                    String::new()
                })
                .into_owned()
        })
        .collect();

    if missing.is_empty() {
        Ok(rendered)
    } else {
        Err(RenderError::MissingKeys {
            cmd: cmd.to_string(),
            keys: missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::EnvLayerKind;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_render_uses_argv_env_then_default() {
        // --- Setup ---
        let env = Env::new(EnvLayerKind::Session);
        env.set("db.host", "10.0.0.1");
        let mut argv = ArgVals::new();
        argv.insert("table", "users", true);
        let body = lines(&["db.dump table=[[table]] host=[[db.host]]", "echo [[greeting:hi there]]"]);

        // --- Execute ---
        let out = render_template("backup", &body, &env, &argv).unwrap();

        // --- Assert ---
        assert_eq!(out, lines(&["db.dump table=users host=10.0.0.1", "echo hi there"]));
    }

    #[test]
    fn test_render_reports_all_missing_keys() {
        let env = Env::new(EnvLayerKind::Session);
        let body = lines(&["a [[x]] [[y]] [[x]]"]);
        let err = render_template("f", &body, &env, &ArgVals::new()).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingKeys {
                cmd: "f".to_string(),
                keys: vec!["x".to_string(), "y".to_string()],
            }
        );
    }

    #[test]
    fn test_placeholders_listed_once() {
        let found = placeholders(&lines(&["[[a]] [[b:1]]", "[[a:2]]"]));
        assert_eq!(found.len(), 2);
        assert_eq!(found.get(1).and_then(|p| p.default.as_deref()), Some("1"));
    }
}
