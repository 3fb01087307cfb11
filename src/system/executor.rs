// src/system/executor.rs

use crate::constants::{ENV_OUT_VAR, EXPORT_ENV_PREFIX};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::Path;
use std::process::{Child, Command as StdCommand, Stdio};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Command could not be parsed: {0}")]
    CommandParse(String),
    #[error("No command specified to run.")]
    EmptyCommand,
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, #[source] io::Error),
    #[error("Command '{command}' exited with {}", describe_exit(.code))]
    NonZeroExitStatus { command: String, code: Option<i32> },
    #[error("Could not exchange env with '{command}': {source}")]
    EnvExchange {
        command: String,
        #[source]
        source: io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// Maps an env key to the variable name a script sees: `db.host` → `FLOWRUN_DB_HOST`.
pub fn export_name(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", EXPORT_ENV_PREFIX, normalized)
}

/// Builds the process environment for a script from a flattened env.
pub fn export_env_vars(flat: &BTreeMap<String, String>) -> HashMap<String, String> {
    flat.iter()
        .map(|(key, value)| (export_name(key), value.clone()))
        .collect()
}

/// Runs an external command line (plus positional `args`) in `cwd`, streaming its
/// stdout into `out`. Stderr goes straight to the terminal.
///
/// The script may append `key=value` lines to the file named by `FLOWRUN_ENV_OUT`;
/// those pairs are returned once the process exits successfully.
pub fn execute_script(
    command_line: &str,
    args: &[String],
    cwd: &Path,
    env_vars: &HashMap<String, String>,
    out: &mut dyn Write,
) -> Result<Vec<(String, String)>, ExecutionError> {
    let trimmed_command = command_line.trim();
    if trimmed_command.is_empty() {
        return Err(ExecutionError::EmptyCommand);
    }

    let mut parts = shlex::split(trimmed_command)
        .ok_or_else(|| ExecutionError::CommandParse(trimmed_command.to_string()))?;
    if parts.is_empty() {
        return Err(ExecutionError::EmptyCommand);
    }
    parts.extend(args.iter().cloned());
    let (program, program_args) = parts
        .split_first()
        .ok_or(ExecutionError::EmptyCommand)?;

    let env_exchange_err = |source| ExecutionError::EnvExchange {
        command: trimmed_command.to_string(),
        source,
    };
    let env_out = NamedTempFile::new().map_err(env_exchange_err)?;
    let clean_cwd = dunce::simplified(cwd);

    let spawn = |program: &str, program_args: &[String]| -> io::Result<Child> {
        StdCommand::new(program)
            .args(program_args)
            .current_dir(clean_cwd)
            .envs(env_vars)
            .env(ENV_OUT_VAR, env_out.path())
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
    };

    // Fallback logic for Windows built-in commands like `echo`.
    // We try to spawn directly first. If it fails with `NotFound`, we try with `cmd /C`.
    let mut child = match spawn(program, program_args) {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound && cfg!(target_os = "windows") => {
            log::debug!("Command '{}' not found. Retrying with cmd /C.", program);
            let mut cmd_args = vec!["/C".to_string(), trimmed_command.to_string()];
            cmd_args.extend(args.iter().cloned());
            spawn("cmd", &cmd_args)
                .map_err(|e| ExecutionError::CommandFailed(trimmed_command.to_string(), e))?
        }
        Err(e) => {
            return Err(ExecutionError::CommandFailed(trimmed_command.to_string(), e));
        }
    };
    log::debug!("Spawned '{}' (PID: {})", trimmed_command, child.id());

    if let Some(mut stdout) = child.stdout.take() {
        if let Err(e) = io::copy(&mut stdout, out) {
            log::warn!("Lost part of the output of '{}': {}", trimmed_command, e);
        }
    }
    let status = child
        .wait()
        .map_err(|e| ExecutionError::CommandFailed(trimmed_command.to_string(), e))?;
    out.flush()
        .map_err(|e| ExecutionError::CommandFailed(trimmed_command.to_string(), e))?;

    if !status.success() {
        return Err(ExecutionError::NonZeroExitStatus {
            command: trimmed_command.to_string(),
            code: status.code(),
        });
    }

    let written = fs::read_to_string(env_out.path()).map_err(env_exchange_err)?;
    Ok(parse_env_out(&written))
}

/// `key=value` lines; blank lines and `#` comments are ignored.
pub fn parse_env_out(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_export_name_normalizes_keys() {
        assert_eq!(export_name("db.host"), "FLOWRUN_DB_HOST");
        assert_eq!(export_name("a-b.c_d"), "FLOWRUN_A_B_C_D");
    }

    #[test]
    fn test_parse_env_out_skips_noise() {
        let parsed = parse_env_out("# note\nk=v\n\n=bad\nnoeq\nurl=http://x?a=b\n");
        assert_eq!(
            parsed,
            vec![
                ("k".to_string(), "v".to_string()),
                ("url".to_string(), "http://x?a=b".to_string())
            ]
        );
    }

    #[test]
    fn test_empty_command_is_an_error() {
        let mut out = Vec::new();
        let result = execute_script("   ", &[], Path::new("."), &HashMap::new(), &mut out);
        assert!(matches!(result, Err(ExecutionError::EmptyCommand)));
    }

    #[cfg(unix)]
    #[test]
    fn test_script_output_args_and_env_exchange() {
        // --- Setup ---
        let dir = tempdir().unwrap();
        let mut env_vars = HashMap::new();
        env_vars.insert(export_name("greeting"), "hello".to_string());
        let script = r#"sh -c 'echo "$FLOWRUN_GREETING $0"; echo "answer=42" >> "$FLOWRUN_ENV_OUT"'"#;

        // --- Execute ---
        let mut out = Vec::new();
        let written = execute_script(script, &["world".to_string()], dir.path(), &env_vars, &mut out).unwrap();

        // --- Assert ---
        assert_eq!(String::from_utf8(out).unwrap(), "hello world\n");
        assert_eq!(written, vec![("answer".to_string(), "42".to_string())]);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_reports_code() {
        let dir = tempdir().unwrap();
        let mut out = Vec::new();
        let result = execute_script("sh -c 'exit 3'", &[], dir.path(), &HashMap::new(), &mut out);
        assert!(matches!(
            result,
            Err(ExecutionError::NonZeroExitStatus { code: Some(3), .. })
        ));
    }
}
