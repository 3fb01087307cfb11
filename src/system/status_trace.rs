// src/system/status_trace.rs

//! The append-only execution trace kept in every session directory.
//!
//! ```text
//! <flow>
//!     deploy : echo done
//! </flow>
//! <cmd>
//!     deploy
//! </cmd>
//! <env-start>
//!     db.host=10.0.0.1
//! </env-start>
//! <subflow>
//!     <flow>
//!         ...
//!     </flow>
//! </subflow>
//! <env-finish>
//!     db.host=10.0.0.1
//! </env-finish>
//! <result>
//!     succeeded
//! </result>
//! <EOF/>
//! ```
//!
//! Nesting adds four spaces of indentation per level. A trace without `<EOF/>`
//! belongs to a run that is still going or died.

use crate::core::env_file::{escape_value, unescape_value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

const INDENT: &str = "    ";
pub const EOF_MARK: &str = "<EOF/>";

const MARK_FLOW: &str = "flow";
const MARK_CMD: &str = "cmd";
const MARK_ENV_START: &str = "env-start";
const MARK_ENV_FINISH: &str = "env-finish";
const MARK_RESULT: &str = "result";
const MARK_ERROR: &str = "error";
const MARK_SUBFLOW: &str = "subflow";
const MARK_SCHEDULED: &str = "scheduled";

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Status file I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Status file line {line_no}: unexpected '{line}'")]
    Unexpected { line_no: usize, line: String },
    #[error("Status file line {line_no}: unknown result '{value}'")]
    UnknownResult { line_no: usize, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutedResult {
    Succeeded,
    Failed,
    Skipped,
    Scheduled,
}

impl ExecutedResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command as read back from a trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutedCmd {
    pub cmd: String,
    pub start_env: BTreeMap<String, String>,
    pub finish_env: BTreeMap<String, String>,
    /// `None` while the command has not finished.
    pub result: Option<ExecutedResult>,
    pub error: Option<String>,
    pub sub_flow: Option<ExecutedFlow>,
    /// The background task id, when the command was delayed.
    pub scheduled: Option<String>,
}

/// A flow as read back from a trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutedFlow {
    pub flow: Vec<String>,
    pub cmds: Vec<ExecutedCmd>,
    /// Set when the trace ends with `<EOF/>` (top level only).
    pub finished: bool,
}

impl ExecutedFlow {
    /// True if any command, at any depth, failed.
    pub fn has_failure(&self) -> bool {
        self.cmds.iter().any(|c| {
            c.result == Some(ExecutedResult::Failed)
                || c.sub_flow.as_ref().is_some_and(ExecutedFlow::has_failure)
        })
    }

    /// The first recorded error, searching depth first.
    pub fn first_error(&self) -> Option<&str> {
        self.cmds.iter().find_map(|c| {
            c.sub_flow
                .as_ref()
                .and_then(ExecutedFlow::first_error)
                .or(c.error.as_deref())
        })
    }
}

/// Appends trace blocks to a status file. Each block is written with one call.
#[derive(Debug)]
pub struct StatusWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl StatusWriter {
    /// Opens (creating if needed) the status file for appending.
    pub fn open(path: &Path) -> Result<Self, StatusError> {
        let io_err = |source| StatusError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_raw(&self, text: &str) -> Result<(), StatusError> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(text.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| StatusError::Io {
                path: self.path.clone(),
                source,
            })
    }

    fn write_block(&self, depth: usize, mark: &str, lines: &[String]) -> Result<(), StatusError> {
        self.write_raw(&format_block(depth, mark, lines))
    }

    pub fn flow_start(&self, depth: usize, flow: &str) -> Result<(), StatusError> {
        self.write_block(depth, MARK_FLOW, &[escape_value(flow)])
    }

    pub fn cmd_start(
        &self,
        depth: usize,
        cmd: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), StatusError> {
        let mut text = format_block(depth, MARK_CMD, &[escape_value(cmd)]);
        text.push_str(&format_block(depth, MARK_ENV_START, &env_lines(env)));
        self.write_raw(&text)
    }

    pub fn subflow_start(&self, depth: usize) -> Result<(), StatusError> {
        self.write_raw(&format!("{}<{}>\n", INDENT.repeat(depth), MARK_SUBFLOW))
    }

    pub fn subflow_finish(&self, depth: usize) -> Result<(), StatusError> {
        self.write_raw(&format!("{}</{}>\n", INDENT.repeat(depth), MARK_SUBFLOW))
    }

    pub fn cmd_scheduled(&self, depth: usize, task_id: &str) -> Result<(), StatusError> {
        self.write_block(depth, MARK_SCHEDULED, &[task_id.to_string()])
    }

    pub fn cmd_finish(
        &self,
        depth: usize,
        env: &BTreeMap<String, String>,
        result: ExecutedResult,
        error: Option<&str>,
    ) -> Result<(), StatusError> {
        let mut text = format_block(depth, MARK_ENV_FINISH, &env_lines(env));
        text.push_str(&format_block(depth, MARK_RESULT, &[result.as_str().to_string()]));
        if let Some(error) = error {
            text.push_str(&format_block(depth, MARK_ERROR, &[escape_value(error)]));
        }
        self.write_raw(&text)
    }

    /// Marks the trace as cleanly finished.
    pub fn finish(&self) -> Result<(), StatusError> {
        self.write_raw(&format!("{}\n", EOF_MARK))
    }
}

fn format_block(depth: usize, mark: &str, lines: &[String]) -> String {
    let indent = INDENT.repeat(depth);
    let mut text = format!("{}<{}>\n", indent, mark);
    for line in lines {
        text.push_str(&indent);
        text.push_str(INDENT);
        text.push_str(line);
        text.push('\n');
    }
    text.push_str(&format!("{}</{}>\n", indent, mark));
    text
}

fn env_lines(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .map(|(k, v)| format!("{}={}", escape_value(k), escape_value(v)))
        .collect()
}

/// Reads a status file back.
pub fn parse_status_file(path: &Path) -> Result<ExecutedFlow, StatusError> {
    let content = fs::read_to_string(path).map_err(|source| StatusError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let lines: Vec<&str> = content.lines().collect();
    parse_status_lines(&lines)
}

pub fn parse_status_lines(lines: &[&str]) -> Result<ExecutedFlow, StatusError> {
    let mut cursor = Cursor { lines, pos: 0 };
    cursor.parse_flow(0)
}

struct Cursor<'a> {
    lines: &'a [&'a str],
    pos: usize,
}

fn indent_of(line: &str) -> usize {
    (line.len() - line.trim_start_matches(' ').len()) / INDENT.len()
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.pos).copied()
    }

    fn unexpected(&self, line: &str) -> StatusError {
        StatusError::Unexpected {
            line_no: self.pos + 1,
            line: line.to_string(),
        }
    }

    /// Reads the body of a block whose opening tag was just consumed. A
    /// missing closing tag (truncated trace) ends the block at end of input.
    fn read_block(&mut self, depth: usize, mark: &str) -> Vec<String> {
        let closing = format!("</{}>", mark);
        let body_indent = INDENT.repeat(depth + 1);
        let mut body = Vec::new();
        while let Some(line) = self.peek() {
            self.pos += 1;
            if indent_of(line) == depth && line.trim() == closing {
                break;
            }
            // Only the block indentation is layout; spaces past it belong to the value.
            let value = line
                .strip_prefix(&body_indent)
                .unwrap_or_else(|| line.trim_start_matches(' '));
            body.push(value.to_string());
        }
        body
    }

    fn parse_flow(&mut self, depth: usize) -> Result<ExecutedFlow, StatusError> {
        let mut flow = ExecutedFlow::default();

        while let Some(line) = self.peek() {
            if line.trim().is_empty() {
                self.pos += 1;
                continue;
            }
            if indent_of(line) < depth {
                // The enclosing `</subflow>`: the caller consumes it.
                break;
            }
            let tag = line.trim();
            if tag == EOF_MARK && depth == 0 {
                self.pos += 1;
                flow.finished = true;
                continue;
            }
            let Some(mark) = tag.strip_prefix('<').and_then(|t| t.strip_suffix('>')) else {
                return Err(self.unexpected(line));
            };
            let line_no = self.pos + 1;
            self.pos += 1;

            if mark == MARK_SUBFLOW {
                let sub = self.parse_flow(depth + 1)?;
                if let Some(close) = self.peek() {
                    if close.trim() == format!("</{}>", MARK_SUBFLOW) {
                        self.pos += 1;
                    }
                }
                match flow.cmds.last_mut() {
                    Some(cmd) => cmd.sub_flow = Some(sub),
                    None => return Err(StatusError::Unexpected { line_no, line: line.to_string() }),
                }
                continue;
            }

            let body = self.read_block(depth, mark);
            if mark == MARK_FLOW {
                flow.flow = body.iter().map(|l| unescape_value(l)).collect();
                continue;
            }
            if mark == MARK_CMD {
                flow.cmds.push(ExecutedCmd {
                    cmd: body.first().map(|l| unescape_value(l)).unwrap_or_default(),
                    ..ExecutedCmd::default()
                });
                continue;
            }

            let Some(cmd) = flow.cmds.last_mut() else {
                return Err(StatusError::Unexpected { line_no, line: line.to_string() });
            };
            match mark {
                MARK_ENV_START => cmd.start_env = parse_env_lines(&body),
                MARK_ENV_FINISH => cmd.finish_env = parse_env_lines(&body),
                MARK_RESULT => {
                    let value = body.first().map(String::as_str).unwrap_or_default();
                    cmd.result = Some(ExecutedResult::parse(value).ok_or_else(|| {
                        StatusError::UnknownResult {
                            line_no,
                            value: value.to_string(),
                        }
                    })?);
                }
                MARK_ERROR => {
                    cmd.error = Some(
                        body.iter()
                            .map(|l| unescape_value(l))
                            .collect::<Vec<_>>()
                            .join("\n"),
                    );
                }
                MARK_SCHEDULED => cmd.scheduled = body.first().cloned(),
                _ => return Err(StatusError::Unexpected { line_no, line: line.to_string() }),
            }
        }
        Ok(flow)
    }
}

fn parse_env_lines(body: &[String]) -> BTreeMap<String, String> {
    body.iter()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (unescape_value(k), unescape_value(v)))
        .collect()
}
