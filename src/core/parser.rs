// src/core/parser.rs

//! Turns flow tokens into [`ParsedCmds`].
//!
//! Syntax, per command (commands are separated by `:`):
//!
//! ```text
//! {global=1} : db.restart host=10.0.0.1 {db.port=5432} : echo hi %delay=2s : desc!
//! ```
//!
//! * a dotted path, each segment matched by name or abbreviation;
//! * `{k=v ...}` overrides, attached to the segment written before them (or to
//!   the whole flow when they come before the first command);
//! * `name=value` or positional arguments;
//! * `%delay=<duration>` engine arguments;
//! * a trailing `!` on the last command marks it priority.

use crate::{
    constants::{CMD_PATH_SEP, FLOW_SEP},
    core::{
        cmd::CmdTree,
        env::parse_duration,
        flow::{MatchedCmd, ParsedCmd, ParsedCmdSeg, ParsedCmds, ParsedEnv},
    },
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown command '{name}' (no match for segment '{segment}').")]
    UnknownCmd { name: String, segment: String },
    #[error("'{0}' is a command group, not an executable command.")]
    NotExecutable(String),
    #[error("Command '{cmd}' has no argument named '{arg}'.")]
    UnknownArg { cmd: String, arg: String },
    #[error("Command '{cmd}' takes {max} argument(s); '{extra}' is one too many.")]
    TooManyArgs { cmd: String, max: usize, extra: String },
    #[error("Unclosed '{{' in flow.")]
    UnclosedEnvBlock,
    #[error("Malformed env override '{0}' (expected key=value).")]
    BadEnvPair(String),
    #[error("Invalid system argument '{0}'.")]
    InvalidSysArg(String),
    #[error("Empty command name in '{0}'.")]
    EmptyCmdName(String),
    #[error("Only the last command of a flow may be marked with '!' ('{0}').")]
    PriorityNotLast(String),
    #[error("Cannot split flow line: {0}")]
    Tokenize(String),
}

/// Anything that can turn tokens into a flow for a given command tree.
pub trait FlowParser: Send + Sync {
    fn parse(&self, tree: &CmdTree, tokens: &[String]) -> Result<ParsedCmds, ParseError>;
}

/// The flow syntax shipped with flowrun.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleFlowParser;

impl FlowParser for SimpleFlowParser {
    fn parse(&self, tree: &CmdTree, tokens: &[String]) -> Result<ParsedCmds, ParseError> {
        let groups = split_groups(tokens);
        let mut flow = ParsedCmds::default();
        let last_group = groups.len().saturating_sub(1);

        for (gi, group) in groups.iter().enumerate() {
            let words = join_env_blocks(group)?;
            let at_head = flow.cmds.is_empty() && flow.global_env.is_empty();
            let cmd = parse_cmd(tree, &words)?;

            if cmd.priority && gi != last_group {
                return Err(ParseError::PriorityNotLast(cmd.display_path()));
            }
            // A leading override-only group is the flow-global env.
            if at_head && cmd.is_env_only() {
                for seg in &cmd.segments {
                    for (key, v) in seg.env.iter() {
                        flow.global_env.insert(key, &v.val, v.is_arg, Vec::new());
                    }
                }
                flow.global_seq_idx = Some(0);
                continue;
            }
            flow.cmds.push(cmd);
        }
        log::trace!("Parsed flow: {}", flow.render_flow());
        Ok(flow)
    }
}

/// Joins flow-body lines into one token stream; each line is its own command
/// sequence. Blank lines and `#` comments are skipped.
pub fn lines_to_tokens(lines: &[String]) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let words = shlex::split(trimmed).ok_or_else(|| ParseError::Tokenize(trimmed.to_string()))?;
        if words.is_empty() {
            continue;
        }
        if !tokens.is_empty() {
            tokens.push(FLOW_SEP.to_string());
        }
        tokens.extend(words);
    }
    Ok(tokens)
}

/// Splits tokens into per-command word groups.
///
/// A `:` separates commands when it is outside `{...}` and the word being built
/// has no `=` yet, so values such as `url=http://host:80` stay intact.
fn split_groups(tokens: &[String]) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = vec![Vec::new()];
    let mut depth = 0usize;

    for token in tokens {
        let mut word = String::new();
        for c in token.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                _ => {}
            }
            if c == ':' && depth == 0 && !word.contains('=') {
                if !word.is_empty() {
                    push_word(&mut groups, std::mem::take(&mut word));
                }
                groups.push(Vec::new());
                continue;
            }
            word.push(c);
        }
        if !word.is_empty() {
            push_word(&mut groups, word);
        }
    }
    groups.retain(|g| !g.is_empty());
    groups
}

fn push_word(groups: &mut Vec<Vec<String>>, word: String) {
    if let Some(current) = groups.last_mut() {
        current.push(word);
    }
}

/// One word of a command group, with `{...}` blocks collected into a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Word {
    Plain(String),
    EnvBlock(Vec<(String, String)>),
}

fn join_env_blocks(words: &[String]) -> Result<Vec<Word>, ParseError> {
    let mut out = Vec::new();
    let mut block: Option<String> = None;

    for word in words {
        // `name{k=v}` is shorthand for `name {k=v}`.
        let (head, rest) = match (&block, word.find('{')) {
            (None, Some(pos)) if pos > 0 => word.split_at(pos),
            _ => ("", word.as_str()),
        };
        if !head.is_empty() {
            out.push(Word::Plain(head.to_string()));
        }

        match block.as_mut() {
            Some(buf) => {
                buf.push(' ');
                buf.push_str(rest);
            }
            None if rest.starts_with('{') => block = Some(rest.to_string()),
            None => {
                out.push(Word::Plain(rest.to_string()));
                continue;
            }
        }

        if let Some(buf) = block.as_ref() {
            if brace_balance(buf) == 0 {
                let (inner, trailing) = strip_block(buf)?;
                out.push(Word::EnvBlock(parse_env_pairs(&inner)?));
                if !trailing.is_empty() {
                    out.push(Word::Plain(trailing));
                }
                block = None;
            }
        }
    }
    if block.is_some() {
        return Err(ParseError::UnclosedEnvBlock);
    }
    Ok(out)
}

fn brace_balance(text: &str) -> i64 {
    text.chars().fold(0, |acc, c| match c {
        '{' => acc + 1,
        '}' => acc - 1,
        _ => acc,
    })
}

/// Returns the text between the outer braces and whatever followed the closing one.
fn strip_block(text: &str) -> Result<(String, String), ParseError> {
    let mut depth = 0i64;
    for (i, c) in text.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let inner = text.get(1..i).unwrap_or_default().to_string();
                    let trailing = text.get(i + 1..).unwrap_or_default().trim().to_string();
                    return Ok((inner, trailing));
                }
            }
            _ => {}
        }
    }
    Err(ParseError::UnclosedEnvBlock)
}

/// `a=1 b=two words c=3`: fragments without `=` continue the previous value.
fn parse_env_pairs(inner: &str) -> Result<Vec<(String, String)>, ParseError> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for fragment in inner.split_whitespace() {
        match fragment.split_once('=') {
            Some((key, val)) if !key.is_empty() => pairs.push((key.to_string(), val.to_string())),
            Some(_) => return Err(ParseError::BadEnvPair(fragment.to_string())),
            None => match pairs.last_mut() {
                Some((_, val)) => {
                    val.push(' ');
                    val.push_str(fragment);
                }
                None => return Err(ParseError::BadEnvPair(fragment.to_string())),
            },
        }
    }
    Ok(pairs)
}

fn parse_cmd(tree: &CmdTree, words: &[Word]) -> Result<ParsedCmd, ParseError> {
    let mut cmd = ParsedCmd::default();
    let mut path = String::new();
    let mut positional = 0usize;

    for word in words {
        match word {
            Word::EnvBlock(pairs) => {
                if cmd.segments.is_empty() {
                    cmd.segments.push(ParsedCmdSeg {
                        matched: MatchedCmd {
                            name: String::new(),
                            cmd: None,
                        },
                        env: ParsedEnv::new(),
                    });
                }
                let matched_path: Vec<String> =
                    cmd.segments.iter().map(|s| s.matched.name.clone()).collect();
                if let Some(seg) = cmd.segments.last_mut() {
                    for (key, val) in pairs {
                        seg.env.insert(key, val, false, matched_path.clone());
                    }
                }
            }
            Word::Plain(text) if text == "!" => cmd.priority = true,
            Word::Plain(text) if text.starts_with('%') => parse_sys_arg(&mut cmd, text)?,
            Word::Plain(text) if path.is_empty() && cmd.is_env_only() => {
                let name = match text.strip_suffix('!') {
                    Some(stripped) => {
                        cmd.priority = true;
                        stripped
                    }
                    None => text.as_str(),
                };
                path = match_path(tree, &mut cmd, name)?;
            }
            Word::Plain(text) => {
                let id = cmd
                    .last_cmd_id()
                    .ok_or_else(|| ParseError::EmptyCmdName(text.clone()))?;
                let Some(target) = tree.cmd(id) else {
                    return Err(ParseError::NotExecutable(path.clone()));
                };
                let (arg, value) = match text.split_once('=') {
                    Some((given, value)) => {
                        let real = target.args.match_name(given).ok_or_else(|| ParseError::UnknownArg {
                            cmd: path.clone(),
                            arg: given.to_string(),
                        })?;
                        (real.to_string(), value.to_string())
                    }
                    None => {
                        let real = target.args.names().get(positional).ok_or_else(|| {
                            ParseError::TooManyArgs {
                                cmd: path.clone(),
                                max: target.args.len(),
                                extra: text.clone(),
                            }
                        })?;
                        positional += 1;
                        (real.clone(), text.clone())
                    }
                };
                let matched_path: Vec<String> =
                    cmd.segments.iter().map(|s| s.matched.name.clone()).collect();
                let key = format!("{}{}{}", path, CMD_PATH_SEP, arg);
                if let Some(seg) = cmd.segments.last_mut() {
                    seg.env.insert(&key, &value, true, matched_path);
                }
            }
        }
    }

    if let Some(id) = cmd.last_cmd_id() {
        if tree.cmd(id).is_none() {
            return Err(ParseError::NotExecutable(path));
        }
    }
    Ok(cmd)
}

/// Resolves a dotted path into segments, keeping any env block already written
/// before the name on the first segment.
fn match_path(tree: &CmdTree, cmd: &mut ParsedCmd, name: &str) -> Result<String, ParseError> {
    let pending_env = cmd.segments.pop().map(|s| s.env).unwrap_or_default();
    let mut current = CmdTree::ROOT;

    for (i, segment) in name.split(CMD_PATH_SEP).enumerate() {
        if segment.is_empty() {
            return Err(ParseError::EmptyCmdName(name.to_string()));
        }
        current = tree
            .find_child(current, segment)
            .ok_or_else(|| ParseError::UnknownCmd {
                name: name.to_string(),
                segment: segment.to_string(),
            })?;
        cmd.segments.push(ParsedCmdSeg {
            matched: MatchedCmd {
                name: tree.name(current).to_string(),
                cmd: Some(current),
            },
            env: if i == 0 { pending_env.clone() } else { ParsedEnv::new() },
        });
    }
    Ok(tree.display_path(current))
}

fn parse_sys_arg(cmd: &mut ParsedCmd, text: &str) -> Result<(), ParseError> {
    let invalid = || ParseError::InvalidSysArg(text.to_string());
    let (key, value) = text
        .trim_start_matches('%')
        .split_once('=')
        .ok_or_else(invalid)?;
    match key {
        "delay" => {
            cmd.sys_args.delay = parse_duration(value).map_err(|_| invalid())?;
            Ok(())
        }
        _ => Err(invalid()),
    }
}
