// src/core/mod.rs

pub mod args;
pub mod auto_map;
pub mod builtins;
pub mod catalog;
pub mod cmd;
pub mod env;
pub mod env_file;
pub mod env_ops_checker;
pub mod executor;
pub mod flow;
pub mod parser;
pub mod paths;
pub mod template;
