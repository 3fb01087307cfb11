// src/cli/handlers/mod.rs

// One module per CLI action.

pub mod check;
pub mod clean;
pub mod commons;
pub mod run;
pub mod sessions;
