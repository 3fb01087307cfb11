//! flowrun: compose named commands into flows and run them against a layered
//! environment, with a static check of declared env reads and writes before
//! anything runs.

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod system;
