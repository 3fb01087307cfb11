//! # System Interaction Layer
//!
//! The boundary between the flow engine and the operating system.
//!
//! ## Modules
//!
//! - **`bg_tasks`**: Delayed commands on their own threads, with captured output that can
//!   be brought to the terminal and a one-shot completion signal per task.
//! - **`executor`**: Spawns the external processes behind file and dir commands and
//!   exchanges env values with them.
//! - **`os_deps`**: Verifies that the OS executables a flow declares are on `PATH`.
//! - **`sessions`**: Per-run session directories, their listing and stale-session cleanup.
//! - **`status_trace`**: The append-only execution trace written into each session.

pub mod bg_tasks;
pub mod executor;
pub mod os_deps;
pub mod sessions;
pub mod status_trace;
