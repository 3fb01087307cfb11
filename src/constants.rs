// src/constants.rs

/// Environment variable that overrides the flowrun home directory.
pub const HOME_ENV_VAR: &str = "FLOWRUN_HOME";

/// The name of the flowrun directory inside the system config directory.
pub const HOME_DIR_NAME: &str = "flowrun";

/// The command catalog file (inside the home directory).
pub const CATALOG_FILENAME: &str = "flowrun.toml";

/// The persisted environment snapshot shared across runs (inside the home directory).
pub const PERSISTED_ENV_FILENAME: &str = "env";

/// The default sessions root (inside the home directory).
pub const SESSIONS_DIR_NAME: &str = "sessions";

/// Inside a session directory: the environment snapshot.
pub const SESSION_ENV_FILENAME: &str = "env";

/// Inside a session directory: the append-only execution trace.
pub const SESSION_STATUS_FILENAME: &str = "status";

/// Default retention for finished sessions whose owner process is gone.
pub const DEFAULT_SESSION_KEEP: &str = "3d";

/// Separator between path segments of a command name (`db.restart`).
pub const CMD_PATH_SEP: char = '.';

/// Separator between commands of a flow (`a : b`).
pub const FLOW_SEP: &str = ":";

/// Prefix of system-owned environment keys, hidden from listings and snapshots.
pub const SYS_KEY_PREFIX: &str = "sys.";

pub const STACK_KEY: &str = "sys.stack";
pub const STACK_DEPTH_KEY: &str = "sys.stack-depth";
pub const STACK_SEP: &str = ",";
pub const SESSION_ID_KEY: &str = "sys.session.id";
pub const SESSION_DIR_KEY: &str = "sys.session.dir";
pub const STEP_DELAY_KEY: &str = "sys.step-delay";
pub const BREAKPOINT_BEFORE_KEY: &str = "sys.breakpoint.before";
pub const BREAKPOINT_AFTER_KEY: &str = "sys.breakpoint.after";
pub const BG_TASK_ID_KEY: &str = "sys.bg.task-id";

/// Prefix for environment keys exported to file/dir command processes.
pub const EXPORT_ENV_PREFIX: &str = "FLOWRUN_";

/// Variable naming the file a script may append `key=value` lines to.
pub const ENV_OUT_VAR: &str = "FLOWRUN_ENV_OUT";

/// Variable naming the current session directory for scripts.
pub const SESSION_DIR_VAR: &str = "FLOWRUN_SESSION_DIR";
