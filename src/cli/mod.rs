use clap::Parser;

pub mod handlers;

/// flowrun: compose named commands into flows and run them against a layered env.
///
/// `flowrun <action> [args...]` runs one of the actions (`run`, `check`,
/// `sessions`, `clean`). Anything else is a flow: `flowrun db.start : deploy`
/// is the same as `flowrun run db.start : deploy`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// An action name, or the first word of a flow.
    pub action_or_flow: Option<String>,

    /// Everything after the first word, passed through untouched.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}
