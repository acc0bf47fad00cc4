//! Command-line surface: a `clap` derive `Args` struct with a
//! subcommand set (`start`/`reload`/`generate`/`version`).

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "gordon", author, version, about = "Single-host container orchestration: registry, deployment controller, reverse proxy", long_about = None)]
pub struct Cli {
    /// Configuration file path; overrides the default search order entirely.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the registry, deployment controller, and reverse proxy (default).
    Start,
    /// Ask a running instance to reload its configuration (SIGUSR1).
    Reload,
    /// Generate credential material.
    Generate {
        #[command(subcommand)]
        what: GenerateWhat,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum GenerateWhat {
    /// A random JWT signing secret, suitable for `[auth] jwt_secret`.
    JwtSecret,
    /// A signed JWT for the given subject and scopes.
    JwtToken {
        #[arg(long)]
        subject: String,
        /// Repeatable; each value is a full scope string, e.g.
        /// `repository:myapp:pull` or `admin:*:*`.
        #[arg(long = "scope")]
        scopes: Vec<String>,
        /// Validity in seconds; defaults to the configured token validity.
        #[arg(long)]
        validity: Option<i64>,
    },
    /// A random API key, suitable for `[auth] api_key`.
    ApiKey,
}
