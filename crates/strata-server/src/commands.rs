//! CLI command definitions.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the schedulers until interrupted
    Serve {
        /// Use an in-memory store instead of Postgres (nothing is persisted)
        #[arg(long)]
        memory: bool,
    },

    /// Apply metadata store migrations and exit
    Migrate,

    /// Cancel every running task and fail their backups
    ClearRunning,

    /// Print the effective configuration
    Config,
}
