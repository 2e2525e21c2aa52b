//! CLI argument definitions using clap derive API

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// emailsort - apply and inspect schema changesets for the mail store
#[derive(Parser, Debug)]
#[command(name = "emailsort")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all commands
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Override config file path (default: ~/.emailsort/config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply every pending changeset in order, stopping at the first failure
    Migrate(MigrateArgs),

    /// Show the recorded schema version and applied changesets
    Status,

    /// List changesets not yet applied and whether the next one can run
    Pending,

    /// Check the live schema against the migrated email-schema invariants
    Verify,
}

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Skip the `<db>.pre-migration.bak` copy taken before applying changesets
    #[arg(long)]
    pub no_backup: bool,
}
