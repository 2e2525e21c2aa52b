//! emailsort CLI - runs the mail store's schema changesets.
//!
//! Usage: `emailsort migrate`, `emailsort status`, `emailsort pending`,
//! `emailsort verify`. The database comes from `~/.emailsort/config.json`,
//! overridden by `DATABASE_URL` / `DATABASE_KEY` (a `.env` file is honoured).

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use rusqlite::Connection;

use emailsort_lib::config::Config;
use emailsort_lib::db::MailDb;
use emailsort_lib::{migrations, schema};

mod cli;

use cli::{Cli, Commands, GlobalArgs, MigrateArgs};

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let outcome = match &cli.command {
        Commands::Migrate(args) => migrate(args, &cli.global),
        Commands::Status => status(&cli.global),
        Commands::Pending => pending(&cli.global),
        Commands::Verify => verify(&cli.global),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(global: &GlobalArgs) -> Result<Config> {
    Config::load(global.config.as_deref()).context("Failed to load emailsort config")
}

/// Open an existing store read-only, for the inspection commands.
fn connect(config: &Config) -> Result<Connection> {
    let conn = MailDb::connect_existing(
        &config.database_path,
        config.access_key.as_deref(),
        config.busy_timeout_ms,
    )
    .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    Ok(conn)
}

fn migrate(args: &MigrateArgs, global: &GlobalArgs) -> Result<bool> {
    let mut config = load_config(global)?;
    if args.no_backup {
        config.backup_before_migrate = false;
    }

    let db = MailDb::open(&config).context("Migration failed")?;
    let version = migrations::current_version(db.conn_ref())?;
    println!(
        "{}: schema at version {version}",
        config.database_path.display()
    );
    Ok(true)
}

fn status(global: &GlobalArgs) -> Result<bool> {
    let config = load_config(global)?;
    let conn = connect(&config)?;

    let applied = migrations::applied_migrations(&conn)?;
    println!("Database: {}", config.database_path.display());
    println!("Version:  {}", migrations::current_version(&conn)?);
    if applied.is_empty() {
        println!("No changesets recorded.");
    }
    for m in &applied {
        println!("  v{:<3} {:<45} {}", m.version, m.name, m.applied_at);
    }
    Ok(true)
}

fn pending(global: &GlobalArgs) -> Result<bool> {
    let config = load_config(global)?;
    let conn = connect(&config)?;

    let adopted = migrations::adoptable_versions(&conn)?;
    if let Some(last) = adopted.last() {
        println!("Existing tables will be recorded as applied up to v{last} without running SQL.");
    }

    let pending = migrations::pending_migrations(&conn)?;
    let Some(next) = pending.first() else {
        println!("Up to date.");
        return Ok(true);
    };

    for m in &pending {
        println!("  v{:<3} {}", m.version, m.name);
    }
    match migrations::check_preconditions(&conn, next) {
        Ok(()) => {
            println!("Next changeset v{} is ready to apply.", next.version);
            Ok(true)
        }
        Err(e) => {
            println!("Next changeset cannot run: {e}");
            Ok(false)
        }
    }
}

fn verify(global: &GlobalArgs) -> Result<bool> {
    let config = load_config(global)?;
    let conn = connect(&config)?;

    let checks = schema::verify_email_schema(&conn)?;
    for check in &checks {
        let mark = if check.passed { "ok  " } else { "FAIL" };
        println!("[{mark}] {}", check.description);
    }
    let failed = checks.iter().filter(|c| !c.passed).count();
    if failed > 0 {
        log::warn!("{failed} schema check(s) failed");
    }
    Ok(failed == 0)
}
