//! Migration runner for the realtime-api schema.
//!
//! Usage:
//!   cargo run -p realtime-api --bin realtime-migrate
//!   cargo run -p realtime-api --bin realtime-migrate -- --status
//!   cargo run -p realtime-api --bin realtime-migrate -- --revert
//!
//! Reads DATABASE_URL from the environment (or .env via dotenvy).

use std::path::Path;
use std::process::ExitCode;

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

enum Mode {
    Apply,
    Status,
    Revert,
}

fn main() -> ExitCode {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL env var is required");
        return ExitCode::FAILURE;
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = if args.iter().any(|a| a == "--revert") {
        Mode::Revert
    } else if args.iter().any(|a| a == "--status") {
        Mode::Status
    } else {
        Mode::Apply
    };

    match run(&database_url, mode) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("migration failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(database_url: &str, mode: Mode) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!("Connecting to database...");
    let mut conn = PgConnection::establish(database_url)?;

    match mode {
        Mode::Status => {
            let pending = conn.pending_migrations(MIGRATIONS)?;
            if pending.is_empty() {
                println!("Schema is up to date.");
            } else {
                for migration in &pending {
                    println!("  Pending: {}", migration.name());
                }
            }
        }
        Mode::Revert => {
            let reverted = conn.revert_last_migration(MIGRATIONS)?;
            println!("Reverted: {reverted}");
        }
        Mode::Apply => {
            let applied = conn.run_pending_migrations(MIGRATIONS)?;
            if applied.is_empty() {
                println!("No pending migrations.");
            } else {
                for migration in &applied {
                    println!("  Applied: {migration}");
                }
                println!("{} migration(s) applied.", applied.len());
            }
        }
    }
    Ok(())
}
