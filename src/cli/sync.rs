use colored::Colorize;

use crate::connections::{find_connection, list_connections};
use crate::error::SyncError;
use crate::models::{AuditLogEntry, AuditStatus};
use crate::sync::Orchestrator;

use super::{open_db, runtime};

fn report(name: &str, entry: &AuditLogEntry) {
    match entry.status {
        AuditStatus::Success => println!(
            "{} {name}: {} new, {} duplicate, {} skipped, {} categorized",
            "\u{2713}".green(),
            entry.inserts,
            entry.duplicates,
            entry.skipped,
            entry.categorized
        ),
        _ => println!(
            "{} {name}: {}",
            "\u{2717}".red(),
            entry.error_message.as_deref().unwrap_or("failed")
        ),
    }
}

pub fn run(connection: Option<&str>, all: bool) -> anyhow::Result<()> {
    let (settings, conn) = open_db()?;
    let targets = match connection {
        Some(name) if !all => vec![find_connection(&conn, name)?],
        _ => list_connections(&conn)?,
    };
    drop(conn);

    let orchestrator = Orchestrator::from_settings(&settings);
    let rt = runtime()?;
    let mut failed = 0;
    for target in &targets {
        match rt.block_on(orchestrator.run_sync(target.id)) {
            Ok(entry) => {
                if entry.status == AuditStatus::Failed {
                    failed += 1;
                }
                report(&target.name, &entry);
            }
            Err(SyncError::AlreadyRunning(_)) => {
                println!("{} {}: already running", "\u{2013}".yellow(), target.name);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} sync(s) failed", targets.len());
    }
    Ok(())
}
