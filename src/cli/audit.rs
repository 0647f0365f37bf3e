use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::audit::list_audit;
use crate::connections::find_connection;
use crate::error::Result;
use crate::fmt::when;
use crate::models::AuditStatus;

use super::open_db;

pub fn run(connection: &str, limit: usize) -> Result<()> {
    let (_, conn) = open_db()?;
    let target = find_connection(&conn, connection)?;
    let entries = list_audit(&conn, target.id, limit)?;

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Started", "Finished", "Status", "New", "Dupes", "Skipped", "Categorized", "Error",
    ]);
    for e in &entries {
        let status = match e.status {
            AuditStatus::Success => e.status.as_str().green(),
            AuditStatus::Failed => e.status.as_str().red(),
            AuditStatus::Running => e.status.as_str().yellow(),
        };
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(when(Some(e.start_time))),
            Cell::new(when(e.end_time)),
            Cell::new(status.to_string()),
            Cell::new(e.inserts),
            Cell::new(e.duplicates),
            Cell::new(e.skipped),
            Cell::new(e.categorized),
            Cell::new(e.error_message.as_deref().unwrap_or("")),
        ]);
    }
    println!("Runs for {}\n{table}", target.name);
    Ok(())
}
