use colored::Colorize;

use crate::connections::list_connections;
use crate::db::get_connection;
use crate::error::Result;
use crate::fmt::{format_bytes, when};
use crate::models::ConnectionStatus;
use crate::settings::load_settings;

use super::connections::status_label;

fn count(conn: &rusqlite::Connection, sql: &str) -> Result<i64> {
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();

    println!("Data dir:   {}", settings.data_dir);
    println!("Database:   {}", db_path.display());
    println!("Scrapers:   {}", settings.scraper_dir().display());

    if !db_path.exists() {
        println!();
        println!("Database not found. Run `ledgersync init` to set up.");
        return Ok(());
    }

    let size = std::fs::metadata(&db_path)?.len();
    println!("DB size:    {}", format_bytes(size));

    let conn = get_connection(&db_path)?;
    println!();
    println!("Accounts:       {}", count(&conn, "SELECT count(*) FROM accounts")?);
    println!("Transactions:   {}", count(&conn, "SELECT count(*) FROM transactions")?);
    println!(
        "Uncategorized:  {}",
        count(&conn, "SELECT count(*) FROM transactions WHERE category_id IS NULL")?
    );
    println!("Rules:          {}", count(&conn, "SELECT count(*) FROM rules WHERE is_active = 1")?);

    let connections = list_connections(&conn)?;
    println!("Connections:    {}", connections.len());
    for c in connections.iter().filter(|c| c.status != ConnectionStatus::Idle) {
        println!(
            "  {} {} (last run {}){}",
            c.name.bold(),
            status_label(c.status),
            when(c.last_run_at),
            c.last_error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
        );
    }
    Ok(())
}
