use std::collections::HashMap;

use colored::Colorize;
use comfy_table::{Cell, CellAlignment, Table};

use crate::db::account_id;
use crate::error::Result;
use crate::fmt::money;
use crate::reconciler::recent_transactions;

use super::open_db;

fn names(conn: &rusqlite::Connection, table: &str) -> Result<HashMap<i64, String>> {
    let mut stmt = conn.prepare(&format!("SELECT id, name FROM {table}"))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

pub fn run(account: Option<&str>, uncategorized: bool, limit: usize) -> Result<()> {
    let (_, conn) = open_db()?;
    let account_filter = account.map(|name| account_id(&conn, name)).transpose()?;
    let rows = recent_transactions(&conn, account_filter, uncategorized, limit)?;
    let accounts = names(&conn, "accounts")?;
    let categories = names(&conn, "categories")?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Date", "Account", "Description", "Amount", "Category", "Status"]);
    for txn in rows {
        let amount = if txn.amount.is_sign_negative() {
            money(txn.amount).red().to_string()
        } else {
            money(txn.amount).green().to_string()
        };
        let category = txn
            .category_id
            .and_then(|id| categories.get(&id).cloned())
            .unwrap_or_else(|| "\u{2014}".to_string());
        table.add_row(vec![
            Cell::new(txn.id),
            Cell::new(txn.date),
            Cell::new(accounts.get(&txn.account_id).cloned().unwrap_or_default()),
            Cell::new(&txn.description),
            Cell::new(amount).set_alignment(CellAlignment::Right),
            Cell::new(category),
            Cell::new(txn.status),
        ]);
    }
    println!("Transactions\n{table}");
    Ok(())
}
