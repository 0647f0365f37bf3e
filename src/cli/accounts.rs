use comfy_table::{Cell, Table};

use crate::error::{Result, SyncError};
use crate::models::Account;

use super::open_db;

pub fn add(name: &str, account_type: &str, institution: Option<&str>, number: Option<&str>) -> Result<()> {
    let (_, conn) = open_db()?;
    conn.execute(
        "INSERT INTO accounts (name, account_type, institution, account_number) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![name, account_type, institution, number],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            SyncError::Config(format!("an account named '{name}' already exists"))
        }
        e => SyncError::Db(e),
    })?;
    println!("Added account: {name}");
    Ok(())
}

pub fn list() -> Result<()> {
    let (_, conn) = open_db()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, account_type, institution, account_number FROM accounts ORDER BY name",
    )?;
    let rows: Vec<Account> = stmt
        .query_map([], |row| {
            Ok(Account {
                id: row.get(0)?,
                name: row.get(1)?,
                account_type: row.get(2)?,
                institution: row.get(3)?,
                account_number: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Type", "Institution", "Number"]);
    for account in rows {
        table.add_row(vec![
            Cell::new(account.id),
            Cell::new(account.name),
            Cell::new(account.account_type),
            Cell::new(account.institution.unwrap_or_default()),
            Cell::new(account.account_number.unwrap_or_default()),
        ]);
    }
    println!("Accounts\n{table}");
    Ok(())
}
