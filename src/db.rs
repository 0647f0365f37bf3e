use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use crate::error::{Result, SyncError};

pub const DB_FILE: &str = "ledgersync.db";

/// Passphrase for SQLCipher builds; ignored by plain SQLite.
pub const DB_KEY_ENV: &str = "LEDGERSYNC_DB_KEY";

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    account_type TEXT NOT NULL,
    institution TEXT,
    account_number TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    category_type TEXT NOT NULL,
    is_active INTEGER DEFAULT 1
);

CREATE TABLE IF NOT EXISTS imports (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    format TEXT NOT NULL,
    import_date TEXT DEFAULT (datetime('now')),
    record_count INTEGER,
    date_range_start TEXT,
    date_range_end TEXT,
    checksum TEXT,
    account_id INTEGER,
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);

CREATE INDEX IF NOT EXISTS idx_imports_checksum
    ON imports (checksum, account_id);

-- amount is stored in minor units (cents)
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    description TEXT NOT NULL,
    amount INTEGER NOT NULL,
    category_id INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    external_id TEXT,
    transfer_id INTEGER,
    import_id INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (account_id) REFERENCES accounts(id),
    FOREIGN KEY (category_id) REFERENCES categories(id),
    FOREIGN KEY (import_id) REFERENCES imports(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_external_id
    ON transactions (account_id, external_id) WHERE external_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_transactions_fallback
    ON transactions (account_id, date, amount);

CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    match_type TEXT,
    match_value TEXT,
    category_id INTEGER NOT NULL,
    priority INTEGER DEFAULT 0,
    hit_count INTEGER DEFAULT 0,
    is_active INTEGER DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (category_id) REFERENCES categories(id)
);

CREATE TABLE IF NOT EXISTS rule_conditions (
    id INTEGER PRIMARY KEY,
    rule_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    match_type TEXT NOT NULL,
    match_value TEXT NOT NULL,
    FOREIGN KEY (rule_id) REFERENCES rules(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS bank_connections (
    id INTEGER PRIMARY KEY,
    scraper_slug TEXT NOT NULL,
    name TEXT NOT NULL UNIQUE,
    credentials TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'idle',
    date_format TEXT NOT NULL DEFAULT 'MM/DD/YYYY',
    accounts_map TEXT NOT NULL DEFAULT '{}',
    metadata TEXT NOT NULL DEFAULT '{}',
    frequency TEXT NOT NULL DEFAULT 'manual',
    preferred_time TEXT,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    last_run_at TEXT,
    last_error TEXT,
    locked_at TEXT,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY,
    connection_id INTEGER NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    inserts INTEGER NOT NULL DEFAULT 0,
    duplicates INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    categorized INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    FOREIGN KEY (connection_id) REFERENCES bank_connections(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_audit_log_connection
    ON audit_log (connection_id, start_time);
";

// (name, category_type)
const DEFAULT_CATEGORIES: &[(&str, &str)] = &[
    ("Salary", "income"),
    ("Interest", "income"),
    ("Refunds", "income"),
    ("Other Income", "income"),
    ("Groceries", "expense"),
    ("Dining Out", "expense"),
    ("Transport", "expense"),
    ("Fuel", "expense"),
    ("Utilities", "expense"),
    ("Rent / Mortgage", "expense"),
    ("Insurance", "expense"),
    ("Health", "expense"),
    ("Shopping", "expense"),
    ("Entertainment", "expense"),
    ("Subscriptions", "expense"),
    ("Travel", "expense"),
    ("Education", "expense"),
    ("Bank Fees", "expense"),
    ("Gifts & Donations", "expense"),
    ("Transfer", "transfer"),
];

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    if let Ok(key) = std::env::var(DB_KEY_ENV) {
        let key = Zeroizing::new(key);
        if !key.is_empty() {
            conn.pragma_update(None, "key", key.as_str())?;
        }
    }
    conn.busy_timeout(Duration::from_secs(10))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let count: i64 = conn.query_row("SELECT count(*) FROM categories", [], |row| row.get(0))?;
    if count == 0 {
        for (name, category_type) in DEFAULT_CATEGORIES {
            conn.execute(
                "INSERT INTO categories (name, category_type) VALUES (?1, ?2)",
                rusqlite::params![name, category_type],
            )?;
        }
    }
    Ok(())
}

pub fn category_id(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM categories WHERE name = ?1 COLLATE NOCASE",
        [name],
        |row| row.get(0),
    )
    .map_err(|_| SyncError::UnknownCategory(name.to_string()))
}

pub fn account_id(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row("SELECT id FROM accounts WHERE name = ?1", [name], |row| row.get(0))
        .map_err(|_| SyncError::UnknownAccount(name.to_string()))
}

// ---------------------------------------------------------------------------
// Column encoding
// ---------------------------------------------------------------------------

/// Exact conversion to minor units. Fractions of a cent are an error, never
/// rounded.
pub fn amount_to_cents(amount: Decimal) -> Result<i64> {
    if amount.round_dp(2) != amount {
        return Err(SyncError::Parse(format!("amount {amount} has fractions of a cent")));
    }
    let mut scaled = amount;
    scaled.rescale(2);
    i64::try_from(scaled.mantissa())
        .map_err(|_| SyncError::Other(format!("amount out of range: {amount}")))
}

pub fn cents_to_amount(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Fixed-width UTC timestamps so text order is time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(SyncError::Other(message)),
    )
}

/// Read a text column through `FromStr`, for enum-valued columns.
pub fn parse_column<T: FromStr>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|_| conversion_error(idx, format!("unexpected value '{raw}'")))
}

pub fn date_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| conversion_error(idx, format!("bad date '{raw}': {e}")))
}

pub fn timestamp_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, format!("bad timestamp '{s}': {e}")))
    })
    .transpose()
}

/// Read a JSON text column into a typed value.
pub fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, format!("bad JSON: {e}")))
}
