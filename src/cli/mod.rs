pub mod accounts;
pub mod audit;
pub mod backup;
pub mod categorize;
pub mod connections;
pub mod import;
pub mod init;
pub mod rules;
pub mod schedule;
pub mod status;
pub mod sync;
pub mod transactions;

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::db::get_connection;
use crate::error::{Result, SyncError};
use crate::settings::{load_settings, Settings};

/// Load settings and open the ledger, which must already exist.
pub(crate) fn open_db() -> Result<(Settings, Connection)> {
    let settings = load_settings();
    let path = settings.db_path();
    if !path.exists() {
        return Err(SyncError::Config(format!(
            "no database at {}; run `ledgersync init` first",
            path.display()
        )));
    }
    let conn = get_connection(&path)?;
    Ok((settings, conn))
}

pub(crate) fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    use anyhow::Context;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

#[derive(Parser)]
#[command(
    name = "ledgersync",
    version,
    about = "Sync bank transactions into a deduplicated, categorized ledger."
)]
pub struct Cli {
    /// Show info-level logs for one-shot commands.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for ledger data (default: ~/Documents/ledgersync)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Manage local accounts.
    Accounts {
        #[command(subcommand)]
        command: AccountsCommands,
    },
    /// Manage bank connections.
    Connections {
        #[command(subcommand)]
        command: ConnectionsCommands,
    },
    /// Run a sync now.
    Sync {
        /// Connection name or id
        #[arg(required_unless_present = "all")]
        connection: Option<String>,
        /// Sync every connection in turn
        #[arg(long, conflicts_with = "connection")]
        all: bool,
    },
    /// Run the scheduler until interrupted.
    Schedule,
    /// Import an OFX or QIF export file.
    Import {
        /// Path to the file
        file: String,
        /// File format: ofx or qif (default: from the file extension)
        #[arg(long)]
        format: Option<String>,
        /// Date order for ambiguous dates: MM/DD/YYYY, DD/MM/YYYY or YYYY-MM-DD
        #[arg(long = "date-format", default_value = "MM/DD/YYYY")]
        date_format: String,
        /// Put every record into this local account
        #[arg(long)]
        account: Option<String>,
        /// Create local accounts for unknown accounts in the file
        #[arg(long = "create-accounts")]
        create_accounts: bool,
        /// Import even if this exact file was imported before
        #[arg(long)]
        force: bool,
    },
    /// Manage categorization rules.
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
    /// Run rules over every uncategorized transaction.
    Categorize,
    /// List recent ledger transactions.
    Transactions {
        /// Only this account
        #[arg(long)]
        account: Option<String>,
        /// Only rows without a category
        #[arg(long)]
        uncategorized: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show the run history of a connection.
    Audit {
        /// Connection name or id
        connection: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show database location and summary counts.
    Status,
    /// Back up the database.
    Backup {
        /// Output path (default: <data_dir>/backups/ledgersync-YYYYMMDD-HHMMSS.db)
        #[arg(long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum AccountsCommands {
    /// Add a local account.
    Add {
        /// Account name, e.g. 'Everyday Checking'
        name: String,
        /// Account type: checking, savings, credit_card, loan, ...
        #[arg(long = "type", default_value = "checking")]
        account_type: String,
        /// Institution name
        #[arg(long)]
        institution: Option<String>,
        /// Account number as the bank reports it
        #[arg(long)]
        number: Option<String>,
    },
    /// List local accounts.
    List,
}

#[derive(Subcommand)]
pub enum ConnectionsCommands {
    /// Add a bank connection. The password is prompted for.
    Add {
        /// Connection name
        name: String,
        /// Scraper slug, e.g. commbank, anz, fixture
        #[arg(long)]
        scraper: String,
        #[arg(long)]
        username: String,
        /// Read the password (and security number, if needed) from stdin lines
        #[arg(long = "password-stdin")]
        password_stdin: bool,
        /// Date order the bank uses
        #[arg(long = "date-format", default_value = "MM/DD/YYYY")]
        date_format: String,
        /// Also sync offset/redraw sub-accounts
        #[arg(long = "track-offset")]
        track_offset: bool,
        /// Only fetch these remote accounts (repeatable)
        #[arg(long = "only")]
        only: Vec<String>,
        /// Batch file replayed by the fixture scraper
        #[arg(long)]
        fixture: Option<String>,
    },
    /// List connections with status and schedule.
    List,
    /// Show one connection, including account mappings.
    Show { connection: String },
    /// Map a remote account identifier to a local account.
    Map {
        connection: String,
        /// Remote identifier, as shown by `connections test`
        remote: String,
        /// Local account name
        account: String,
    },
    /// Remove a remote account mapping.
    Unmap { connection: String, remote: String },
    /// Set the sync cadence.
    Schedule {
        connection: String,
        /// daily, weekly, monthly or manual
        #[arg(long)]
        frequency: String,
        /// Preferred local time, HH:MM
        #[arg(long)]
        at: Option<String>,
        /// IANA timezone, e.g. Australia/Sydney
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
    /// Change adapter settings of an existing connection.
    Configure {
        connection: String,
        /// Sync offset/redraw sub-accounts (true or false)
        #[arg(long = "track-offset")]
        track_offset: Option<bool>,
        /// Replace the remote account filter (repeatable)
        #[arg(long = "only")]
        only: Vec<String>,
        /// Fetch every remote account again
        #[arg(long = "all-accounts", conflicts_with = "only")]
        all_accounts: bool,
        /// Batch file replayed by the fixture scraper
        #[arg(long)]
        fixture: Option<String>,
    },
    /// Delete a connection and its run history.
    Remove { connection: String },
    /// Log in and list the remote accounts the connection can see.
    Test {
        connection: String,
        /// Map identifiers to local accounts with the same name
        #[arg(long)]
        bind: bool,
    },
}

#[derive(Subcommand)]
pub enum RulesCommands {
    /// Add a rule. All conditions must match.
    Add {
        /// Rule name
        name: String,
        /// Category name to assign
        #[arg(long)]
        category: String,
        /// Condition as type:value, e.g. contains:coffee or regex:^AWS (repeatable)
        #[arg(long = "when", required = true)]
        conditions: Vec<String>,
        /// Lower runs first
        #[arg(long, default_value_t = 100)]
        priority: i64,
    },
    /// List active rules in evaluation order.
    List,
    /// Deactivate a rule.
    Delete { id: i64 },
}
