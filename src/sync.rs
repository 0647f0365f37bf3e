use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use rusqlite::Connection;

use crate::audit::{finalize_entry, get_entry, open_entry, RunCounts};
use crate::categorizer::{classify, Scope};
use crate::connections::get_connection_by_id;
use crate::db::{account_id, format_date, get_connection};
use crate::error::{Result, SyncError};
use crate::importer::scraped::{parse_value, ScrapeOptions};
use crate::importer::{self, compute_checksum, FormatKind};
use crate::models::{AdapterSettings, AuditLogEntry, BankConnection, Credentials, DateFormat};
use crate::reconciler::{reconcile_batch, reconcile_groups, ReconcileResult};
use crate::resolver::{assign_accounts, discovered_accounts, resolve, resolve_or_create, ResolvePolicy};
use crate::scheduler::{acquire_run_lock, lock_lease, release_run_lock};
use crate::scrapers::{get_by_slug, AdapterRegistry, BuiltinAdapters};
use crate::settings::Settings;

/// Runs sync jobs and file uploads against one database.
pub struct Orchestrator {
    db_path: PathBuf,
    adapter_timeout: Duration,
    lock_lease: Duration,
    adapters: Arc<dyn AdapterRegistry>,
}

#[derive(Debug, Default)]
pub struct UploadTarget {
    /// Put every record in this local account, ignoring the file's own.
    pub account: Option<String>,
    /// Create local accounts for unknown identifiers in the file.
    pub create_accounts: bool,
    /// Import even when the same file was imported before.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountUpload {
    pub account: String,
    pub inserted: usize,
    /// Records already in the ledger.
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct UploadReport {
    pub accounts: Vec<AccountUpload>,
    pub duplicate_file: bool,
    pub warnings: Vec<String>,
    /// File account identifier → records left out for lack of a local account.
    pub unmapped: BTreeMap<String, usize>,
    pub categorized: usize,
}

impl UploadReport {
    pub fn inserted(&self) -> usize {
        self.accounts.iter().map(|a| a.inserted).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.accounts.iter().map(|a| a.skipped).sum()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Orchestrator {
    pub fn new(db_path: PathBuf, adapter_timeout: Duration, adapters: Arc<dyn AdapterRegistry>) -> Self {
        Self {
            db_path,
            adapter_timeout,
            lock_lease: lock_lease(adapter_timeout),
            adapters,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.db_path(),
            settings.adapter_timeout(),
            Arc::new(BuiltinAdapters::from_settings(settings)),
        )
    }

    /// Run storage work on the blocking pool with its own connection.
    pub async fn db<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = get_connection(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| SyncError::Other(format!("storage task failed: {e}")))?
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.adapter_timeout, call)
            .await
            .map_err(|_| SyncError::AdapterTimeout(self.adapter_timeout))?
    }

    /// One full sync of a connection. `AlreadyRunning` comes back untouched;
    /// every failure after the lock is taken ends as a failed audit entry and
    /// an `error` status, with the lock released.
    pub async fn run_sync(&self, connection_id: i64) -> Result<AuditLogEntry> {
        let lease = self.lock_lease;
        let (connection, audit_id) = self
            .db(move |conn| {
                let now = Utc::now();
                acquire_run_lock(conn, connection_id, now, lease)?;
                let started = get_connection_by_id(conn, connection_id)
                    .and_then(|c| Ok((c, open_entry(conn, connection_id, now)?)));
                if let Err(e) = &started {
                    release_run_lock(conn, connection_id, Some(&e.to_string()), now)?;
                }
                started
            })
            .await?;

        tracing::info!(
            connection_id,
            audit_id,
            connection = %connection.name,
            scraper = %connection.scraper_slug,
            "Sync started"
        );

        let mut counts = RunCounts::default();
        let outcome = AssertUnwindSafe(self.execute(&connection, &mut counts))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(format!("sync panicked: {}", panic_message(panic.as_ref()))),
        };

        match &error {
            None => tracing::info!(
                connection_id,
                audit_id,
                inserted = counts.inserts,
                duplicates = counts.duplicates,
                skipped = counts.skipped,
                categorized = counts.categorized,
                "Sync finished"
            ),
            Some(message) => tracing::error!(connection_id, audit_id, error = %message, "Sync failed"),
        }

        self.db(move |conn| {
            let now = Utc::now();
            let finalized = finalize_entry(conn, audit_id, now, &counts, error.as_deref());
            let released = release_run_lock(conn, connection_id, error.as_deref(), now);
            finalized?;
            released?;
            get_entry(conn, audit_id)
        })
        .await
    }

    async fn execute(&self, connection: &BankConnection, counts: &mut RunCounts) -> Result<()> {
        let adapter = self.adapters.adapter(&connection.scraper_slug)?;
        let raw = self
            .bounded(adapter.fetch_transactions(&connection.credentials, &connection.metadata))
            .await?;

        let options = ScrapeOptions {
            hint: connection.date_format,
            include_offset_accounts: connection.metadata.track_offset_accounts,
        };
        let parsed = parse_value(&raw, &options)?.ensure_usable(&FormatKind::Scraped)?;
        counts.skipped += parsed.warnings.len();

        let assignment = assign_accounts(parsed.records, |remote| {
            resolve(&connection.accounts_map, remote)
        })?;
        counts.skipped += assignment.skipped();

        let groups = assignment.groups;
        let total = self
            .db(move |conn| {
                let mut total = ReconcileResult::default();
                for (_, result) in reconcile_batch(conn, &groups, None)? {
                    total.merge(result);
                }
                Ok(total)
            })
            .await?;
        counts.inserts = total.inserted;
        counts.duplicates = total.duplicates;

        let inserted_ids = total.inserted_ids;
        counts.categorized = self
            .db(move |conn| Ok(classify(conn, Scope::Ids(&inserted_ids))?.categorized))
            .await?;
        Ok(())
    }

    /// Log in without persisting anything and list the remote account
    /// identifiers the connection would see.
    pub async fn test_connection(
        &self,
        slug: &str,
        credentials: &Credentials,
        settings: &AdapterSettings,
    ) -> Result<Vec<String>> {
        if let Some(kind) = get_by_slug(slug) {
            kind.validate_credentials(credentials)?;
            kind.validate_settings(settings)?;
        }
        let adapter = self.adapters.adapter(slug)?;
        let outcome = self.bounded(adapter.test_login(credentials, settings)).await?;
        if !outcome.ok {
            return Err(SyncError::AdapterAuth(
                outcome.message.unwrap_or_else(|| "login rejected".to_string()),
            ));
        }
        Ok(discovered_accounts(&outcome.accounts))
    }

    pub async fn upload_file(
        &self,
        bytes: Vec<u8>,
        filename: String,
        format: FormatKind,
        hint: DateFormat,
        target: UploadTarget,
    ) -> Result<UploadReport> {
        if !format.is_upload_format() {
            return Err(SyncError::Config(format!("{} files cannot be uploaded", format.key())));
        }
        self.db(move |conn| ingest_file(conn, &bytes, &filename, format, hint, &target))
            .await
    }
}

fn ingest_file(
    conn: &Connection,
    bytes: &[u8],
    filename: &str,
    format: FormatKind,
    hint: DateFormat,
    target: &UploadTarget,
) -> Result<UploadReport> {
    let checksum = compute_checksum(bytes);
    let parsed = importer::parse(bytes, format, hint)?;

    let tx = conn.unchecked_transaction()?;
    let assignment = match &target.account {
        Some(name) => {
            let id = account_id(&tx, name)?;
            assign_accounts(parsed.records, |_| Ok(id))?
        }
        None => {
            let policy = if target.create_accounts {
                ResolvePolicy::AutoCreate
            } else {
                ResolvePolicy::Require
            };
            assign_accounts(parsed.records, |remote| resolve_or_create(&tx, remote, policy))?
        }
    };

    // A file counts as imported per account, and only once some of its
    // records landed there.
    if !target.force && !assignment.groups.is_empty() {
        let mut seen = tx.prepare("SELECT 1 FROM imports WHERE checksum = ?1 AND account_id = ?2")?;
        let mut all_seen = true;
        for (account_id, _) in &assignment.groups {
            all_seen &= seen.exists(rusqlite::params![checksum, account_id])?;
        }
        if all_seen {
            tracing::info!(file = %filename, "File already imported");
            return Ok(UploadReport {
                duplicate_file: true,
                ..Default::default()
            });
        }
    }

    let mut results = Vec::with_capacity(assignment.groups.len());
    for group in &assignment.groups {
        let (account_id, records) = group;
        let date_range_start = records.iter().map(|r| r.date).min().map(format_date);
        let date_range_end = records.iter().map(|r| r.date).max().map(format_date);
        tx.execute(
            "INSERT INTO imports (filename, format, record_count, date_range_start, date_range_end, checksum, account_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                filename,
                format.key(),
                records.len() as i64,
                date_range_start,
                date_range_end,
                checksum,
                account_id
            ],
        )?;
        let import_id = tx.last_insert_rowid();
        results.extend(reconcile_groups(&tx, std::slice::from_ref(group), Some(import_id))?);
    }
    tx.commit()?;

    let inserted_ids: Vec<i64> = results
        .iter()
        .flat_map(|(_, r)| r.inserted_ids.iter().copied())
        .collect();
    let categorized = classify(conn, Scope::Ids(&inserted_ids))?.categorized;

    let mut accounts = Vec::with_capacity(results.len());
    for (account_id, result) in results {
        let name: String =
            conn.query_row("SELECT name FROM accounts WHERE id = ?1", [account_id], |row| row.get(0))?;
        accounts.push(AccountUpload {
            account: name,
            inserted: result.inserted,
            skipped: result.duplicates,
        });
    }

    tracing::info!(
        file = %filename,
        accounts = accounts.len(),
        inserted = accounts.iter().map(|a| a.inserted).sum::<usize>(),
        unmapped = assignment.skipped(),
        "File imported"
    );
    Ok(UploadReport {
        accounts,
        duplicate_file: false,
        warnings: parsed.warnings,
        unmapped: assignment.unmapped,
        categorized,
    })
}
