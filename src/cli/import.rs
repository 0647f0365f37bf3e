use std::path::PathBuf;

use colored::Colorize;

use crate::error::SyncError;
use crate::importer::get_by_key;
use crate::models::DateFormat;
use crate::sync::{Orchestrator, UploadTarget};

use super::{open_db, runtime};

pub struct ImportArgs {
    pub file: String,
    pub format: Option<String>,
    pub date_format: String,
    pub account: Option<String>,
    pub create_accounts: bool,
    pub force: bool,
}

pub fn run(args: ImportArgs) -> anyhow::Result<()> {
    let file_path = PathBuf::from(&args.file);
    let format_key = match &args.format {
        Some(f) => f.clone(),
        None => file_path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .ok_or_else(|| SyncError::Config("cannot tell the format; pass --format".into()))?,
    };
    let format = get_by_key(&format_key)
        .filter(|f| f.is_upload_format())
        .ok_or_else(|| SyncError::Config(format!("unsupported import format '{format_key}'")))?;
    let hint: DateFormat = args.date_format.parse()?;

    let (settings, conn) = open_db()?;
    drop(conn);
    let bytes = std::fs::read(&file_path)?;
    let filename = file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| args.file.clone());

    let target = UploadTarget {
        account: args.account,
        create_accounts: args.create_accounts,
        force: args.force,
    };
    let orchestrator = Orchestrator::from_settings(&settings);
    let report = runtime()?.block_on(orchestrator.upload_file(bytes, filename, format, hint, target))?;

    if report.duplicate_file {
        println!("This file has already been imported (duplicate checksum). Use --force to re-import.");
        return Ok(());
    }

    for account in &report.accounts {
        println!(
            "{}: {} imported, {} skipped (duplicates)",
            account.account, account.inserted, account.skipped
        );
    }
    if report.accounts.is_empty() {
        println!("Nothing imported.");
    } else if report.accounts.len() > 1 {
        println!("Total: {} imported, {} skipped", report.inserted(), report.duplicates());
    }
    for (remote, count) in &report.unmapped {
        let label = if remote.is_empty() { "(no account in file)" } else { remote.as_str() };
        println!(
            "{} {count} record(s) for {label}: no local account. Use --account or --create-accounts.",
            "Unmapped:".yellow()
        );
    }
    for warning in &report.warnings {
        println!("{} {warning}", "Skipped:".yellow());
    }
    println!("{} categorized", report.categorized);
    Ok(())
}
