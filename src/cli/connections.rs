use std::io::BufRead;
use std::path::PathBuf;

use colored::Colorize;
use comfy_table::{Cell, Table};
use zeroize::Zeroizing;

use crate::connections::{
    add_connection, find_connection, list_connections, parse_time, parse_timezone,
    remove_connection, set_mappings, set_schedule, unmap as unmap_remote, update_settings,
    NewConnection,
};
use crate::db::account_id;
use crate::error::{Result, SyncError};
use crate::fmt::when;
use crate::models::{AdapterSettings, BankConnection, ConnectionStatus, Credentials, DateFormat, Frequency};
use crate::resolver::suggest_mappings;
use crate::scrapers::{get_by_slug, AdapterRegistry, BuiltinAdapters, ScraperKind};
use crate::sync::Orchestrator;

use super::{open_db, runtime};

pub struct AddArgs {
    pub name: String,
    pub scraper: String,
    pub username: String,
    pub password_stdin: bool,
    pub date_format: String,
    pub track_offset: bool,
    pub only: Vec<String>,
    pub fixture: Option<String>,
}

fn read_secret(prompt: &str, from_stdin: bool) -> Result<Zeroizing<String>> {
    if from_stdin {
        let mut line = Zeroizing::new(String::new());
        std::io::stdin().lock().read_line(&mut line)?;
        let trimmed = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
        return Ok(trimmed);
    }
    Ok(Zeroizing::new(rpassword::prompt_password(prompt)?))
}

pub(crate) fn status_label(status: ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Idle => "idle".green().to_string(),
        ConnectionStatus::Running => "running".yellow().to_string(),
        ConnectionStatus::Error => "error".red().to_string(),
    }
}

fn schedule_label(c: &BankConnection) -> String {
    match (c.frequency, c.preferred_time) {
        (Frequency::Manual, _) => "manual".to_string(),
        (f, Some(t)) => format!("{f} at {} {}", t.format("%H:%M"), c.timezone.name()),
        (f, None) => format!("{f} ({})", c.timezone.name()),
    }
}

pub fn add(args: AddArgs) -> Result<()> {
    let (settings, conn) = open_db()?;
    let kind = get_by_slug(&args.scraper).ok_or_else(|| SyncError::UnknownScraper(args.scraper.clone()))?;
    let adapter = BuiltinAdapters::from_settings(&settings).adapter(kind.slug())?;
    let date_format: DateFormat = args.date_format.parse()?;

    let (password, security_pin) = if kind == ScraperKind::Fixture {
        (Zeroizing::new(String::new()), None)
    } else {
        let password = read_secret("Password: ", args.password_stdin)?;
        let pin = if adapter.requires_security_pin() {
            Some(read_secret("Security number: ", args.password_stdin)?)
        } else {
            None
        };
        (password, pin)
    };
    let credentials = Credentials {
        username: args.username,
        password: password.to_string(),
        security_pin: security_pin.map(|p| p.to_string()),
    };
    let adapter_settings = AdapterSettings {
        track_offset_accounts: args.track_offset,
        account_filter: args.only,
        fixture_path: args.fixture.map(|p| PathBuf::from(crate::settings::shellexpand_path(&p))),
    };

    add_connection(
        &conn,
        &NewConnection {
            name: &args.name,
            scraper_slug: kind.slug(),
            credentials: &credentials,
            date_format,
            settings: &adapter_settings,
        },
    )?;
    println!("Added connection: {} ({})", args.name, kind.name());
    println!("Next: `ledgersync connections test \"{}\" --bind` to map accounts.", args.name);
    Ok(())
}

pub fn list() -> Result<()> {
    let (_, conn) = open_db()?;
    let connections = list_connections(&conn)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Scraper", "Status", "Schedule", "Last run", "Mapped"]);
    for c in &connections {
        table.add_row(vec![
            Cell::new(c.id),
            Cell::new(&c.name),
            Cell::new(&c.scraper_slug),
            Cell::new(status_label(c.status)),
            Cell::new(schedule_label(c)),
            Cell::new(when(c.last_run_at)),
            Cell::new(c.accounts_map.len()),
        ]);
    }
    println!("Connections\n{table}");
    Ok(())
}

pub fn show(name: &str) -> Result<()> {
    let (_, conn) = open_db()?;
    let c = find_connection(&conn, name)?;
    let scraper = get_by_slug(&c.scraper_slug).map_or(c.scraper_slug.as_str(), |k| k.name());

    println!("Name:         {}", c.name);
    println!("Scraper:      {scraper}");
    println!("Username:     {}", c.credentials.username);
    println!("Status:       {}", status_label(c.status));
    println!("Schedule:     {}", schedule_label(&c));
    println!("Date format:  {}", c.date_format);
    println!("Last run:     {}", when(c.last_run_at));
    if let Some(err) = &c.last_error {
        println!("Last error:   {}", err.red());
    }
    if c.metadata.track_offset_accounts {
        println!("Offset accounts are synced.");
    }
    if !c.metadata.account_filter.is_empty() {
        println!("Only:         {}", c.metadata.account_filter.join(", "));
    }

    let mut table = Table::new();
    table.set_header(vec!["Remote account", "Local account"]);
    for (remote, local_id) in &c.accounts_map {
        let local: String = conn
            .query_row("SELECT name FROM accounts WHERE id = ?1", [local_id], |r| r.get(0))
            .unwrap_or_else(|_| format!("(missing #{local_id})"));
        table.add_row(vec![Cell::new(remote), Cell::new(local)]);
    }
    println!("\nMappings\n{table}");
    Ok(())
}

pub fn map(connection: &str, remote: &str, account: &str) -> Result<()> {
    let (_, conn) = open_db()?;
    let c = find_connection(&conn, connection)?;
    let local = account_id(&conn, account)?;
    set_mappings(&conn, c.id, &[(remote.to_string(), local)])?;
    println!("Mapped '{remote}' \u{2192} {account}");
    Ok(())
}

pub fn unmap(connection: &str, remote: &str) -> Result<()> {
    let (_, conn) = open_db()?;
    let c = find_connection(&conn, connection)?;
    if unmap_remote(&conn, c.id, remote)? {
        println!("Unmapped '{remote}'");
        Ok(())
    } else {
        Err(SyncError::Other(format!("'{remote}' is not mapped on {}", c.name)))
    }
}

pub fn schedule(connection: &str, frequency: &str, at: Option<&str>, timezone: &str) -> Result<()> {
    let (_, conn) = open_db()?;
    let c = find_connection(&conn, connection)?;
    let frequency: Frequency = frequency.parse()?;
    let preferred_time = at.map(parse_time).transpose()?;
    let tz = parse_timezone(timezone)?;
    set_schedule(&conn, c.id, frequency, preferred_time, tz)?;
    let updated = find_connection(&conn, connection)?;
    println!("{}: {}", updated.name, schedule_label(&updated));
    Ok(())
}

pub fn configure(
    connection: &str,
    track_offset: Option<bool>,
    only: Vec<String>,
    all_accounts: bool,
    fixture: Option<String>,
) -> Result<()> {
    let (_, conn) = open_db()?;
    let c = find_connection(&conn, connection)?;
    let mut settings = c.metadata.clone();
    if let Some(track) = track_offset {
        settings.track_offset_accounts = track;
    }
    if all_accounts {
        settings.account_filter.clear();
    } else if !only.is_empty() {
        settings.account_filter = only;
    }
    if let Some(path) = fixture {
        settings.fixture_path = Some(PathBuf::from(crate::settings::shellexpand_path(&path)));
    }
    update_settings(&conn, c.id, &settings)?;
    println!("Updated {}", c.name);
    Ok(())
}

pub fn remove(connection: &str) -> Result<()> {
    let (_, conn) = open_db()?;
    let c = find_connection(&conn, connection)?;
    remove_connection(&conn, c.id)?;
    println!("Removed connection {}", c.name);
    Ok(())
}

pub fn test(connection: &str, bind: bool) -> anyhow::Result<()> {
    let (settings, conn) = open_db()?;
    let c = find_connection(&conn, connection)?;
    let orchestrator = Orchestrator::from_settings(&settings);
    let identifiers = runtime()?.block_on(orchestrator.test_connection(
        &c.scraper_slug,
        &c.credentials,
        &c.metadata,
    ))?;

    println!("Login OK. {} remote account(s):", identifiers.len());
    for ident in &identifiers {
        let mapped = c.accounts_map.contains_key(ident);
        println!("  {} {ident}", if mapped { "\u{2713}".green() } else { "\u{00b7}".normal() });
    }

    if bind {
        let suggestion = suggest_mappings(&conn, &identifiers, &c.accounts_map)?;
        set_mappings(&conn, c.id, &suggestion.bound)?;
        for (remote, _) in &suggestion.bound {
            println!("Mapped '{remote}' to the local account of the same name");
        }
        for remote in &suggestion.unbound {
            println!(
                "{} '{remote}' has no local account; use `ledgersync connections map`",
                "Unmapped:".yellow()
            );
        }
    }
    Ok(())
}
