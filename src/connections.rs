use chrono::NaiveTime;
use chrono_tz::Tz;
use rusqlite::{Connection, OptionalExtension};
use zeroize::Zeroizing;

use crate::db::{json_column, parse_column, timestamp_column};
use crate::error::{Result, SyncError};
use crate::models::{
    AccountsMap, AdapterSettings, BankConnection, Credentials, DateFormat, Frequency,
};
use crate::scrapers::get_by_slug;

const TIME_FORMAT: &str = "%H:%M";

const CONNECTION_COLUMNS: &str = "id, scraper_slug, name, credentials, status, date_format, \
     accounts_map, metadata, frequency, preferred_time, timezone, last_run_at, last_error, locked_at";

pub struct NewConnection<'a> {
    pub name: &'a str,
    pub scraper_slug: &'a str,
    pub credentials: &'a Credentials,
    pub date_format: DateFormat,
    pub settings: &'a AdapterSettings,
}

pub fn parse_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), TIME_FORMAT)
        .map_err(|_| SyncError::Config(format!("invalid time '{raw}', expected HH:MM")))
}

pub fn parse_timezone(raw: &str) -> Result<Tz> {
    raw.trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("unknown timezone '{raw}'")))
}

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<BankConnection> {
    let raw_credentials: Zeroizing<String> = Zeroizing::new(row.get(3)?);
    let credentials: Credentials = serde_json::from_str(&raw_credentials).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let preferred_time: Option<String> = row.get(9)?;
    let preferred_time = preferred_time
        .map(|t| {
            NaiveTime::parse_from_str(&t, TIME_FORMAT).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
            })
        })
        .transpose()?;

    Ok(BankConnection {
        id: row.get(0)?,
        scraper_slug: row.get(1)?,
        name: row.get(2)?,
        credentials,
        status: parse_column(row, 4)?,
        date_format: parse_column(row, 5)?,
        accounts_map: json_column(row, 6)?,
        metadata: json_column(row, 7)?,
        frequency: parse_column(row, 8)?,
        preferred_time,
        timezone: parse_column(row, 10)?,
        last_run_at: timestamp_column(row, 11)?,
        last_error: row.get(12)?,
        locked_at: timestamp_column(row, 13)?,
    })
}

/// Validate and store a new connection. Credentials are stored as given;
/// encryption at rest comes from the database key.
pub fn add_connection(conn: &Connection, new: &NewConnection<'_>) -> Result<i64> {
    let kind = get_by_slug(new.scraper_slug)
        .ok_or_else(|| SyncError::UnknownScraper(new.scraper_slug.to_string()))?;
    kind.validate_credentials(new.credentials)?;
    kind.validate_settings(new.settings)?;
    if new.name.trim().is_empty() {
        return Err(SyncError::Config("connection name is empty".into()));
    }

    let credentials = Zeroizing::new(serde_json::to_string(new.credentials)?);
    let metadata = serde_json::to_string(new.settings)?;
    conn.execute(
        "INSERT INTO bank_connections (scraper_slug, name, credentials, date_format, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            kind.slug(),
            new.name.trim(),
            credentials.as_str(),
            new.date_format.as_str(),
            metadata
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            SyncError::Config(format!("a connection named '{}' already exists", new.name.trim()))
        }
        e => SyncError::Db(e),
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn get_connection_by_id(conn: &Connection, id: i64) -> Result<BankConnection> {
    conn.query_row(
        &format!("SELECT {CONNECTION_COLUMNS} FROM bank_connections WHERE id = ?1"),
        [id],
        row_to_connection,
    )
    .optional()?
    .ok_or_else(|| SyncError::UnknownConnection(id.to_string()))
}

pub fn get_connection_by_name(conn: &Connection, name: &str) -> Result<BankConnection> {
    conn.query_row(
        &format!("SELECT {CONNECTION_COLUMNS} FROM bank_connections WHERE name = ?1 COLLATE NOCASE"),
        [name.trim()],
        row_to_connection,
    )
    .optional()?
    .ok_or_else(|| SyncError::UnknownConnection(name.to_string()))
}

/// Look up by name, falling back to a numeric id.
pub fn find_connection(conn: &Connection, name_or_id: &str) -> Result<BankConnection> {
    match get_connection_by_name(conn, name_or_id) {
        Err(SyncError::UnknownConnection(_)) => match name_or_id.trim().parse::<i64>() {
            Ok(id) => get_connection_by_id(conn, id)
                .map_err(|_| SyncError::UnknownConnection(name_or_id.to_string())),
            Err(_) => Err(SyncError::UnknownConnection(name_or_id.to_string())),
        },
        other => other,
    }
}

pub fn list_connections(conn: &Connection) -> Result<Vec<BankConnection>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM bank_connections ORDER BY name"
    ))?;
    let rows = stmt
        .query_map([], row_to_connection)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn save_accounts_map(conn: &Connection, id: i64, map: &AccountsMap) -> Result<()> {
    let changed = conn.execute(
        "UPDATE bank_connections SET accounts_map = ?1 WHERE id = ?2",
        rusqlite::params![serde_json::to_string(map)?, id],
    )?;
    if changed == 0 {
        return Err(SyncError::UnknownConnection(id.to_string()));
    }
    Ok(())
}

/// Bind remote identifiers to local accounts, replacing earlier bindings
/// for the same identifiers.
pub fn set_mappings(conn: &Connection, id: i64, bindings: &[(String, i64)]) -> Result<()> {
    let mut map = get_connection_by_id(conn, id)?.accounts_map;
    for (remote, account_id) in bindings {
        let exists: bool = conn
            .prepare_cached("SELECT 1 FROM accounts WHERE id = ?1")?
            .exists([account_id])?;
        if !exists {
            return Err(SyncError::UnknownAccount(account_id.to_string()));
        }
        map.insert(remote.clone(), *account_id);
    }
    save_accounts_map(conn, id, &map)
}

/// Returns false when `remote` was not mapped.
pub fn unmap(conn: &Connection, id: i64, remote: &str) -> Result<bool> {
    let mut map = get_connection_by_id(conn, id)?.accounts_map;
    let removed = map.remove(remote).is_some();
    if removed {
        save_accounts_map(conn, id, &map)?;
    }
    Ok(removed)
}

pub fn set_schedule(
    conn: &Connection,
    id: i64,
    frequency: Frequency,
    preferred_time: Option<NaiveTime>,
    timezone: Tz,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE bank_connections SET frequency = ?1, preferred_time = ?2, timezone = ?3 WHERE id = ?4",
        rusqlite::params![
            frequency.as_str(),
            preferred_time.map(|t| t.format(TIME_FORMAT).to_string()),
            timezone.name(),
            id
        ],
    )?;
    if changed == 0 {
        return Err(SyncError::UnknownConnection(id.to_string()));
    }
    Ok(())
}

pub fn update_settings(conn: &Connection, id: i64, settings: &AdapterSettings) -> Result<()> {
    let existing = get_connection_by_id(conn, id)?;
    if let Some(kind) = get_by_slug(&existing.scraper_slug) {
        kind.validate_settings(settings)?;
    }
    conn.execute(
        "UPDATE bank_connections SET metadata = ?1 WHERE id = ?2",
        rusqlite::params![serde_json::to_string(settings)?, id],
    )?;
    Ok(())
}

/// Deletes the connection and its audit history. Refused while a run holds
/// the lock.
pub fn remove_connection(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn.execute(
        "DELETE FROM bank_connections WHERE id = ?1 AND status <> 'running'",
        [id],
    )?;
    if changed == 0 {
        // Distinguish a missing row from a running one.
        get_connection_by_id(conn, id)?;
        return Err(SyncError::AlreadyRunning(id));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::{add_account, test_db};
    use crate::models::ConnectionStatus;

    pub(crate) fn add_fixture_connection(conn: &Connection, name: &str) -> i64 {
        let credentials = Credentials {
            username: "user".into(),
            password: "pw".into(),
            security_pin: None,
        };
        let settings = AdapterSettings {
            fixture_path: Some("/dev/null".into()),
            ..Default::default()
        };
        add_connection(
            conn,
            &NewConnection {
                name,
                scraper_slug: "fixture",
                credentials: &credentials,
                date_format: DateFormat::Ymd,
                settings: &settings,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_add_and_load_round_trip() {
        let (_dir, conn) = test_db();
        let id = add_fixture_connection(&conn, "Everyday Bank");
        let loaded = get_connection_by_id(&conn, id).unwrap();
        assert_eq!(loaded.name, "Everyday Bank");
        assert_eq!(loaded.scraper_slug, "fixture");
        assert_eq!(loaded.status, ConnectionStatus::Idle);
        assert_eq!(loaded.frequency, Frequency::Manual);
        assert_eq!(loaded.timezone, chrono_tz::UTC);
        assert_eq!(loaded.date_format, DateFormat::Ymd);
        assert_eq!(loaded.credentials.password, "pw");
        assert!(loaded.accounts_map.is_empty());
        assert!(loaded.last_run_at.is_none());

        assert_eq!(find_connection(&conn, "everyday bank").unwrap().id, id);
        assert_eq!(find_connection(&conn, &id.to_string()).unwrap().id, id);
        assert!(matches!(
            find_connection(&conn, "nope"),
            Err(SyncError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_add_rejects_bad_input() {
        let (_dir, conn) = test_db();
        let credentials = Credentials {
            username: "user".into(),
            password: "pw".into(),
            security_pin: None,
        };
        let settings = AdapterSettings::default();
        let mut new = NewConnection {
            name: "Bank",
            scraper_slug: "monzo",
            credentials: &credentials,
            date_format: DateFormat::Dmy,
            settings: &settings,
        };
        assert!(matches!(add_connection(&conn, &new), Err(SyncError::UnknownScraper(_))));
        new.scraper_slug = "stgeorge";
        assert!(matches!(add_connection(&conn, &new), Err(SyncError::Config(_))));
        new.scraper_slug = "anz";
        add_connection(&conn, &new).unwrap();
        assert!(matches!(add_connection(&conn, &new), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_mapping_edits() {
        let (_dir, conn) = test_db();
        let id = add_fixture_connection(&conn, "Bank");
        let checking = add_account(&conn, "Checking");
        set_mappings(&conn, id, &[("Everyday".into(), checking)]).unwrap();
        assert_eq!(get_connection_by_id(&conn, id).unwrap().accounts_map["Everyday"], checking);
        assert!(matches!(
            set_mappings(&conn, id, &[("Saver".into(), 999)]),
            Err(SyncError::UnknownAccount(_))
        ));
        assert!(unmap(&conn, id, "Everyday").unwrap());
        assert!(!unmap(&conn, id, "Everyday").unwrap());
        assert!(get_connection_by_id(&conn, id).unwrap().accounts_map.is_empty());
    }

    #[test]
    fn test_schedule_round_trip() {
        let (_dir, conn) = test_db();
        let id = add_fixture_connection(&conn, "Bank");
        let tz = parse_timezone("Australia/Sydney").unwrap();
        set_schedule(&conn, id, Frequency::Weekly, Some(parse_time("06:30").unwrap()), tz).unwrap();
        let loaded = get_connection_by_id(&conn, id).unwrap();
        assert_eq!(loaded.frequency, Frequency::Weekly);
        assert_eq!(loaded.preferred_time, NaiveTime::from_hms_opt(6, 30, 0));
        assert_eq!(loaded.timezone, chrono_tz::Australia::Sydney);
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert!(parse_time("25:00").is_err());
    }

    #[test]
    fn test_update_settings_validates_variant() {
        let (_dir, conn) = test_db();
        let id = add_fixture_connection(&conn, "Bank");
        assert!(update_settings(&conn, id, &AdapterSettings::default()).is_err());
        let settings = AdapterSettings {
            fixture_path: Some("/tmp/other.json".into()),
            track_offset_accounts: true,
            ..Default::default()
        };
        update_settings(&conn, id, &settings).unwrap();
        assert_eq!(get_connection_by_id(&conn, id).unwrap().metadata, settings);
    }

    #[test]
    fn test_remove_refused_while_running() {
        let (_dir, conn) = test_db();
        let id = add_fixture_connection(&conn, "Bank");
        conn.execute("UPDATE bank_connections SET status = 'running' WHERE id = ?1", [id])
            .unwrap();
        assert!(matches!(remove_connection(&conn, id), Err(SyncError::AlreadyRunning(_))));
        conn.execute("UPDATE bank_connections SET status = 'idle' WHERE id = ?1", [id])
            .unwrap();
        remove_connection(&conn, id).unwrap();
        assert!(matches!(remove_connection(&conn, id), Err(SyncError::UnknownConnection(_))));
    }
}
