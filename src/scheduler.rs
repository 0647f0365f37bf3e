//! Per-connection run lock, due-time evaluation and the tick loop that
//! dispatches due connections to the orchestrator.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rusqlite::Connection;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audit::fail_open_entries;
use crate::connections::list_connections;
use crate::db::{format_timestamp, timestamp_column};
use crate::error::{Result, SyncError};
use crate::models::{BankConnection, ConnectionStatus, Frequency};
use crate::settings::Settings;
use crate::sync::Orchestrator;

pub const INTERRUPTED: &str = "run interrupted";

// ---------------------------------------------------------------------------
// Run lock
// ---------------------------------------------------------------------------

/// How long a `running` lock may be held before another run can take it
/// over.
pub fn lock_lease(adapter_timeout: Duration) -> Duration {
    adapter_timeout * 2 + Duration::from_secs(300)
}

fn lock_expired(locked_at: Option<DateTime<Utc>>, now: DateTime<Utc>, lease: Duration) -> bool {
    match locked_at {
        Some(at) => now.signed_duration_since(at).to_std().is_ok_and(|age| age > lease),
        None => true,
    }
}

/// Compare-and-set `idle|error -> running`. Lives in the database so every
/// process sharing it sees the same lock. A `running` lock older than
/// `lease` belongs to a run that died, and is taken over: that run's open
/// audit entries are failed.
pub fn acquire_run_lock(
    conn: &Connection,
    connection_id: i64,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<()> {
    let cutoff = chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let changed = conn.execute(
        "UPDATE bank_connections SET status = 'running', locked_at = ?1 \
         WHERE id = ?2 AND (status <> 'running' OR locked_at IS NULL OR locked_at < ?3)",
        rusqlite::params![format_timestamp(now), connection_id, format_timestamp(cutoff)],
    )?;
    if changed == 1 {
        // Entries are opened only under the lock, so any still open here
        // were left by a dead run.
        let abandoned = fail_open_entries(conn, connection_id, INTERRUPTED, now)?;
        if abandoned > 0 {
            tracing::warn!(connection_id, abandoned, "Took over an expired run lock");
        }
        return Ok(());
    }
    let exists = conn
        .prepare_cached("SELECT 1 FROM bank_connections WHERE id = ?1")?
        .exists([connection_id])?;
    if exists {
        Err(SyncError::AlreadyRunning(connection_id))
    } else {
        Err(SyncError::UnknownConnection(connection_id.to_string()))
    }
}

/// `running -> idle` on success, `running -> error` with `last_error` set
/// on failure.
pub fn release_run_lock(
    conn: &Connection,
    connection_id: i64,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let status = if error.is_some() {
        ConnectionStatus::Error
    } else {
        ConnectionStatus::Idle
    };
    conn.execute(
        "UPDATE bank_connections SET status = ?1, last_error = ?2, last_run_at = ?3, locked_at = NULL \
         WHERE id = ?4",
        rusqlite::params![status.as_str(), error, format_timestamp(now), connection_id],
    )?;
    Ok(())
}

/// Move connections whose lock outlived `lease` to `error` and fail their
/// open audit entries. Returns the recovered connection ids.
pub fn recover_stale_locks(
    conn: &Connection,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT id, locked_at FROM bank_connections WHERE status = 'running'")?;
    let running = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, timestamp_column(row, 1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let stale: Vec<i64> = running
        .into_iter()
        .filter(|(_, locked_at)| lock_expired(*locked_at, now, lease))
        .map(|(id, _)| id)
        .collect();

    let tx = conn.unchecked_transaction()?;
    for id in &stale {
        fail_open_entries(&tx, *id, INTERRUPTED, now)?;
        tx.execute(
            "UPDATE bank_connections SET status = 'error', last_error = ?1, locked_at = NULL \
             WHERE id = ?2 AND status = 'running'",
            rusqlite::params![INTERRUPTED, id],
        )?;
        tracing::warn!(connection_id = id, "Recovered stale run lock");
    }
    tx.commit()?;
    Ok(stale)
}

// ---------------------------------------------------------------------------
// Due evaluation
// ---------------------------------------------------------------------------

/// Start of the current period in the connection's timezone, at its
/// preferred time. `None` for manual connections.
fn period_anchor(
    frequency: Frequency,
    preferred_time: Option<NaiveTime>,
    tz: Tz,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(&tz).date_naive();
    let start = match frequency {
        Frequency::Manual => return None,
        Frequency::Daily => today,
        Frequency::Weekly => {
            today - chrono::Duration::days(i64::from(today.weekday().num_days_from_monday()))
        }
        Frequency::Monthly => today.with_day(1)?,
    };
    let local = start.and_time(preferred_time.unwrap_or(NaiveTime::MIN));
    // A preferred time inside a DST gap moves to the first valid instant after it.
    let anchor = tz
        .from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + chrono::Duration::hours(1))).earliest())?;
    Some(anchor.with_timezone(&Utc))
}

pub fn is_due(connection: &BankConnection, now: DateTime<Utc>) -> bool {
    let Some(anchor) = period_anchor(
        connection.frequency,
        connection.preferred_time,
        connection.timezone,
        now,
    ) else {
        return false;
    };
    now >= anchor && connection.last_run_at.map_or(true, |last| last < anchor)
}

// ---------------------------------------------------------------------------
// Tick loop
// ---------------------------------------------------------------------------

/// Removes a connection from the in-flight set when its task ends, panics
/// included.
struct InFlight {
    set: Arc<Mutex<HashSet<i64>>>,
    connection_id: i64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.connection_id);
    }
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    workers: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<i64>>>,
    tick_interval: Duration,
    lock_lease: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: &Settings) -> Self {
        Self {
            orchestrator,
            workers: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tick_interval: settings.tick_interval(),
            lock_lease: settings.lock_lease(),
        }
    }

    /// Tick until `cancel` fires, then wait for in-flight runs to finish.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let lease = self.lock_lease;
        let recovered = self
            .orchestrator
            .db(move |conn| recover_stale_locks(conn, Utc::now(), lease))
            .await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "Recovered interrupted runs on startup");
        }

        tracing::info!(
            tick_interval_secs = self.tick_interval.as_secs(),
            max_workers = self.workers.available_permits(),
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick(&mut tasks).await {
                        Ok(0) => tracing::debug!("Scheduler tick: nothing due"),
                        Ok(dispatched) => tracing::info!(dispatched, "Scheduler tick"),
                        Err(e) => tracing::error!(error = %e, "Scheduler tick failed"),
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "Waiting for in-flight runs");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        Ok(())
    }

    /// Dispatch every due connection that is not already in flight. Returns
    /// how many were dispatched.
    pub async fn tick(&self, tasks: &mut JoinSet<()>) -> Result<usize> {
        let connections = self.orchestrator.db(list_connections).await?;
        let now = Utc::now();
        let mut dispatched = 0;

        for connection in connections.iter().filter(|c| is_due(c, now)) {
            if connection.status == ConnectionStatus::Running
                && !lock_expired(connection.locked_at, now, self.lock_lease)
            {
                tracing::debug!(connection_id = connection.id, "Due but locked by another run");
                continue;
            }
            let fresh = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(connection.id);
            if !fresh {
                continue;
            }

            let guard = InFlight {
                set: Arc::clone(&self.in_flight),
                connection_id: connection.id,
            };
            let orchestrator = Arc::clone(&self.orchestrator);
            let workers = Arc::clone(&self.workers);
            let connection_id = connection.id;
            tracing::info!(connection_id, connection = %connection.name, "Dispatching sync");

            tasks.spawn(async move {
                let _guard = guard;
                let Ok(_permit) = workers.acquire_owned().await else {
                    return;
                };
                match orchestrator.run_sync(connection_id).await {
                    Ok(_) => {}
                    Err(SyncError::AlreadyRunning(_)) => {
                        tracing::debug!(connection_id, "Skipped: already running");
                    }
                    Err(e) => tracing::error!(connection_id, error = %e, "Sync could not start"),
                }
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Sync task aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{get_entry, open_entry};
    use crate::connections::get_connection_by_id;
    use crate::connections::tests::add_fixture_connection;
    use crate::db::tests::test_db;
    use crate::models::{AccountsMap, AdapterSettings, AuditStatus, Credentials, DateFormat};
    use crate::sync::tests::{batch, setup, Behavior};

    const LEASE: Duration = Duration::from_secs(600);

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn connection(
        frequency: Frequency,
        at: Option<&str>,
        tz: Tz,
        last_run_at: Option<DateTime<Utc>>,
    ) -> BankConnection {
        BankConnection {
            id: 1,
            scraper_slug: "fixture".into(),
            name: "Bank".into(),
            credentials: Credentials::default(),
            status: ConnectionStatus::Idle,
            date_format: DateFormat::Ymd,
            accounts_map: AccountsMap::new(),
            metadata: AdapterSettings::default(),
            frequency,
            preferred_time: at.map(|t| NaiveTime::parse_from_str(t, "%H:%M").unwrap()),
            timezone: tz,
            last_run_at,
            last_error: None,
            locked_at: None,
        }
    }

    #[test]
    fn test_manual_is_never_due() {
        let c = connection(Frequency::Manual, None, chrono_tz::UTC, None);
        assert!(!is_due(&c, utc(2025, 3, 5, 12, 0)));
    }

    #[test]
    fn test_daily_due() {
        let now = utc(2025, 3, 5, 7, 0);
        let never = connection(Frequency::Daily, Some("06:00"), chrono_tz::UTC, None);
        assert!(is_due(&never, now));
        let ran_today = connection(Frequency::Daily, Some("06:00"), chrono_tz::UTC, Some(utc(2025, 3, 5, 6, 30)));
        assert!(!is_due(&ran_today, now));
        let ran_yesterday =
            connection(Frequency::Daily, Some("06:00"), chrono_tz::UTC, Some(utc(2025, 3, 4, 7, 0)));
        assert!(is_due(&ran_yesterday, now));
        // Before today's preferred time nothing is due yet.
        assert!(!is_due(&ran_yesterday, utc(2025, 3, 5, 5, 0)));
    }

    #[test]
    fn test_preferred_time_in_dst_gap_runs_an_hour_later() {
        // Sydney skips 02:00-03:00 on 2025-10-05; 02:30 becomes 03:30 AEDT.
        let sydney = chrono_tz::Australia::Sydney;
        let c = connection(Frequency::Daily, Some("02:30"), sydney, Some(utc(2025, 10, 3, 16, 30)));
        assert!(!is_due(&c, utc(2025, 10, 4, 16, 0)));
        assert!(is_due(&c, utc(2025, 10, 4, 16, 30)));
        assert!(is_due(&c, utc(2025, 10, 4, 16, 45)));
    }

    #[test]
    fn test_ambiguous_preferred_time_runs_once_at_first_occurrence() {
        // Sydney repeats 02:00-03:00 on 2025-04-06; the first 02:30 is AEDT (UTC+11).
        let sydney = chrono_tz::Australia::Sydney;
        let c = connection(Frequency::Daily, Some("02:30"), sydney, Some(utc(2025, 4, 4, 15, 30)));
        assert!(!is_due(&c, utc(2025, 4, 5, 15, 15)));
        assert!(is_due(&c, utc(2025, 4, 5, 15, 45)));
        // After running at the first 02:30, the repeated 02:30 is not a new period.
        let ran = connection(Frequency::Daily, Some("02:30"), sydney, Some(utc(2025, 4, 5, 15, 45)));
        assert!(!is_due(&ran, utc(2025, 4, 5, 16, 45)));
    }

    #[test]
    fn test_weekly_anchor_is_monday() {
        // 2025-03-05 is a Wednesday; the week started Monday 2025-03-03.
        let now = utc(2025, 3, 5, 12, 0);
        let ran_monday = connection(Frequency::Weekly, None, chrono_tz::UTC, Some(utc(2025, 3, 3, 10, 0)));
        assert!(!is_due(&ran_monday, now));
        let ran_sunday = connection(Frequency::Weekly, None, chrono_tz::UTC, Some(utc(2025, 3, 2, 23, 0)));
        assert!(is_due(&ran_sunday, now));
    }

    #[test]
    fn test_monthly_anchor_is_first_of_month() {
        let now = utc(2025, 3, 20, 12, 0);
        let ran_feb = connection(Frequency::Monthly, None, chrono_tz::UTC, Some(utc(2025, 2, 28, 12, 0)));
        assert!(is_due(&ran_feb, now));
        let ran_march = connection(Frequency::Monthly, None, chrono_tz::UTC, Some(utc(2025, 3, 1, 0, 5)));
        assert!(!is_due(&ran_march, now));
    }

    #[test]
    fn test_preferred_time_uses_connection_timezone() {
        // Sydney is UTC+11 in March: 06:00 on the 5th local is 19:00 UTC on the 4th.
        let sydney = chrono_tz::Australia::Sydney;
        let last = Some(utc(2025, 3, 4, 10, 0));
        let c = connection(Frequency::Daily, Some("06:00"), sydney, last);
        assert!(!is_due(&c, utc(2025, 3, 4, 18, 0)));
        assert!(is_due(&c, utc(2025, 3, 4, 20, 0)));
        // The same instants in UTC see the run from 10:00 as current.
        let u = connection(Frequency::Daily, Some("06:00"), chrono_tz::UTC, last);
        assert!(!is_due(&u, utc(2025, 3, 4, 20, 0)));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let (_dir, conn) = test_db();
        let id = add_fixture_connection(&conn, "Bank");
        let now = utc(2025, 3, 5, 12, 0);
        acquire_run_lock(&conn, id, now, LEASE).unwrap();
        assert!(matches!(acquire_run_lock(&conn, id, now, LEASE), Err(SyncError::AlreadyRunning(_))));
        assert_eq!(get_connection_by_id(&conn, id).unwrap().locked_at, Some(now));
        assert!(matches!(
            acquire_run_lock(&conn, 404, now, LEASE),
            Err(SyncError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_release_records_outcome() {
        let (_dir, conn) = test_db();
        let id = add_fixture_connection(&conn, "Bank");
        let now = utc(2025, 3, 5, 12, 0);

        acquire_run_lock(&conn, id, now, LEASE).unwrap();
        release_run_lock(&conn, id, Some("bank said no"), now).unwrap();
        let failed = get_connection_by_id(&conn, id).unwrap();
        assert_eq!(failed.status, ConnectionStatus::Error);
        assert_eq!(failed.last_error.as_deref(), Some("bank said no"));
        assert_eq!(failed.last_run_at, Some(now));
        assert!(failed.locked_at.is_none());

        // An errored connection can run again; success clears the error.
        acquire_run_lock(&conn, id, now, LEASE).unwrap();
        release_run_lock(&conn, id, None, now).unwrap();
        let ok = get_connection_by_id(&conn, id).unwrap();
        assert_eq!(ok.status, ConnectionStatus::Idle);
        assert!(ok.last_error.is_none());
    }

    #[test]
    fn test_recover_stale_locks() {
        let (_dir, conn) = test_db();
        let stale = add_fixture_connection(&conn, "Stale");
        let fresh = add_fixture_connection(&conn, "Fresh");
        let now = utc(2025, 3, 5, 12, 0);
        acquire_run_lock(&conn, stale, now - chrono::Duration::hours(2), LEASE).unwrap();
        let audit_id = open_entry(&conn, stale, now - chrono::Duration::hours(2)).unwrap();
        acquire_run_lock(&conn, fresh, now - chrono::Duration::minutes(1), LEASE).unwrap();

        let recovered = recover_stale_locks(&conn, now, LEASE).unwrap();
        assert_eq!(recovered, vec![stale]);
        let c = get_connection_by_id(&conn, stale).unwrap();
        assert_eq!(c.status, ConnectionStatus::Error);
        assert_eq!(c.last_error.as_deref(), Some(INTERRUPTED));
        assert_eq!(get_entry(&conn, audit_id).unwrap().status, AuditStatus::Failed);
        assert_eq!(
            get_connection_by_id(&conn, fresh).unwrap().status,
            ConnectionStatus::Running
        );
    }

    #[test]
    fn test_expired_lock_is_taken_over() {
        let (_dir, conn) = test_db();
        let id = add_fixture_connection(&conn, "Bank");
        let now = utc(2025, 3, 5, 12, 0);
        let crashed_at = now - chrono::Duration::hours(2);
        acquire_run_lock(&conn, id, crashed_at, LEASE).unwrap();
        let orphan = open_entry(&conn, id, crashed_at).unwrap();

        // Within the lease the lock still holds.
        assert!(matches!(
            acquire_run_lock(&conn, id, crashed_at + chrono::Duration::minutes(5), LEASE),
            Err(SyncError::AlreadyRunning(_))
        ));

        acquire_run_lock(&conn, id, now, LEASE).unwrap();
        assert_eq!(get_connection_by_id(&conn, id).unwrap().locked_at, Some(now));
        let entry = get_entry(&conn, orphan).unwrap();
        assert_eq!(entry.status, AuditStatus::Failed);
        assert_eq!(entry.error_message.as_deref(), Some(INTERRUPTED));
        assert!(matches!(acquire_run_lock(&conn, id, now, LEASE), Err(SyncError::AlreadyRunning(_))));
    }

    #[test]
    fn test_lock_lease_formula() {
        assert_eq!(lock_lease(Duration::from_secs(60)), Duration::from_secs(420));
    }

    fn scheduler_for(orchestrator: Orchestrator) -> Scheduler {
        let settings = Settings {
            max_workers: 2,
            ..Settings::default()
        };
        Scheduler::new(Arc::new(orchestrator), &settings)
    }

    fn make_daily(db: &std::path::Path, connection_id: i64) {
        let conn = crate::db::get_connection(db).unwrap();
        crate::connections::set_schedule(&conn, connection_id, Frequency::Daily, None, chrono_tz::UTC)
            .unwrap();
    }

    #[tokio::test]
    async fn test_tick_dispatches_due_connections_once() {
        let ctx = setup(Behavior::Sleep(Duration::from_millis(300), batch()), Duration::from_secs(5));
        make_daily(&ctx.db_path, ctx.connection_id);
        let scheduler = scheduler_for(ctx.orchestrator);

        let mut tasks = JoinSet::new();
        assert_eq!(scheduler.tick(&mut tasks).await.unwrap(), 1);
        // Still in flight: a second tick must not dispatch it again.
        assert_eq!(scheduler.tick(&mut tasks).await.unwrap(), 0);
        while tasks.join_next().await.is_some() {}

        let conn = crate::db::get_connection(&ctx.db_path).unwrap();
        let entries = crate::audit::list_audit(&conn, ctx.connection_id, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Success);
        // Ran this period: no longer due.
        assert_eq!(scheduler.tick(&mut tasks).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tick_dispatches_connection_with_expired_lock() {
        let ctx = setup(Behavior::Batch(batch()), Duration::from_secs(5));
        make_daily(&ctx.db_path, ctx.connection_id);
        {
            let conn = crate::db::get_connection(&ctx.db_path).unwrap();
            conn.execute(
                "UPDATE bank_connections SET status = 'running', locked_at = '2020-01-01T00:00:00.000000Z' \
                 WHERE id = ?1",
                [ctx.connection_id],
            )
            .unwrap();
        }
        let scheduler = scheduler_for(ctx.orchestrator);
        let mut tasks = JoinSet::new();
        assert_eq!(scheduler.tick(&mut tasks).await.unwrap(), 1);
        while tasks.join_next().await.is_some() {}

        let conn = crate::db::get_connection(&ctx.db_path).unwrap();
        let c = get_connection_by_id(&conn, ctx.connection_id).unwrap();
        assert_eq!(c.status, ConnectionStatus::Idle);
        assert!(c.locked_at.is_none());
    }

    #[tokio::test]
    async fn test_manual_connections_are_not_dispatched() {
        let ctx = setup(Behavior::Batch(batch()), Duration::from_secs(5));
        let scheduler = scheduler_for(ctx.orchestrator);
        let mut tasks = JoinSet::new();
        assert_eq!(scheduler.tick(&mut tasks).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let ctx = setup(Behavior::Batch(batch()), Duration::from_secs(5));
        make_daily(&ctx.db_path, ctx.connection_id);
        let scheduler = scheduler_for(ctx.orchestrator);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.cancel();
        });
        scheduler.run(cancel).await.unwrap();

        // The first tick fires immediately, so the due connection ran.
        let conn = crate::db::get_connection(&ctx.db_path).unwrap();
        let c = get_connection_by_id(&conn, ctx.connection_id).unwrap();
        assert_eq!(c.status, ConnectionStatus::Idle);
        assert!(c.last_run_at.is_some());
    }
}
