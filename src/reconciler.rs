use rusqlite::Connection;

use crate::db::{amount_to_cents, cents_to_amount, date_column, format_date, parse_column};
use crate::error::Result;
use crate::importer::normalize_description;
use crate::models::{CanonicalTransaction, Transaction, TxnStatus};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileResult {
    pub inserted: usize,
    pub duplicates: usize,
    pub inserted_ids: Vec<i64>,
}

impl ReconcileResult {
    pub fn merge(&mut self, other: ReconcileResult) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.inserted_ids.extend(other.inserted_ids);
    }
}

fn has_external_id(conn: &Connection, account_id: i64, external_id: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM transactions WHERE account_id = ?1 AND external_id = ?2",
    )?;
    Ok(stmt.exists(rusqlite::params![account_id, external_id])?)
}

/// Same account, date and amount, and a description that matches once case
/// and whitespace are normalized.
fn has_fallback_match(
    conn: &Connection,
    account_id: i64,
    date: &str,
    cents: i64,
    description: &str,
) -> Result<bool> {
    let wanted = normalize_description(description);
    let mut stmt = conn.prepare_cached(
        "SELECT description FROM transactions WHERE account_id = ?1 AND date = ?2 AND amount = ?3",
    )?;
    let mut rows = stmt.query(rusqlite::params![account_id, date, cents])?;
    while let Some(row) = rows.next()? {
        let existing: String = row.get(0)?;
        if normalize_description(&existing) == wanted {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Decide insert vs duplicate for each record, in order. Existing rows are
/// never modified. Callers wrap a run's calls in one transaction.
pub fn reconcile(
    conn: &Connection,
    account_id: i64,
    records: &[CanonicalTransaction],
) -> Result<ReconcileResult> {
    let mut result = ReconcileResult::default();

    for record in records {
        let date = format_date(record.date);
        let cents = amount_to_cents(record.amount)?;

        let (duplicate, status) = match record.external_id.as_deref() {
            Some(external_id) => (
                has_external_id(conn, account_id, external_id)?,
                TxnStatus::Cleared,
            ),
            None => (
                has_fallback_match(conn, account_id, &date, cents, &record.description)?,
                TxnStatus::Pending,
            ),
        };

        if duplicate {
            result.duplicates += 1;
            continue;
        }

        conn.execute(
            "INSERT INTO transactions (account_id, date, description, amount, status, external_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                account_id,
                date,
                record.description,
                cents,
                status.as_str(),
                record.external_id,
            ],
        )?;
        result.inserted += 1;
        result.inserted_ids.push(conn.last_insert_rowid());
    }

    Ok(result)
}

/// Reconcile several accounts' records atomically: either every insert of
/// the batch is visible or none is.
pub fn reconcile_batch(
    conn: &Connection,
    groups: &[(i64, Vec<CanonicalTransaction>)],
    import_id: Option<i64>,
) -> Result<Vec<(i64, ReconcileResult)>> {
    let tx = conn.unchecked_transaction()?;
    let results = reconcile_groups(&tx, groups, import_id)?;
    tx.commit()?;
    Ok(results)
}

/// `reconcile_batch` for callers that already hold a transaction.
pub fn reconcile_groups(
    conn: &Connection,
    groups: &[(i64, Vec<CanonicalTransaction>)],
    import_id: Option<i64>,
) -> Result<Vec<(i64, ReconcileResult)>> {
    let mut results = Vec::with_capacity(groups.len());
    for (account_id, records) in groups {
        let result = reconcile(conn, *account_id, records)?;
        if let Some(import_id) = import_id {
            let mut stmt = conn.prepare_cached("UPDATE transactions SET import_id = ?1 WHERE id = ?2")?;
            for id in &result.inserted_ids {
                stmt.execute(rusqlite::params![import_id, id])?;
            }
        }
        results.push((*account_id, result));
    }
    Ok(results)
}

const TXN_COLUMNS: &str = "id, account_id, date, description, amount, category_id, status, \
                           external_id, transfer_id, created_at";

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        date: date_column(row, 2)?,
        description: row.get(3)?,
        amount: cents_to_amount(row.get(4)?),
        category_id: row.get(5)?,
        status: parse_column(row, 6)?,
        external_id: row.get(7)?,
        transfer_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
pub(crate) fn get_transaction(conn: &Connection, id: i64) -> Result<Option<Transaction>> {
    use rusqlite::OptionalExtension;
    let txn = conn
        .query_row(
            &format!("SELECT {TXN_COLUMNS} FROM transactions WHERE id = ?1"),
            [id],
            row_to_transaction,
        )
        .optional()?;
    Ok(txn)
}

/// Most recent ledger rows, newest first.
pub fn recent_transactions(
    conn: &Connection,
    account_id: Option<i64>,
    uncategorized_only: bool,
    limit: usize,
) -> Result<Vec<Transaction>> {
    let sql = format!(
        "SELECT {TXN_COLUMNS} FROM transactions \
         WHERE (?1 IS NULL OR account_id = ?1) AND (?2 = 0 OR category_id IS NULL) \
         ORDER BY date DESC, id DESC LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params![account_id, uncategorized_only, limit as i64],
            row_to_transaction,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{add_account, test_db};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn record(external_id: Option<&str>, day: u32, description: &str, cents: i64) -> CanonicalTransaction {
        CanonicalTransaction {
            external_id: external_id.map(str::to_string),
            account_ref: "Checking".into(),
            date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            description: description.to_string(),
            amount: Decimal::new(cents, 2),
            raw_type: None,
        }
    }

    fn row_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT count(*) FROM transactions", [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_inserts_new_records() {
        let (_dir, conn) = test_db();
        let acct = add_account(&conn, "Checking");
        let result = reconcile(
            &conn,
            acct,
            &[record(Some("F1"), 1, "A", -100), record(None, 2, "B", -200)],
        )
        .unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(result.duplicates, 0);
        assert_eq!(result.inserted_ids.len(), 2);

        let with_id = get_transaction(&conn, result.inserted_ids[0]).unwrap().unwrap();
        assert_eq!(with_id.status, TxnStatus::Cleared);
        assert_eq!(with_id.amount, Decimal::new(-100, 2));
        let without_id = get_transaction(&conn, result.inserted_ids[1]).unwrap().unwrap();
        assert_eq!(without_id.status, TxnStatus::Pending);
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let (_dir, conn) = test_db();
        let acct = add_account(&conn, "Checking");
        let records = vec![
            record(Some("F1"), 1, "A", -100),
            record(None, 2, "Coffee Shop", -450),
            record(None, 3, "Salary", 250000),
        ];
        let first = reconcile(&conn, acct, &records).unwrap();
        assert_eq!(first.inserted, 3);
        let second = reconcile(&conn, acct, &records).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(row_count(&conn), 3);
    }

    #[test]
    fn test_external_id_duplicate_keeps_user_edits() {
        let (_dir, conn) = test_db();
        let acct = add_account(&conn, "Checking");
        let first = reconcile(&conn, acct, &[record(Some("F1"), 1, "A", -100)]).unwrap();
        let id = first.inserted_ids[0];
        conn.execute("UPDATE transactions SET category_id = 1, status = 'failed' WHERE id = ?1", [id])
            .unwrap();

        let changed = record(Some("F1"), 1, "A (edited upstream)", -999);
        let again = reconcile(&conn, acct, &[changed]).unwrap();
        assert_eq!(again.duplicates, 1);
        let txn = get_transaction(&conn, id).unwrap().unwrap();
        assert_eq!(txn.category_id, Some(1));
        assert_eq!(txn.status, TxnStatus::Failed);
        assert_eq!(txn.description, "A");
    }

    #[test]
    fn test_fallback_ignores_case_and_whitespace() {
        let (_dir, conn) = test_db();
        let acct = add_account(&conn, "Checking");
        reconcile(&conn, acct, &[record(None, 2, "COFFEE  SHOP", -450)]).unwrap();
        let again = reconcile(&conn, acct, &[record(None, 2, " coffee shop ", -450)]).unwrap();
        assert_eq!(again.duplicates, 1);
        // Different amount is a different transaction.
        let other = reconcile(&conn, acct, &[record(None, 2, "coffee shop", -451)]).unwrap();
        assert_eq!(other.inserted, 1);
    }

    #[test]
    fn test_identical_records_in_one_run_collapse() {
        let (_dir, conn) = test_db();
        let acct = add_account(&conn, "Checking");
        let coffee = record(None, 2, "Coffee", -450);
        let result = reconcile(&conn, acct, &[coffee.clone(), coffee]).unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.duplicates, 1);
    }

    #[test]
    fn test_dedup_is_per_account() {
        let (_dir, conn) = test_db();
        let a = add_account(&conn, "A");
        let b = add_account(&conn, "B");
        reconcile(&conn, a, &[record(Some("F1"), 1, "X", -100)]).unwrap();
        let result = reconcile(&conn, b, &[record(Some("F1"), 1, "X", -100)]).unwrap();
        assert_eq!(result.inserted, 1);
    }

    #[test]
    fn test_batch_rolls_back_on_error() {
        let (_dir, conn) = test_db();
        let acct = add_account(&conn, "Checking");
        let groups = vec![
            (acct, vec![record(Some("F1"), 1, "A", -100)]),
            // Unknown account violates the foreign key and aborts the batch.
            (9999, vec![record(Some("F2"), 1, "B", -100)]),
        ];
        assert!(reconcile_batch(&conn, &groups, None).is_err());
        assert_eq!(row_count(&conn), 0);
    }

    #[test]
    fn test_batch_tags_import_id() {
        let (_dir, conn) = test_db();
        let acct = add_account(&conn, "Checking");
        conn.execute("INSERT INTO imports (filename, format) VALUES ('a.ofx', 'ofx')", []).unwrap();
        let import_id = conn.last_insert_rowid();
        let results =
            reconcile_batch(&conn, &[(acct, vec![record(Some("F1"), 1, "A", -100)])], Some(import_id))
                .unwrap();
        assert_eq!(results[0].1.inserted, 1);
        let tagged: i64 = conn
            .query_row("SELECT count(*) FROM transactions WHERE import_id = ?1", [import_id], |r| r.get(0))
            .unwrap();
        assert_eq!(tagged, 1);
    }

    #[test]
    fn test_recent_transactions_filters() {
        let (_dir, conn) = test_db();
        let a = add_account(&conn, "A");
        let b = add_account(&conn, "B");
        let first = reconcile(&conn, a, &[record(None, 1, "Old", -100), record(None, 5, "New", -100)]).unwrap();
        reconcile(&conn, b, &[record(None, 3, "Other", -100)]).unwrap();
        conn.execute("UPDATE transactions SET category_id = 1 WHERE id = ?1", [first.inserted_ids[1]])
            .unwrap();

        let all = recent_transactions(&conn, None, false, 10).unwrap();
        let descs: Vec<&str> = all.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(descs, vec!["New", "Other", "Old"]);
        assert_eq!(recent_transactions(&conn, Some(a), false, 10).unwrap().len(), 2);
        let open = recent_transactions(&conn, Some(a), true, 10).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].description, "Old");
        assert_eq!(recent_transactions(&conn, None, false, 1).unwrap().len(), 1);
    }
}
