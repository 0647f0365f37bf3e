//! Shape validation for records returned by a live scraper.
//!
//! Expected shape:
//!
//! ```json
//! {"accounts": [{"name": "Everyday", "number": "062-000 1234",
//!                "offset": false,
//!                "transactions": [{"id": "abc", "date": "2025-01-15",
//!                                  "description": "COFFEE", "amount": "-4.50",
//!                                  "type": "debit"}]}]}
//! ```

use serde::Deserialize;
use serde_json::Value;

use super::{parse_amount, parse_date, ParseOutcome};
use crate::error::{Result, SyncError};
use crate::models::{CanonicalTransaction, DateFormat, RemoteAccount};
use crate::resolver::account_keys;

#[derive(Debug, Deserialize)]
struct Batch {
    accounts: Vec<BatchAccount>,
}

#[derive(Debug, Deserialize)]
struct BatchAccount {
    name: String,
    #[serde(default)]
    number: Option<String>,
    /// Redraw/offset sub-account of a loan.
    #[serde(default)]
    offset: bool,
    #[serde(default)]
    transactions: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub hint: DateFormat,
    pub include_offset_accounts: bool,
}

impl ScrapeOptions {
    pub fn new(hint: DateFormat) -> Self {
        Self {
            hint,
            include_offset_accounts: true,
        }
    }
}

fn text_field<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str).map(str::trim)
}

fn amount_field(record: &Value) -> Option<rust_decimal::Decimal> {
    match record.get("amount")? {
        Value::String(s) => parse_amount(s),
        Value::Number(n) => parse_amount(&n.to_string()),
        _ => None,
    }
}

fn to_canonical(
    record: &Value,
    account_ref: &str,
    hint: DateFormat,
    position: usize,
) -> std::result::Result<CanonicalTransaction, String> {
    let label = format!("{account_ref} #{position}");
    if !record.is_object() {
        return Err(format!("{label}: record is not an object"));
    }
    let raw_date = text_field(record, "date").ok_or_else(|| format!("{label}: missing date"))?;
    let date = parse_date(raw_date, hint)
        .ok_or_else(|| format!("{label}: bad date '{raw_date}' for {}", hint.as_str()))?;
    let description = text_field(record, "description")
        .filter(|d| !d.is_empty())
        .ok_or_else(|| format!("{label}: missing description"))?;
    let amount = amount_field(record).ok_or_else(|| format!("{label}: missing or bad amount"))?;
    let raw_type = text_field(record, "type").map(str::to_string);
    let amount = match raw_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("debit") => -amount.abs(),
        Some("credit") => amount.abs(),
        _ => amount,
    };
    let external_id = match record.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    Ok(CanonicalTransaction {
        external_id,
        account_ref: account_ref.to_string(),
        date,
        description: description.to_string(),
        amount,
        raw_type,
    })
}

/// Validate a scraper batch and flatten it into canonical records, keyed by
/// the composite account identifier.
pub fn parse_value(value: &Value, options: &ScrapeOptions) -> Result<ParseOutcome> {
    let batch: Batch = serde_json::from_value(value.clone())
        .map_err(|e| SyncError::Parse(format!("unexpected scraper output shape: {e}")))?;

    let remotes: Vec<RemoteAccount> = batch
        .accounts
        .iter()
        .map(|a| RemoteAccount {
            name: a.name.clone(),
            number: a.number.clone(),
        })
        .collect();
    let keys = account_keys(&remotes);

    let mut outcome = ParseOutcome::default();
    for (account, key) in batch.accounts.iter().zip(keys) {
        if account.offset && !options.include_offset_accounts {
            tracing::debug!(account = %key, "Ignoring offset sub-account");
            continue;
        }
        for (position, record) in account.transactions.iter().enumerate() {
            outcome.candidates += 1;
            match to_canonical(record, &key, options.hint, position + 1) {
                Ok(txn) => outcome.records.push(txn),
                Err(warning) => outcome.skip(warning),
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flattens_accounts_in_order() {
        let batch = json!({"accounts": [
            {"name": "Checking", "transactions": [
                {"id": "a1", "date": "2025-01-15", "description": "COFFEE", "amount": "-4.50"},
                {"id": "a2", "date": "2025-01-16", "description": "REFUND", "amount": 12}
            ]},
            {"name": "Savings", "transactions": [
                {"date": "16/01/2025", "description": "INTEREST", "amount": "0.31"}
            ]}
        ]});
        let outcome = parse_value(&batch, &ScrapeOptions::new(DateFormat::Dmy)).unwrap();
        let refs: Vec<&str> = outcome.records.iter().map(|r| r.account_ref.as_str()).collect();
        assert_eq!(refs, vec!["Checking", "Checking", "Savings"]);
        assert_eq!(outcome.records[1].amount.to_string(), "12");
        assert_eq!(outcome.records[2].external_id, None);
        assert_eq!(outcome.records[2].date.to_string(), "2025-01-16");
    }

    #[test]
    fn test_type_forces_sign() {
        let batch = json!({"accounts": [{"name": "Card", "transactions": [
            {"date": "2025-01-15", "description": "SHOP", "amount": "25.00", "type": "debit"},
            {"date": "2025-01-15", "description": "RETURN", "amount": "-5.00", "type": "Credit"}
        ]}]});
        let outcome = parse_value(&batch, &ScrapeOptions::new(DateFormat::Mdy)).unwrap();
        assert_eq!(outcome.records[0].amount.to_string(), "-25.00");
        assert_eq!(outcome.records[1].amount.to_string(), "5.00");
    }

    #[test]
    fn test_duplicate_names_get_number_suffix() {
        let batch = json!({"accounts": [
            {"name": "Everyday", "number": "111-2222", "transactions": [
                {"date": "2025-01-15", "description": "A", "amount": "-1"}]},
            {"name": "Everyday", "number": "333-4444", "transactions": [
                {"date": "2025-01-15", "description": "B", "amount": "-1"}]}
        ]});
        let outcome = parse_value(&batch, &ScrapeOptions::new(DateFormat::Mdy)).unwrap();
        assert_eq!(outcome.records[0].account_ref, "Everyday (…2222)");
        assert_eq!(outcome.records[1].account_ref, "Everyday (…4444)");
    }

    #[test]
    fn test_offset_accounts_follow_option() {
        let batch = json!({"accounts": [
            {"name": "Home Loan", "transactions": [
                {"date": "2025-01-15", "description": "INTEREST", "amount": "-800"}]},
            {"name": "Offset", "offset": true, "transactions": [
                {"date": "2025-01-15", "description": "DEPOSIT", "amount": "100"}]}
        ]});
        let mut options = ScrapeOptions::new(DateFormat::Mdy);
        options.include_offset_accounts = false;
        assert_eq!(parse_value(&batch, &options).unwrap().records.len(), 1);
        options.include_offset_accounts = true;
        assert_eq!(parse_value(&batch, &options).unwrap().records.len(), 2);
    }

    #[test]
    fn test_bad_records_become_warnings() {
        let batch = json!({"accounts": [{"name": "Checking", "transactions": [
            {"date": "not a date", "description": "X", "amount": "-1"},
            "garbage",
            {"date": "2025-01-15", "description": "OK", "amount": "-1"}
        ]}]});
        let outcome = parse_value(&batch, &ScrapeOptions::new(DateFormat::Mdy)).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.warnings.len(), 2);
        assert_eq!(outcome.candidates, 3);
    }

    #[test]
    fn test_sub_cent_amount_is_a_warning() {
        let batch = json!({"accounts": [{"name": "Checking", "transactions": [
            {"date": "2025-01-15", "description": "FX FEE", "amount": "-0.005"},
            {"date": "2025-01-15", "description": "FX", "amount": -12.345},
            {"date": "2025-01-15", "description": "OK", "amount": "-1.50"}
        ]}]});
        let outcome = parse_value(&batch, &ScrapeOptions::new(DateFormat::Mdy)).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.warnings[0].contains("bad amount"));
    }

    #[test]
    fn test_wrong_shape_is_parse_error() {
        let err = parse_value(&json!({"rows": []}), &ScrapeOptions::new(DateFormat::Mdy));
        assert!(matches!(err, Err(SyncError::Parse(_))));
    }
}
