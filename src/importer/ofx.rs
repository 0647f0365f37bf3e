use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::{whole_cents, ParseOutcome};
use crate::error::{Result, SyncError};
use crate::models::CanonicalTransaction;

// OFX 1.x is SGML: aggregates have closing tags, leaf elements usually do
// not. OFX 2.x is XML and closes everything. Scanning `<TAG>value` segments
// handles both.

const DEBIT_TYPES: &[&str] = &[
    "DEBIT", "CHECK", "PAYMENT", "ATM", "POS", "FEE", "SRVCHG", "DIRECTDEBIT", "REPEATPMT", "CASH",
];
const CREDIT_TYPES: &[&str] = &["CREDIT", "DEP", "INT", "DIV", "DIRECTDEP"];

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Open(String, &'a str),
    Close(String),
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    for segment in text.split('<').skip(1) {
        let Some((tag, rest)) = segment.split_once('>') else {
            continue;
        };
        let tag = tag.trim();
        if tag.starts_with('?') || tag.starts_with('!') || tag.is_empty() {
            continue;
        }
        if let Some(name) = tag.strip_prefix('/') {
            tokens.push(Token::Close(name.trim().to_ascii_uppercase()));
        } else {
            tokens.push(Token::Open(tag.to_ascii_uppercase(), rest.trim()));
        }
    }
    tokens
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// `YYYYMMDD[hhmmss[.xxx]][[-5:EST]]`; only the calendar date is kept.
fn parse_ofx_date(raw: &str) -> Option<NaiveDate> {
    let digits = raw.get(..8)?;
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

fn normalize_sign(amount: Decimal, trn_type: Option<&str>) -> Decimal {
    match trn_type {
        Some(t) if DEBIT_TYPES.contains(&t) => -amount.abs(),
        Some(t) if CREDIT_TYPES.contains(&t) => amount.abs(),
        _ => amount,
    }
}

/// `TRNAMT` has no digit grouping; a comma is the decimal separator some
/// institutions use in place of `.`.
fn parse_ofx_amount(raw: &str) -> Option<Decimal> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let normalized = match s.matches(',').count() {
        0 => s.to_string(),
        1 if !s.contains('.') => s.replace(',', "."),
        _ => return None,
    };
    Decimal::from_str(&normalized).ok().and_then(whole_cents)
}

#[derive(Default)]
struct PendingTxn {
    trn_type: Option<String>,
    posted: Option<String>,
    amount: Option<String>,
    fitid: Option<String>,
    name: Option<String>,
    memo: Option<String>,
}

impl PendingTxn {
    fn finish(self, account_ref: &str) -> std::result::Result<CanonicalTransaction, String> {
        let fitid = self.fitid.filter(|f| !f.is_empty());
        let label = fitid.clone().unwrap_or_else(|| "<no FITID>".to_string());
        let posted = self
            .posted
            .ok_or_else(|| format!("transaction {label}: missing DTPOSTED"))?;
        let date = parse_ofx_date(&posted)
            .ok_or_else(|| format!("transaction {label}: bad DTPOSTED '{posted}'"))?;
        let raw_amount = self
            .amount
            .ok_or_else(|| format!("transaction {label}: missing TRNAMT"))?;
        let amount = parse_ofx_amount(&raw_amount)
            .ok_or_else(|| format!("transaction {label}: bad TRNAMT '{raw_amount}'"))?;
        let description = self
            .name
            .filter(|n| !n.is_empty())
            .or(self.memo.filter(|m| !m.is_empty()))
            .ok_or_else(|| format!("transaction {label}: no NAME or MEMO"))?;
        let trn_type = self.trn_type.map(|t| t.to_ascii_uppercase());
        Ok(CanonicalTransaction {
            external_id: fitid,
            account_ref: account_ref.to_string(),
            date,
            description,
            amount: normalize_sign(amount, trn_type.as_deref()),
            raw_type: trn_type,
        })
    }
}

pub(super) fn parse(text: &str) -> Result<ParseOutcome> {
    if !text.to_ascii_uppercase().contains("<OFX>") {
        return Err(SyncError::Parse("not an OFX document (no <OFX> root)".into()));
    }

    let mut outcome = ParseOutcome::default();
    let mut account_ref = String::new();
    let mut in_account_from = false;
    let mut current: Option<PendingTxn> = None;

    for token in tokenize(text) {
        match token {
            Token::Open(tag, value) => match tag.as_str() {
                "STMTRS" | "CCSTMTRS" => account_ref.clear(),
                "BANKACCTFROM" | "CCACCTFROM" => in_account_from = true,
                "ACCTID" if in_account_from => account_ref = decode_entities(value),
                "STMTTRN" => {
                    outcome.candidates += 1;
                    current = Some(PendingTxn::default());
                }
                _ => {
                    if let Some(txn) = current.as_mut() {
                        let value = decode_entities(value);
                        match tag.as_str() {
                            "TRNTYPE" => txn.trn_type = Some(value),
                            "DTPOSTED" => txn.posted = Some(value),
                            "TRNAMT" => txn.amount = Some(value),
                            "FITID" => txn.fitid = Some(value),
                            "NAME" if txn.name.is_none() => txn.name = Some(value),
                            "MEMO" => txn.memo = Some(value),
                            _ => {}
                        }
                    }
                }
            },
            Token::Close(tag) => match tag.as_str() {
                "BANKACCTFROM" | "CCACCTFROM" => in_account_from = false,
                "STMTTRN" => {
                    if let Some(txn) = current.take() {
                        match txn.finish(&account_ref) {
                            Ok(record) => outcome.records.push(record),
                            Err(warning) => outcome.skip(warning),
                        }
                    }
                }
                _ => {}
            },
        }
    }

    if let Some(txn) = current.take() {
        // Truncated file: last transaction never closed.
        match txn.finish(&account_ref) {
            Ok(record) => outcome.records.push(record),
            Err(warning) => outcome.skip(warning),
        }
    }

    Ok(outcome)
}
