//! Format adapters: turn bank exports and scraper output into
//! [`CanonicalTransaction`]s with the ledger's sign convention.

mod ofx;
mod qif;
pub mod scraped;

use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};
use crate::models::{CanonicalTransaction, DateFormat};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Keep an amount only when it is a whole number of cents. `12.500` is
/// accepted; `12.345` is not.
pub fn whole_cents(amount: Decimal) -> Option<Decimal> {
    (amount.round_dp(2) == amount).then_some(amount)
}

/// Parse a money string: thousands separators, currency symbols,
/// `(12.00)` and `12.00-` negatives. `None` when nothing numeric remains
/// or the amount has fractions of a cent.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    parse_money(raw).and_then(whole_cents)
}

fn parse_money(raw: &str) -> Option<Decimal> {
    let s: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '"' | '$' | '€' | '£' | ' '))
        .collect();
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        return Decimal::from_str(inner).ok().map(|d| -d.abs());
    }
    if let Some(inner) = s.strip_suffix('-') {
        return Decimal::from_str(inner).ok().map(|d| -d.abs());
    }
    Decimal::from_str(s).ok()
}

fn expand_year(y: i32) -> i32 {
    if y < 100 {
        2000 + y
    } else {
        y
    }
}

/// Parse a calendar date. A leading four-digit group is always read as
/// year-month-day; otherwise `hint` decides day/month order. Accepts `/`,
/// `-`, `.` and the QIF `'` year separator, plus compact `YYYYMMDD`.
pub fn parse_date(raw: &str, hint: DateFormat) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(raw, "%Y%m%d").ok();
    }
    let parts: Vec<&str> = raw
        .split(|c| matches!(c, '/' | '-' | '.' | '\''))
        .map(str::trim)
        .collect();
    if parts.len() != 3 {
        return None;
    }
    let nums: Vec<i32> = parts
        .iter()
        .map(|p| p.parse::<i32>().ok())
        .collect::<Option<Vec<_>>>()?;
    let (y, m, d) = if parts[0].len() == 4 {
        (nums[0], nums[1], nums[2])
    } else {
        match hint {
            DateFormat::Mdy => (expand_year(nums[2]), nums[0], nums[1]),
            DateFormat::Dmy => (expand_year(nums[2]), nums[1], nums[0]),
            DateFormat::Ymd => (expand_year(nums[0]), nums[1], nums[2]),
        }
    };
    let m = u32::try_from(m).ok()?;
    let d = u32::try_from(d).ok()?;
    NaiveDate::from_ymd_opt(y, m, d)
}

/// Collapse whitespace and case so descriptions compare the way a person
/// reading the statement would.
pub fn normalize_description(description: &str) -> String {
    description
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Format kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Ofx,
    Qif,
    Scraped,
}

impl FormatKind {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Ofx => "ofx",
            Self::Qif => "qif",
            Self::Scraped => "scraped",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ofx => "Open Financial Exchange",
            Self::Qif => "Quicken Interchange Format",
            Self::Scraped => "Scraper output",
        }
    }

    /// Formats a user may upload as a file.
    pub fn is_upload_format(&self) -> bool {
        matches!(self, Self::Ofx | Self::Qif)
    }

    pub fn parse(&self, raw: &[u8], hint: DateFormat) -> Result<ParseOutcome> {
        let outcome = match self {
            Self::Ofx => ofx::parse(&decode_text(raw))?,
            Self::Qif => qif::parse(&decode_text(raw), hint)?,
            Self::Scraped => {
                let value: serde_json::Value = serde_json::from_slice(raw)
                    .map_err(|e| SyncError::Parse(format!("scraper output is not JSON: {e}")))?;
                scraped::parse_value(&value, &scraped::ScrapeOptions::new(hint))?
            }
        };
        outcome.ensure_usable(self)
    }
}

const ALL_FORMATS: &[FormatKind] = &[FormatKind::Ofx, FormatKind::Qif, FormatKind::Scraped];

pub fn get_by_key(key: &str) -> Option<FormatKind> {
    ALL_FORMATS
        .iter()
        .find(|f| f.key().eq_ignore_ascii_case(key))
        .copied()
}

/// Entry point for the ingestion pipeline.
pub fn parse(raw: &[u8], format: FormatKind, hint: DateFormat) -> Result<ParseOutcome> {
    format.parse(raw, hint)
}

fn decode_text(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_start_matches('\u{feff}').to_string()
}

// ---------------------------------------------------------------------------
// ParseOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub records: Vec<CanonicalTransaction>,
    /// One entry per skipped record.
    pub warnings: Vec<String>,
    /// Record candidates seen, parsed or not.
    pub candidates: usize,
}

impl ParseOutcome {
    pub(crate) fn skip(&mut self, warning: String) {
        tracing::warn!(%warning, "Skipping unparseable record");
        self.warnings.push(warning);
    }

    /// Some records but none usable is fatal; an empty statement is not.
    pub(crate) fn ensure_usable(self, format: &FormatKind) -> Result<Self> {
        if self.candidates > 0 && self.records.is_empty() {
            return Err(SyncError::Parse(format!(
                "no usable records in {} input ({} skipped; first: {})",
                format.key(),
                self.warnings.len(),
                self.warnings.first().map(String::as_str).unwrap_or("-"),
            )));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1,234.56"), Some(dec("1234.56")));
        assert_eq!(parse_amount("\"500.00\""), Some(dec("500")));
        assert_eq!(parse_amount("  -42.50  "), Some(dec("-42.5")));
        assert_eq!(parse_amount("not_a_number"), None);
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn test_parse_amount_negative_forms() {
        assert_eq!(parse_amount("(500.00)"), Some(dec("-500")));
        assert_eq!(parse_amount("-$50.00"), Some(dec("-50")));
        assert_eq!(parse_amount("12.30-"), Some(dec("-12.3")));
    }

    #[test]
    fn test_parse_amount_rejects_fractions_of_a_cent() {
        assert_eq!(parse_amount("0.005"), None);
        assert_eq!(parse_amount("-12.345"), None);
        assert_eq!(parse_amount("12.500"), Some(dec("12.5")));
        assert_eq!(whole_cents(dec("3.10")), Some(dec("3.1")));
    }

    #[test]
    fn test_parse_date_respects_hint() {
        let d = |y, m, d| NaiveDate::from_ymd_opt(y, m, d);
        assert_eq!(parse_date("03/04/2025", DateFormat::Mdy), d(2025, 3, 4));
        assert_eq!(parse_date("03/04/2025", DateFormat::Dmy), d(2025, 4, 3));
        assert_eq!(parse_date("2025-04-03", DateFormat::Dmy), d(2025, 4, 3));
        assert_eq!(parse_date("1/15'25", DateFormat::Mdy), d(2025, 1, 15));
        assert_eq!(parse_date("20250115", DateFormat::Mdy), d(2025, 1, 15));
    }

    #[test]
    fn test_parse_date_rejects_invalid_dates() {
        assert_eq!(parse_date("13/01/2025", DateFormat::Mdy), None);
        assert_eq!(parse_date("02/30/2025", DateFormat::Mdy), None);
        assert_eq!(parse_date("yesterday", DateFormat::Mdy), None);
    }

    #[test]
    fn test_normalize_description() {
        assert_eq!(normalize_description("  Coffee   SHOP\tNo.1 "), "coffee shop no.1");
    }

    #[test]
    fn test_get_by_key() {
        assert_eq!(get_by_key("OFX"), Some(FormatKind::Ofx));
        assert_eq!(get_by_key("qif"), Some(FormatKind::Qif));
        assert_eq!(get_by_key("csv"), None);
        assert!(!FormatKind::Scraped.is_upload_format());
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(compute_checksum(b"abc"), compute_checksum(b"abc"));
        assert_ne!(compute_checksum(b"abc"), compute_checksum(b"abd"));
    }
}
