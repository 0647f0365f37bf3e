use super::{parse_amount, parse_date, ParseOutcome};
use crate::error::{Result, SyncError};
use crate::models::{CanonicalTransaction, DateFormat};

/// Section types whose records are transactions.
const TRANSACTION_TYPES: &[&str] = &["bank", "cash", "ccard", "oth a", "oth l"];

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Transactions,
    Account,
    Other,
}

#[derive(Default)]
struct Record {
    date: Option<String>,
    amount: Option<String>,
    payee: Option<String>,
    memo: Option<String>,
    number: Option<String>,
    line: usize,
}

impl Record {
    fn is_empty(&self) -> bool {
        self.date.is_none() && self.amount.is_none() && self.payee.is_none() && self.memo.is_none()
    }

    fn finish(
        self,
        account_ref: &str,
        hint: DateFormat,
    ) -> std::result::Result<CanonicalTransaction, String> {
        let line = self.line;
        let raw_date = self.date.ok_or_else(|| format!("record at line {line}: missing D"))?;
        let date = parse_date(&raw_date, hint).ok_or_else(|| {
            format!("record at line {line}: bad date '{raw_date}' for {}", hint.as_str())
        })?;
        let raw_amount = self.amount.ok_or_else(|| format!("record at line {line}: missing T"))?;
        let amount = parse_amount(&raw_amount)
            .ok_or_else(|| format!("record at line {line}: bad amount '{raw_amount}'"))?;
        let description = self
            .payee
            .filter(|p| !p.is_empty())
            .or(self.memo.filter(|m| !m.is_empty()))
            .ok_or_else(|| format!("record at line {line}: no payee or memo"))?;
        Ok(CanonicalTransaction {
            external_id: None,
            account_ref: account_ref.to_string(),
            date,
            description,
            // QIF amounts are already signed: negative = money out.
            amount,
            raw_type: self.number.filter(|n| !n.is_empty()),
        })
    }
}

pub(super) fn parse(text: &str, hint: DateFormat) -> Result<ParseOutcome> {
    let first = text.lines().map(str::trim).find(|l| !l.is_empty());
    if !first.is_some_and(|l| l.starts_with('!')) {
        return Err(SyncError::Parse("not a QIF document (no !Type header)".into()));
    }

    let mut outcome = ParseOutcome::default();
    let mut section = Section::Other;
    let mut account_ref = String::new();
    let mut pending_account: Option<String> = None;
    let mut record = Record::default();

    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim_end();
        if line.trim().is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('!') {
            let header = header.trim().to_ascii_lowercase();
            if header == "account" {
                section = Section::Account;
            } else if let Some(kind) = header.strip_prefix("type:") {
                section = if TRANSACTION_TYPES.contains(&kind.trim()) {
                    Section::Transactions
                } else {
                    Section::Other
                };
            }
            // !Option / !Clear lines leave the section unchanged.
            continue;
        }

        let (code, value) = line.split_at(line.chars().next().map_or(0, char::len_utf8));
        let value = value.trim();

        match section {
            Section::Account => match code {
                "N" => pending_account = Some(value.to_string()),
                "^" => {
                    if let Some(name) = pending_account.take() {
                        account_ref = name;
                    }
                }
                _ => {}
            },
            Section::Transactions => {
                if record.line == 0 {
                    record.line = idx + 1;
                }
                match code {
                    "D" => record.date = Some(value.to_string()),
                    "T" => record.amount = Some(value.to_string()),
                    "U" if record.amount.is_none() => record.amount = Some(value.to_string()),
                    "P" => record.payee = Some(value.to_string()),
                    "M" => record.memo = Some(value.to_string()),
                    "N" => record.number = Some(value.to_string()),
                    "^" => {
                        let done = std::mem::take(&mut record);
                        if !done.is_empty() {
                            outcome.candidates += 1;
                            match done.finish(&account_ref, hint) {
                                Ok(txn) => outcome.records.push(txn),
                                Err(warning) => outcome.skip(warning),
                            }
                        }
                    }
                    // Cleared status, category, address and split lines.
                    _ => {}
                }
            }
            Section::Other => {}
        }
    }

    if !record.is_empty() {
        outcome.candidates += 1;
        match record.finish(&account_ref, hint) {
            Ok(txn) => outcome.records.push(txn),
            Err(warning) => outcome.skip(warning),
        }
    }

    Ok(outcome)
}
