use std::collections::{BTreeMap, HashMap};

use rusqlite::Connection;

use crate::error::{Result, SyncError};
use crate::models::{AccountsMap, CanonicalTransaction, RemoteAccount};

/// Stable identifiers for remote accounts: the account name, with a
/// ` (…1234)` number suffix only when another account shares the name.
pub fn account_keys(accounts: &[RemoteAccount]) -> Vec<String> {
    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for account in accounts {
        *name_counts.entry(account.name.as_str()).or_default() += 1;
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    accounts
        .iter()
        .map(|account| {
            let name = account.name.trim();
            if name_counts[account.name.as_str()] < 2 {
                return name.to_string();
            }
            let nth = seen.entry(account.name.as_str()).or_default();
            *nth += 1;
            let digits: String = account
                .number
                .as_deref()
                .unwrap_or_default()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect();
            if digits.is_empty() {
                format!("{name} (#{nth})")
            } else {
                let tail: String = digits.chars().skip(digits.chars().count().saturating_sub(4)).collect();
                format!("{name} (…{tail})")
            }
        })
        .collect()
}

/// Distinct identifiers found during a connection test; no mapping required.
pub fn discovered_accounts(accounts: &[RemoteAccount]) -> Vec<String> {
    let mut keys = account_keys(accounts);
    let mut seen = std::collections::HashSet::new();
    keys.retain(|k| seen.insert(k.clone()));
    keys
}

pub fn resolve(map: &AccountsMap, remote: &str) -> Result<i64> {
    map.get(remote)
        .copied()
        .ok_or_else(|| SyncError::UnmappedAccount(remote.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvePolicy {
    Require,
    AutoCreate,
}

/// Resolve a file's account identifier against local accounts by number,
/// then name. With `AutoCreate`, an unknown identifier becomes a new account.
pub fn resolve_or_create(conn: &Connection, remote: &str, policy: ResolvePolicy) -> Result<i64> {
    let remote = remote.trim();
    if remote.is_empty() {
        return Err(SyncError::UnmappedAccount(String::new()));
    }
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM accounts WHERE account_number = ?1 OR name = ?1 \
             ORDER BY account_number = ?1 DESC, id LIMIT 1",
            [remote],
            |row| row.get(0),
        )
        .ok();
    match (existing, policy) {
        (Some(id), _) => Ok(id),
        (None, ResolvePolicy::Require) => Err(SyncError::UnmappedAccount(remote.to_string())),
        (None, ResolvePolicy::AutoCreate) => {
            conn.execute(
                "INSERT INTO accounts (name, account_type, account_number) VALUES (?1, 'imported', ?1)",
                [remote],
            )?;
            let id = conn.last_insert_rowid();
            tracing::info!(account = %remote, account_id = id, "Created local account for import");
            Ok(id)
        }
    }
}

/// Records grouped per local account in first-seen order, plus what could
/// not be mapped.
#[derive(Debug, Default)]
pub struct Assignment {
    pub groups: Vec<(i64, Vec<CanonicalTransaction>)>,
    /// Remote identifier → number of records skipped.
    pub unmapped: BTreeMap<String, usize>,
}

impl Assignment {
    pub fn skipped(&self) -> usize {
        self.unmapped.values().sum()
    }
}

/// Assign each record a local account using `lookup`. Records whose account
/// cannot be resolved are counted, never misfiled.
pub fn assign_accounts<F>(records: Vec<CanonicalTransaction>, mut lookup: F) -> Result<Assignment>
where
    F: FnMut(&str) -> Result<i64>,
{
    let mut assignment = Assignment::default();
    let mut index: HashMap<i64, usize> = HashMap::new();
    let mut resolved: HashMap<String, Option<i64>> = HashMap::new();

    for record in records {
        let account_id = match resolved.get(&record.account_ref) {
            Some(cached) => *cached,
            None => {
                let outcome = match lookup(&record.account_ref) {
                    Ok(id) => Some(id),
                    Err(SyncError::UnmappedAccount(_)) => None,
                    Err(e) => return Err(e),
                };
                resolved.insert(record.account_ref.clone(), outcome);
                outcome
            }
        };
        match account_id {
            Some(id) => {
                let slot = *index.entry(id).or_insert_with(|| {
                    assignment.groups.push((id, Vec::new()));
                    assignment.groups.len() - 1
                });
                assignment.groups[slot].1.push(record);
            }
            None => {
                *assignment.unmapped.entry(record.account_ref).or_default() += 1;
            }
        }
    }

    for (remote, count) in &assignment.unmapped {
        tracing::warn!(remote_account = %remote, records = count, "Skipping records for unmapped account");
    }
    Ok(assignment)
}

#[derive(Debug, Default, PartialEq)]
pub struct MappingSuggestion {
    pub bound: Vec<(String, i64)>,
    pub unbound: Vec<String>,
}

/// Bind identifiers not yet in `map` to local accounts with the same name.
pub fn suggest_mappings(
    conn: &Connection,
    identifiers: &[String],
    map: &AccountsMap,
) -> Result<MappingSuggestion> {
    let mut suggestion = MappingSuggestion::default();
    let mut stmt = conn.prepare_cached("SELECT id FROM accounts WHERE name = ?1 COLLATE NOCASE")?;
    for ident in identifiers {
        if map.contains_key(ident) {
            continue;
        }
        let found: Option<i64> = stmt.query_row([ident], |row| row.get(0)).ok();
        match found {
            Some(id) => suggestion.bound.push((ident.clone(), id)),
            None => suggestion.unbound.push(ident.clone()),
        }
    }
    Ok(suggestion)
}
