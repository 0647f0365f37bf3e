use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use rusqlite::Connection;

use crate::db::parse_column;
use crate::error::{Result, SyncError};
use crate::models::{ClassificationRule, Condition, MatchType};

enum Matcher {
    Contains(String),
    Exact(String),
    StartsWith(String),
    Regex(Regex),
}

impl Matcher {
    fn compile(rule_id: i64, condition: &Condition) -> Result<Self> {
        let value = condition.match_value.to_uppercase();
        Ok(match condition.match_type {
            MatchType::Contains => Self::Contains(value),
            MatchType::Exact => Self::Exact(value),
            MatchType::StartsWith => Self::StartsWith(value),
            MatchType::Regex => Self::Regex(
                RegexBuilder::new(&condition.match_value)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| SyncError::InvalidPattern {
                        rule_id,
                        message: e.to_string(),
                    })?,
            ),
        })
    }

    /// `desc_upper` is the description upper-cased once per transaction.
    fn is_match(&self, description: &str, desc_upper: &str) -> bool {
        match self {
            Self::Contains(v) => desc_upper.contains(v.as_str()),
            Self::Exact(v) => desc_upper.trim() == v.trim(),
            Self::StartsWith(v) => desc_upper.starts_with(v.as_str()),
            Self::Regex(re) => re.is_match(description),
        }
    }
}

struct CompiledRule {
    id: i64,
    category_id: i64,
    matchers: Vec<Matcher>,
}

impl CompiledRule {
    fn matches(&self, description: &str, desc_upper: &str) -> bool {
        !self.matchers.is_empty() && self.matchers.iter().all(|m| m.is_match(description, desc_upper))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleHit {
    pub rule_id: i64,
    pub category_id: i64,
}

#[derive(Debug, Default)]
pub struct ClassifyResult {
    pub categorized: usize,
    pub outcomes: Vec<(i64, Option<RuleHit>)>,
    /// Still uncategorized after rules; candidates for an external classifier.
    pub uncategorized: Vec<i64>,
    pub invalid_rules: Vec<SyncError>,
}

/// Which transactions to classify. Only uncategorized rows are ever touched.
pub enum Scope<'a> {
    Ids(&'a [i64]),
    AllUncategorized,
}

pub fn load_rules(conn: &Connection) -> Result<Vec<ClassificationRule>> {
    let mut rule_stmt = conn.prepare(
        "SELECT id, name, priority, match_type, match_value, category_id, is_active \
         FROM rules WHERE is_active = 1 ORDER BY id",
    )?;
    let mut rules: Vec<ClassificationRule> = rule_stmt
        .query_map([], |row| {
            let legacy_type: Option<String> = row.get(3)?;
            let legacy_value: Option<String> = row.get(4)?;
            let legacy = match (legacy_type, legacy_value) {
                (Some(t), Some(v)) => Some(Condition {
                    match_type: t.parse().map_err(|_| {
                        rusqlite::Error::InvalidColumnType(3, t.clone(), rusqlite::types::Type::Text)
                    })?,
                    match_value: v,
                }),
                _ => None,
            };
            Ok(ClassificationRule {
                id: row.get(0)?,
                name: row.get(1)?,
                priority: row.get(2)?,
                conditions: Vec::new(),
                legacy,
                category_id: row.get(5)?,
                is_active: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut cond_stmt = conn.prepare(
        "SELECT c.rule_id, c.match_type, c.match_value FROM rule_conditions c \
         JOIN rules r ON r.id = c.rule_id WHERE r.is_active = 1 ORDER BY c.rule_id, c.position",
    )?;
    let mut by_rule: HashMap<i64, Vec<Condition>> = HashMap::new();
    let rows = cond_stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            Condition {
                match_type: parse_column(row, 1)?,
                match_value: row.get(2)?,
            },
        ))
    })?;
    for row in rows {
        let (rule_id, condition) = row?;
        by_rule.entry(rule_id).or_default().push(condition);
    }
    for rule in &mut rules {
        if let Some(conditions) = by_rule.remove(&rule.id) {
            rule.conditions = conditions;
        }
    }

    // Stable: equal priorities stay in creation (id) order.
    rules.sort_by_key(|r| r.priority);
    Ok(rules)
}

fn compile_rules(rules: &[ClassificationRule], invalid: &mut Vec<SyncError>) -> Vec<CompiledRule> {
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules.iter().filter(|r| r.is_active) {
        let matchers: Result<Vec<Matcher>> = rule
            .effective_conditions()
            .iter()
            .map(|c| Matcher::compile(rule.id, c))
            .collect();
        match matchers {
            Ok(matchers) => compiled.push(CompiledRule {
                id: rule.id,
                category_id: rule.category_id,
                matchers,
            }),
            Err(e) => {
                tracing::warn!(rule_id = rule.id, rule = %rule.name, error = %e, "Skipping rule with invalid pattern");
                invalid.push(e);
            }
        }
    }
    compiled
}

/// First matching rule for a description, in evaluation order.
fn first_match(rules: &[CompiledRule], description: &str) -> Option<RuleHit> {
    let desc_upper = description.to_uppercase();
    rules
        .iter()
        .find(|r| r.matches(description, &desc_upper))
        .map(|r| RuleHit {
            rule_id: r.id,
            category_id: r.category_id,
        })
}

fn load_targets(conn: &Connection, scope: Scope<'_>) -> Result<Vec<(i64, String)>> {
    match scope {
        Scope::AllUncategorized => {
            let mut stmt = conn.prepare(
                "SELECT id, description FROM transactions WHERE category_id IS NULL ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        }
        Scope::Ids(ids) => {
            let mut stmt = conn.prepare_cached(
                "SELECT id, description FROM transactions WHERE id = ?1 AND category_id IS NULL",
            )?;
            let mut rows = Vec::with_capacity(ids.len());
            for id in ids {
                let mut found = stmt.query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?;
                if let Some(row) = found.next() {
                    rows.push(row?);
                }
            }
            Ok(rows)
        }
    }
}

/// Assign categories to uncategorized transactions using active rules.
/// A rule with a broken pattern is skipped; it never stops classification.
pub fn classify(conn: &Connection, scope: Scope<'_>) -> Result<ClassifyResult> {
    let mut result = ClassifyResult::default();
    let rules = load_rules(conn)?;
    let compiled = compile_rules(&rules, &mut result.invalid_rules);
    let targets = load_targets(conn, scope)?;

    let tx = conn.unchecked_transaction()?;
    for (txn_id, description) in targets {
        let hit = first_match(&compiled, &description);
        match hit {
            Some(hit) => {
                tx.execute(
                    "UPDATE transactions SET category_id = ?1 WHERE id = ?2 AND category_id IS NULL",
                    rusqlite::params![hit.category_id, txn_id],
                )?;
                tx.execute(
                    "UPDATE rules SET hit_count = hit_count + 1 WHERE id = ?1",
                    [hit.rule_id],
                )?;
                result.categorized += 1;
            }
            None => result.uncategorized.push(txn_id),
        }
        result.outcomes.push((txn_id, hit));
    }
    tx.commit()?;

    Ok(result)
}

// ---------------------------------------------------------------------------
// Rule management
// ---------------------------------------------------------------------------

pub fn add_rule(
    conn: &Connection,
    name: &str,
    category_id: i64,
    priority: i64,
    conditions: &[Condition],
) -> Result<i64> {
    if conditions.is_empty() {
        return Err(SyncError::Other("a rule needs at least one condition".into()));
    }
    // Reject broken patterns up front; stored ones are still re-checked at run time.
    for condition in conditions {
        Matcher::compile(0, condition)?;
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO rules (name, category_id, priority) VALUES (?1, ?2, ?3)",
        rusqlite::params![name, category_id, priority],
    )?;
    let rule_id = tx.last_insert_rowid();
    for (position, condition) in conditions.iter().enumerate() {
        tx.execute(
            "INSERT INTO rule_conditions (rule_id, position, match_type, match_value) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![rule_id, position as i64, condition.match_type.as_str(), condition.match_value],
        )?;
    }
    tx.commit()?;
    Ok(rule_id)
}

/// Deactivate a rule. Returns false when no active rule has that id.
pub fn deactivate_rule(conn: &Connection, rule_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE rules SET is_active = 0 WHERE id = ?1 AND is_active = 1",
        [rule_id],
    )?;
    Ok(changed == 1)
}

/// Parse `match_type:value`, e.g. `contains:coffee` or `regex:^AWS.*\d+$`.
pub fn parse_condition(raw: &str) -> Result<Condition> {
    let (kind, value) = raw
        .split_once(':')
        .ok_or_else(|| SyncError::Other(format!("condition '{raw}' must look like type:value")))?;
    if value.is_empty() {
        return Err(SyncError::Other(format!("condition '{raw}' has an empty value")));
    }
    Ok(Condition {
        match_type: kind.trim().parse()?,
        match_value: value.to_string(),
    })
}
