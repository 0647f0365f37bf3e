use comfy_table::{Cell, Table};

use crate::categorizer::{add_rule, deactivate_rule, load_rules, parse_condition};
use crate::db::category_id;
use crate::error::{Result, SyncError};
use crate::models::Condition;

use super::open_db;

fn describe(conditions: &[Condition]) -> String {
    conditions
        .iter()
        .map(|c| format!("{} '{}'", c.match_type, c.match_value))
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub fn add(name: &str, category: &str, conditions: &[String], priority: i64) -> Result<()> {
    let (_, conn) = open_db()?;
    let cat_id = category_id(&conn, category)?;
    let parsed = conditions
        .iter()
        .map(|c| parse_condition(c))
        .collect::<Result<Vec<_>>>()?;
    let id = add_rule(&conn, name, cat_id, priority, &parsed)?;
    println!("Added rule {id}: {} \u{2192} {category}", describe(&parsed));
    Ok(())
}

pub fn list() -> Result<()> {
    let (_, conn) = open_db()?;
    let rules = load_rules(&conn)?;
    let mut hits_stmt = conn.prepare("SELECT c.name, r.hit_count FROM rules r JOIN categories c ON r.category_id = c.id WHERE r.id = ?1")?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Priority", "Name", "Conditions", "Category", "Hits"]);
    for rule in &rules {
        let (category, hits): (String, i64) =
            hits_stmt.query_row([rule.id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        table.add_row(vec![
            Cell::new(rule.id),
            Cell::new(rule.priority),
            Cell::new(&rule.name),
            Cell::new(describe(&rule.effective_conditions())),
            Cell::new(category),
            Cell::new(hits),
        ]);
    }
    println!("Rules (evaluated top to bottom)\n{table}");
    Ok(())
}

pub fn delete(id: i64) -> Result<()> {
    let (_, conn) = open_db()?;
    if deactivate_rule(&conn, id)? {
        println!("Deleted rule {id}");
        Ok(())
    } else {
        Err(SyncError::Other(format!("No active rule with ID {id}")))
    }
}
