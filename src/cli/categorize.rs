use colored::Colorize;

use crate::categorizer::{classify, Scope};
use crate::error::Result;

use super::open_db;

pub fn run() -> Result<()> {
    let (_, conn) = open_db()?;
    let result = classify(&conn, Scope::AllUncategorized)?;
    for invalid in &result.invalid_rules {
        println!("{} {invalid}", "Skipped rule:".yellow());
    }
    println!(
        "{} categorized, {} still uncategorized",
        result.categorized,
        result.uncategorized.len()
    );
    Ok(())
}
