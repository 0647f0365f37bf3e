use std::path::PathBuf;

use crate::db::{get_connection, init_db};
use crate::error::Result;
use crate::settings::{load_settings, save_settings, shellexpand_path};

pub fn run(data_dir: Option<String>) -> Result<()> {
    let mut settings = load_settings();
    if let Some(dir) = data_dir {
        settings.data_dir = shellexpand_path(&dir);
    }
    save_settings(&settings)?;

    let resolved = PathBuf::from(&settings.data_dir);
    std::fs::create_dir_all(&resolved)?;
    std::fs::create_dir_all(settings.scraper_dir())?;

    let conn = get_connection(&settings.db_path())?;
    init_db(&conn)?;

    println!("Initialized ledgersync at {}", resolved.display());
    println!("Scrapers are looked up in {}", settings.scraper_dir().display());
    Ok(())
}
