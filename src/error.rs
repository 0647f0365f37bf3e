use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No local account mapped for remote account '{0}'")]
    UnmappedAccount(String),

    #[error("Connection {0} is already running")]
    AlreadyRunning(i64),

    #[error("Credentials rejected by institution: {0}")]
    AdapterAuth(String),

    #[error("Scraper timed out after {0:?}")]
    AdapterTimeout(std::time::Duration),

    #[error("Scraper failed: {0}")]
    Adapter(String),

    #[error("Invalid pattern in rule {rule_id}: {message}")]
    InvalidPattern { rule_id: i64, message: String },

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    #[error("Unknown scraper: {0}")]
    UnknownScraper(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
