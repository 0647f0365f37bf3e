//! Institution scrapers.
//!
//! Each institution is a black box reached through [`ScraperAdapter`]. The
//! built-in variants run an external program, `<scraper_dir>/<slug>`, that
//! reads one JSON request on stdin and answers with one JSON document on
//! stdout:
//!
//! ```json
//! {"action": "fetch_transactions", "credentials": {...},
//!  "account_filter": [], "settings": {...}}
//! ```
//!
//! Success is `{"ok": true, "accounts": [...]}` in the scraped batch shape.
//! Failure is `{"ok": false, "error": "auth", "message": "..."}`; any error
//! kind other than `auth` is a generic scraper failure.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use zeroize::Zeroizing;

use crate::error::{Result, SyncError};
use crate::models::{AdapterSettings, Credentials, RemoteAccount};
use crate::settings::Settings;

/// Captured stderr is cut to this many bytes in error messages.
const STDERR_TAIL: usize = 400;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScraperKind {
    Commbank,
    Anz,
    Westpac,
    Nab,
    StGeorge,
    Ing,
    Fixture,
}

impl ScraperKind {
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Commbank => "commbank",
            Self::Anz => "anz",
            Self::Westpac => "westpac",
            Self::Nab => "nab",
            Self::StGeorge => "stgeorge",
            Self::Ing => "ing",
            Self::Fixture => "fixture",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Commbank => "Commonwealth Bank",
            Self::Anz => "ANZ",
            Self::Westpac => "Westpac",
            Self::Nab => "NAB",
            Self::StGeorge => "St.George Bank",
            Self::Ing => "ING",
            Self::Fixture => "Fixture file (testing)",
        }
    }

    pub fn requires_security_pin(&self) -> bool {
        matches!(self, Self::StGeorge)
    }

    /// Check connection settings for this variant before they are stored.
    pub fn validate_settings(&self, settings: &AdapterSettings) -> Result<()> {
        match (self, &settings.fixture_path) {
            (Self::Fixture, None) => Err(SyncError::Config(
                "the fixture scraper needs fixture_path".into(),
            )),
            (Self::Fixture, Some(_)) => Ok(()),
            (_, Some(_)) => Err(SyncError::Config(format!(
                "fixture_path is only valid for the fixture scraper, not {}",
                self.slug()
            ))),
            (_, None) => Ok(()),
        }
    }

    pub fn validate_credentials(&self, credentials: &Credentials) -> Result<()> {
        if credentials.username.trim().is_empty() {
            return Err(SyncError::Config("username is required".into()));
        }
        let has_pin = credentials
            .security_pin
            .as_deref()
            .is_some_and(|p| !p.is_empty());
        if self.requires_security_pin() && !has_pin {
            return Err(SyncError::Config(format!(
                "{} requires a security number",
                self.name()
            )));
        }
        Ok(())
    }
}

pub const ALL_SCRAPERS: &[ScraperKind] = &[
    ScraperKind::Commbank,
    ScraperKind::Anz,
    ScraperKind::Westpac,
    ScraperKind::Nab,
    ScraperKind::StGeorge,
    ScraperKind::Ing,
    ScraperKind::Fixture,
];

pub fn get_by_slug(slug: &str) -> Option<ScraperKind> {
    ALL_SCRAPERS
        .iter()
        .find(|k| k.slug().eq_ignore_ascii_case(slug.trim()))
        .copied()
}

// ---------------------------------------------------------------------------
// Adapter capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoginOutcome {
    pub ok: bool,
    pub accounts: Vec<RemoteAccount>,
    pub message: Option<String>,
}

#[async_trait]
pub trait ScraperAdapter: Send + Sync {
    fn requires_security_pin(&self) -> bool {
        false
    }

    /// Log in and list the remote accounts. A rejected login is `ok: false`,
    /// not an error.
    async fn test_login(
        &self,
        credentials: &Credentials,
        settings: &AdapterSettings,
    ) -> Result<LoginOutcome>;

    /// Fetch transactions for the accounts in `settings.account_filter`
    /// (all accounts when empty), in the scraped batch shape.
    async fn fetch_transactions(
        &self,
        credentials: &Credentials,
        settings: &AdapterSettings,
    ) -> Result<Value>;
}

/// Source of adapters by slug. The orchestrator only sees this seam.
pub trait AdapterRegistry: Send + Sync {
    fn adapter(&self, slug: &str) -> Result<Box<dyn ScraperAdapter>>;
}

pub struct BuiltinAdapters {
    scraper_dir: PathBuf,
}

impl BuiltinAdapters {
    pub fn new(scraper_dir: PathBuf) -> Self {
        Self { scraper_dir }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.scraper_dir())
    }
}

impl AdapterRegistry for BuiltinAdapters {
    fn adapter(&self, slug: &str) -> Result<Box<dyn ScraperAdapter>> {
        let kind = get_by_slug(slug).ok_or_else(|| SyncError::UnknownScraper(slug.to_string()))?;
        Ok(match kind {
            ScraperKind::Fixture => Box::new(FixtureScraper),
            kind => Box::new(CommandScraper {
                kind,
                program: self.scraper_dir.join(kind.slug()),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Failure {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a scraper's JSON answer to success or the matching error. A missing
/// `ok` counts as success.
pub(crate) fn interpret_response(value: Value) -> Result<Value> {
    if value.get("ok").and_then(Value::as_bool) != Some(false) {
        return Ok(value);
    }
    let failure: Failure = serde_json::from_value(value).unwrap_or(Failure {
        error: None,
        message: None,
    });
    let message = failure
        .message
        .unwrap_or_else(|| "no message from scraper".to_string());
    match failure.error.as_deref() {
        Some("auth") => Err(SyncError::AdapterAuth(message)),
        Some(kind) => Err(SyncError::Adapter(format!("{kind}: {message}"))),
        None => Err(SyncError::Adapter(message)),
    }
}

fn login_from_response(response: Result<Value>) -> Result<LoginOutcome> {
    match response {
        Ok(value) => {
            let accounts = match value.get("accounts") {
                Some(list) => serde_json::from_value::<Vec<RemoteAccount>>(list.clone())
                    .map_err(|e| SyncError::Adapter(format!("bad account list: {e}")))?,
                None => Vec::new(),
            };
            Ok(LoginOutcome {
                ok: true,
                accounts,
                message: None,
            })
        }
        Err(SyncError::AdapterAuth(message)) => Ok(LoginOutcome {
            ok: false,
            accounts: Vec::new(),
            message: Some(message),
        }),
        Err(e) => Err(e),
    }
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    let mut start = text.len().saturating_sub(STDERR_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

// ---------------------------------------------------------------------------
// External program
// ---------------------------------------------------------------------------

pub struct CommandScraper {
    kind: ScraperKind,
    program: PathBuf,
}

impl CommandScraper {
    /// Run one request. The child is killed if this future is dropped, which
    /// is how the caller's timeout takes effect.
    async fn call(
        &self,
        action: &str,
        credentials: &Credentials,
        settings: &AdapterSettings,
    ) -> Result<Value> {
        if !self.program.is_file() {
            return Err(SyncError::Adapter(format!(
                "no scraper installed for {} at {}",
                self.kind.slug(),
                self.program.display()
            )));
        }

        let request = Zeroizing::new(serde_json::to_vec(&json!({
            "action": action,
            "credentials": credentials,
            "account_filter": settings.account_filter,
            "settings": settings,
        }))?);

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SyncError::Adapter(format!("failed to start {}: {e}", self.program.display()))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The scraper may exit before reading everything; its answer decides.
            let _ = stdin.write_all(&request).await;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(value) => interpret_response(value),
            Err(_) if !output.status.success() => Err(SyncError::Adapter(format!(
                "{} exited with {}: {}",
                self.kind.slug(),
                output.status,
                tail(&stderr)
            ))),
            Err(e) => Err(SyncError::Adapter(format!(
                "{} wrote invalid JSON: {e}",
                self.kind.slug()
            ))),
        }
    }
}

#[async_trait]
impl ScraperAdapter for CommandScraper {
    fn requires_security_pin(&self) -> bool {
        self.kind.requires_security_pin()
    }

    async fn test_login(
        &self,
        credentials: &Credentials,
        settings: &AdapterSettings,
    ) -> Result<LoginOutcome> {
        login_from_response(self.call("test_login", credentials, settings).await)
    }

    async fn fetch_transactions(
        &self,
        credentials: &Credentials,
        settings: &AdapterSettings,
    ) -> Result<Value> {
        self.call("fetch_transactions", credentials, settings).await
    }
}

// ---------------------------------------------------------------------------
// Fixture replay
// ---------------------------------------------------------------------------

/// Replays a scraped batch from `settings.fixture_path`.
pub struct FixtureScraper;

impl FixtureScraper {
    async fn load(settings: &AdapterSettings) -> Result<Value> {
        let path = settings
            .fixture_path
            .as_ref()
            .ok_or_else(|| SyncError::Config("the fixture scraper needs fixture_path".into()))?;
        let raw = tokio::fs::read(path).await?;
        let value: Value = serde_json::from_slice(&raw)
            .map_err(|e| SyncError::Adapter(format!("fixture {} is not JSON: {e}", path.display())))?;
        interpret_response(value)
    }
}

#[async_trait]
impl ScraperAdapter for FixtureScraper {
    async fn test_login(
        &self,
        _credentials: &Credentials,
        settings: &AdapterSettings,
    ) -> Result<LoginOutcome> {
        login_from_response(Self::load(settings).await)
    }

    async fn fetch_transactions(
        &self,
        _credentials: &Credentials,
        settings: &AdapterSettings,
    ) -> Result<Value> {
        let mut batch = Self::load(settings).await?;
        if !settings.account_filter.is_empty() {
            if let Some(accounts) = batch.get_mut("accounts").and_then(Value::as_array_mut) {
                accounts.retain(|a| {
                    a.get("name")
                        .and_then(Value::as_str)
                        .is_some_and(|name| settings.account_filter.iter().any(|f| f == name))
                });
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(pin: Option<&str>) -> Credentials {
        Credentials {
            username: "jo".into(),
            password: "secret".into(),
            security_pin: pin.map(str::to_string),
        }
    }

    #[test]
    fn test_get_by_slug() {
        assert_eq!(get_by_slug("CommBank"), Some(ScraperKind::Commbank));
        assert_eq!(get_by_slug("fixture"), Some(ScraperKind::Fixture));
        assert_eq!(get_by_slug("monzo"), None);
        for kind in ALL_SCRAPERS {
            assert_eq!(get_by_slug(kind.slug()), Some(*kind));
        }
    }

    #[test]
    fn test_adapters_report_security_pin() {
        let registry = BuiltinAdapters::new(PathBuf::from("/nonexistent"));
        assert!(registry.adapter("stgeorge").unwrap().requires_security_pin());
        assert!(!registry.adapter("anz").unwrap().requires_security_pin());
        assert!(!registry.adapter("fixture").unwrap().requires_security_pin());
        assert!(matches!(registry.adapter("monzo"), Err(SyncError::UnknownScraper(_))));
    }

    #[test]
    fn test_security_pin_requirement() {
        let stgeorge = ScraperKind::StGeorge;
        assert!(stgeorge.requires_security_pin());
        assert!(stgeorge.validate_credentials(&creds(None)).is_err());
        assert!(stgeorge.validate_credentials(&creds(Some(""))).is_err());
        assert!(stgeorge.validate_credentials(&creds(Some("1234"))).is_ok());
        assert!(ScraperKind::Anz.validate_credentials(&creds(None)).is_ok());
    }

    #[test]
    fn test_validate_settings_per_variant() {
        let with_fixture = AdapterSettings {
            fixture_path: Some("/tmp/batch.json".into()),
            ..Default::default()
        };
        assert!(ScraperKind::Fixture.validate_settings(&with_fixture).is_ok());
        assert!(ScraperKind::Fixture.validate_settings(&AdapterSettings::default()).is_err());
        assert!(ScraperKind::Nab.validate_settings(&with_fixture).is_err());
        assert!(ScraperKind::Nab.validate_settings(&AdapterSettings::default()).is_ok());
    }

    #[test]
    fn test_interpret_response() {
        assert!(interpret_response(json!({"ok": true, "accounts": []})).is_ok());
        assert!(interpret_response(json!({"accounts": []})).is_ok());
        assert!(matches!(
            interpret_response(json!({"ok": false, "error": "auth", "message": "bad password"})),
            Err(SyncError::AdapterAuth(m)) if m == "bad password"
        ));
        assert!(matches!(
            interpret_response(json!({"ok": false, "error": "captcha", "message": "blocked"})),
            Err(SyncError::Adapter(m)) if m == "captcha: blocked"
        ));
    }

    #[test]
    fn test_rejected_login_is_not_an_error() {
        let outcome =
            login_from_response(Err(SyncError::AdapterAuth("locked out".into()))).unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.message.as_deref(), Some("locked out"));
        assert!(login_from_response(Err(SyncError::Adapter("boom".into()))).is_err());
    }

    #[test]
    fn test_tail_keeps_end_of_output() {
        let long = format!("{}END", "x".repeat(1000));
        assert!(tail(&long).ends_with("END"));
        assert_eq!(tail(&long).len(), STDERR_TAIL);
    }

    #[tokio::test]
    async fn test_fixture_replays_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(
            &path,
            json!({"accounts": [
                {"name": "Checking", "number": "123", "transactions": []},
                {"name": "Savings", "transactions": []}
            ]})
            .to_string(),
        )
        .unwrap();
        let mut settings = AdapterSettings {
            fixture_path: Some(path),
            ..Default::default()
        };

        let login = FixtureScraper.test_login(&creds(None), &settings).await.unwrap();
        assert!(login.ok);
        assert_eq!(login.accounts.len(), 2);
        assert_eq!(login.accounts[0].number.as_deref(), Some("123"));

        settings.account_filter = vec!["Savings".into()];
        let batch = FixtureScraper.fetch_transactions(&creds(None), &settings).await.unwrap();
        assert_eq!(batch["accounts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_program_is_adapter_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BuiltinAdapters::new(dir.path().to_path_buf());
        let adapter = registry.adapter("anz").unwrap();
        let err = adapter
            .fetch_transactions(&creds(None), &AdapterSettings::default())
            .await;
        assert!(matches!(err, Err(SyncError::Adapter(_))));
        assert!(matches!(registry.adapter("monzo"), Err(SyncError::UnknownScraper(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_protocol_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ing");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho '{\"ok\": false, \"error\": \"auth\", \"message\": \"wrong password\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let adapter = BuiltinAdapters::new(dir.path().to_path_buf()).adapter("ing").unwrap();
        let login = adapter
            .test_login(&creds(None), &AdapterSettings::default())
            .await
            .unwrap();
        assert!(!login.ok);
        assert_eq!(login.message.as_deref(), Some("wrong password"));
    }
}
