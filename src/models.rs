use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SyncError;

/// Normalized record produced by every format adapter before reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTransaction {
    pub external_id: Option<String>,
    /// Remote account identifier as reported by the source.
    pub account_ref: String,
    pub date: NaiveDate,
    pub description: String,
    /// Negative = debit, positive = credit.
    pub amount: Decimal,
    pub raw_type: Option<String>,
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(SyncError::Config(format!(
                        "invalid {}: '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Pending,
    Cleared,
    Failed,
}

string_enum!(TxnStatus {
    Pending => "pending",
    Cleared => "cleared",
    Failed => "failed",
});

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: i64,
    pub account_id: i64,
    pub date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub category_id: Option<i64>,
    pub status: TxnStatus,
    pub external_id: Option<String>,
    pub transfer_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub account_type: String,
    pub institution: Option<String>,
    pub account_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Running,
    Error,
}

string_enum!(ConnectionStatus {
    Idle => "idle",
    Running => "running",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Manual,
}

string_enum!(Frequency {
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
    Manual => "manual",
});

/// Day/month ordering hint for sources whose dates are ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateFormat {
    #[default]
    Mdy,
    Dmy,
    Ymd,
}

string_enum!(DateFormat {
    Mdy => "MM/DD/YYYY",
    Dmy => "DD/MM/YYYY",
    Ymd => "YYYY-MM-DD",
});

/// Institution login details. Wiped from memory on drop.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_pin: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("security_pin", &self.security_pin.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Remote account name (or composite key) to local account id.
pub type AccountsMap = BTreeMap<String, i64>;

/// Adapter-specific connection settings, stored as the connection's metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterSettings {
    /// Also sync redraw/offset sub-accounts attached to loan products.
    pub track_offset_accounts: bool,
    /// Only fetch these remote accounts (empty = all).
    pub account_filter: Vec<String>,
    /// Source file replayed by the fixture scraper.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixture_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BankConnection {
    pub id: i64,
    pub scraper_slug: String,
    pub name: String,
    pub credentials: Credentials,
    pub status: ConnectionStatus,
    pub date_format: DateFormat,
    pub accounts_map: AccountsMap,
    pub metadata: AdapterSettings,
    pub frequency: Frequency,
    pub preferred_time: Option<NaiveTime>,
    pub timezone: Tz,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Running,
    Success,
    Failed,
}

string_enum!(AuditStatus {
    Running => "running",
    Success => "success",
    Failed => "failed",
});

#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub connection_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: AuditStatus,
    pub inserts: i64,
    pub duplicates: i64,
    /// Records dropped with a warning (unmapped account, unparseable).
    pub skipped: i64,
    pub categorized: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Contains,
    Exact,
    StartsWith,
    Regex,
}

string_enum!(MatchType {
    Contains => "contains",
    Exact => "exact",
    StartsWith => "starts_with",
    Regex => "regex",
});

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub match_type: MatchType,
    pub match_value: String,
}

#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub id: i64,
    pub name: String,
    pub priority: i64,
    /// Empty for legacy single-condition rules; see `effective_conditions`.
    pub conditions: Vec<Condition>,
    pub legacy: Option<Condition>,
    pub category_id: i64,
    pub is_active: bool,
}

impl ClassificationRule {
    /// Conditions to evaluate: the condition list, or the legacy pair when
    /// the rule predates multi-condition rules.
    pub fn effective_conditions(&self) -> Vec<Condition> {
        if !self.conditions.is_empty() {
            self.conditions.clone()
        } else {
            self.legacy.iter().cloned().collect()
        }
    }
}

/// Accounts reported by a scraper, before mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub name: String,
    #[serde(default)]
    pub number: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!("starts_with".parse::<MatchType>().unwrap(), MatchType::StartsWith);
        assert_eq!(Frequency::Weekly.as_str(), "weekly");
        assert_eq!("DD/MM/YYYY".parse::<DateFormat>().unwrap(), DateFormat::Dmy);
        assert!("hourly".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_legacy_rule_has_single_condition() {
        let rule = ClassificationRule {
            id: 1,
            name: "legacy".into(),
            priority: 0,
            conditions: vec![],
            legacy: Some(Condition {
                match_type: MatchType::Contains,
                match_value: "COFFEE".into(),
            }),
            category_id: 3,
            is_active: true,
        };
        assert_eq!(rule.effective_conditions().len(), 1);
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = Credentials {
            username: "alice".into(),
            password: "hunter2".into(),
            security_pin: Some("1234".into()),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("1234"));
    }

    #[test]
    fn test_adapter_settings_reject_unknown_keys() {
        let err = serde_json::from_str::<AdapterSettings>(r#"{"track_offsets": true}"#);
        assert!(err.is_err());
        let ok: AdapterSettings = serde_json::from_str(r#"{"track_offset_accounts": true}"#).unwrap();
        assert!(ok.track_offset_accounts);
        assert!(ok.account_filter.is_empty());
    }
}
