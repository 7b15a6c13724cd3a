use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::Serialize;
use ustat_warehouse::SurrogateKey;

use crate::access::AccessRole;
use crate::content::ArticleAge;

/// Why a line produced no fact row without being an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BlankLine,
    Comment,
    Malformed,
    MissingTimestamp,
    BadTimestamp,
    MissingService,
    BadStatus,
    ErrorStatus,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::BlankLine => "blank line",
            SkipReason::Comment => "comment",
            SkipReason::Malformed => "malformed line",
            SkipReason::MissingTimestamp => "missing timestamp",
            SkipReason::BadTimestamp => "bad timestamp",
            SkipReason::MissingService => "missing service",
            SkipReason::BadStatus => "bad http status",
            SkipReason::ErrorStatus => "error http status",
        }
    }
}

/// Why a well-formed event had to be given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    PrimaryUnavailable,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::PrimaryUnavailable => "primary identity unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Emitted { year: i32 },
    Skipped(SkipReason),
    Abandoned(AbandonReason),
}

/// Keys and derived values filled in while an event is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedKeys {
    pub session: Option<SurrogateKey>,
    pub identity: Option<SurrogateKey>,
    pub syndicate: Option<SurrogateKey>,
    pub country: Option<SurrogateKey>,
    pub content: Option<SurrogateKey>,
    pub license: Option<SurrogateKey>,
    pub access: Option<SurrogateKey>,
    pub role: Option<AccessRole>,
    pub age: Option<ArticleAge>,
    pub counts: bool,
}

/// One parsed access-log line and everything resolved for it so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub timestamp: NaiveDateTime,
    pub service: String,
    pub status: u16,
    pub ip: Option<String>,
    pub session_id: Option<String>,
    pub identity_ids: Vec<String>,
    pub primary_id: Option<String>,
    pub license_id: Option<String>,
    pub content_path: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub resolved: ResolvedKeys,
}

impl AccessEvent {
    pub fn new(timestamp: NaiveDateTime, service: impl Into<String>, status: u16) -> Self {
        Self {
            timestamp,
            service: service.into(),
            status,
            ip: None,
            session_id: None,
            identity_ids: Vec::new(),
            primary_id: None,
            license_id: None,
            content_path: None,
            user_agent: None,
            referrer: None,
            resolved: ResolvedKeys::default(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    pub fn year(&self) -> i32 {
        self.timestamp.year()
    }
}
