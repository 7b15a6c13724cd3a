//! Fixed set of warehouse dimensions and how their values are normalized
//! and stored.

mod resolver;

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use ustat_external::ContentKey;

pub use resolver::DimensionResolver;

/// Composite content value used when an event names no usable content.
pub const UNKNOWN_CONTENT: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Date,
    Country,
    Service,
    HttpStatus,
    UserAgent,
    Referrer,
    ContentItem,
    License,
    Access,
    SyndicateGroup,
    SyndicateMember,
    Identity,
    Session,
    SessionMember,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    Verbatim,
    Lowercase,
    CountryCode,
    HttpStatus,
    IsoDate,
    Referrer,
    ContentPath,
    KeyList,
}

/// Derived columns written alongside the natural value on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStrategy {
    Generic,
    Calendar,
    StatusClass,
    ContentLevels,
    AccessTuple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Small enumerable domain, cached without bound.
    Small,
    /// Watermark-bounded.
    Large,
    /// The owning component keeps its own cache.
    Uncached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionDescriptor {
    pub dimension: Dimension,
    pub table: &'static str,
    pub value_column: &'static str,
    pub normalizer: Normalizer,
    pub insert: InsertStrategy,
    /// Longer values are truncated, never rejected.
    pub max_len: usize,
    pub cache: CacheClass,
    /// Cache is dropped whenever the input date advances.
    pub date_scoped: bool,
}

impl Dimension {
    pub const ALL: [Dimension; 14] = [
        Dimension::Date,
        Dimension::Country,
        Dimension::Service,
        Dimension::HttpStatus,
        Dimension::UserAgent,
        Dimension::Referrer,
        Dimension::ContentItem,
        Dimension::License,
        Dimension::Access,
        Dimension::SyndicateGroup,
        Dimension::SyndicateMember,
        Dimension::Identity,
        Dimension::Session,
        Dimension::SessionMember,
    ];

    pub const fn descriptor(self) -> DimensionDescriptor {
        use CacheClass::*;
        use InsertStrategy::*;
        let (table, value_column, normalizer, insert, max_len, cache, date_scoped) =
            match self {
                Dimension::Date => {
                    ("date", "day", Normalizer::IsoDate, Calendar, 10, Small, false)
                }
                Dimension::Country => (
                    "country",
                    "code",
                    Normalizer::CountryCode,
                    Generic,
                    8,
                    Small,
                    false,
                ),
                Dimension::Service => {
                    ("service", "name", Normalizer::Lowercase, Generic, 64, Small, false)
                }
                Dimension::HttpStatus => (
                    "http_status",
                    "code",
                    Normalizer::HttpStatus,
                    StatusClass,
                    3,
                    Small,
                    false,
                ),
                Dimension::UserAgent => (
                    "user_agent",
                    "agent",
                    Normalizer::Verbatim,
                    Generic,
                    255,
                    Large,
                    false,
                ),
                Dimension::Referrer => (
                    "referrer",
                    "url",
                    Normalizer::Referrer,
                    Generic,
                    255,
                    Large,
                    false,
                ),
                Dimension::ContentItem => (
                    "content_item",
                    "path",
                    Normalizer::ContentPath,
                    ContentLevels,
                    128,
                    Large,
                    true,
                ),
                Dimension::License => (
                    "license",
                    "license_id",
                    Normalizer::Verbatim,
                    Generic,
                    64,
                    Large,
                    false,
                ),
                Dimension::Access => (
                    "access",
                    "class",
                    Normalizer::Verbatim,
                    AccessTuple,
                    128,
                    Small,
                    false,
                ),
                Dimension::SyndicateGroup => (
                    "syndicate_group",
                    "members",
                    Normalizer::KeyList,
                    Generic,
                    4000,
                    Large,
                    false,
                ),
                Dimension::SyndicateMember => (
                    "syndicate_member",
                    "membership",
                    Normalizer::Verbatim,
                    Generic,
                    64,
                    Uncached,
                    false,
                ),
                Dimension::Identity => (
                    "identity",
                    "external_id",
                    Normalizer::Verbatim,
                    Generic,
                    255,
                    Uncached,
                    false,
                ),
                Dimension::Session => (
                    "session",
                    "session_id",
                    Normalizer::Verbatim,
                    Generic,
                    128,
                    Uncached,
                    true,
                ),
                Dimension::SessionMember => (
                    "session_identity",
                    "membership",
                    Normalizer::Verbatim,
                    Generic,
                    64,
                    Uncached,
                    false,
                ),
            };
        DimensionDescriptor {
            dimension: self,
            table,
            value_column,
            normalizer,
            insert,
            max_len,
            cache,
            date_scoped,
        }
    }

    pub fn table(self) -> &'static str {
        self.descriptor().table
    }
}

/// Cuts `value` to at most `max_len` characters.
pub fn truncate(value: &str, max_len: usize) -> &str {
    match value.char_indices().nth(max_len) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

impl Normalizer {
    /// Canonical stored form, or `None` if the value is not valid for the
    /// dimension.
    pub fn apply(&self, value: &str) -> Option<String> {
        let value = value.trim();
        match self {
            Normalizer::Verbatim => Some(value.to_string()),
            Normalizer::Lowercase => Some(value.to_lowercase()),
            Normalizer::CountryCode => {
                (value.len() == 2 && value.chars().all(|c| c.is_ascii_alphabetic()))
                    .then(|| value.to_ascii_uppercase())
            }
            Normalizer::HttpStatus => value
                .parse::<u16>()
                .ok()
                .filter(|code| (100..600).contains(code))
                .map(|code| code.to_string()),
            Normalizer::IsoDate => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .map(|d| d.format("%Y-%m-%d").to_string()),
            Normalizer::Referrer => {
                let end = value.find(['?', '#']).unwrap_or(value.len());
                let url = value[..end].trim_end_matches('/');
                (!url.is_empty()).then(|| url.to_string())
            }
            Normalizer::ContentPath => {
                if value == UNKNOWN_CONTENT {
                    return Some(UNKNOWN_CONTENT.to_string());
                }
                ContentKey::parse(value).map(|key| key.composite())
            }
            Normalizer::KeyList => {
                let mut keys = value
                    .split(',')
                    .map(|k| k.trim().parse::<i64>())
                    .collect::<Result<Vec<_>, _>>()
                    .ok()?;
                keys.sort_unstable();
                keys.dedup();
                Some(
                    keys.iter()
                        .map(i64::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                )
            }
        }
    }
}

impl InsertStrategy {
    pub fn attrs(&self, value: &str) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        match self {
            InsertStrategy::Generic => {}
            InsertStrategy::Calendar => {
                if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
                    attrs.insert("year".into(), day.year().to_string());
                    attrs.insert("month".into(), day.month().to_string());
                    attrs.insert("day".into(), day.day().to_string());
                    attrs.insert(
                        "weekday".into(),
                        day.weekday().number_from_monday().to_string(),
                    );
                }
            }
            InsertStrategy::StatusClass => {
                if let Some(first) = value.chars().next() {
                    attrs.insert("class".into(), format!("{first}xx"));
                }
            }
            InsertStrategy::ContentLevels => {
                if let Some(key) = ContentKey::parse(value) {
                    let level = match (&key.volume, &key.issue, &key.article) {
                        (None, _, _) => "publication",
                        (Some(_), None, _) => "volume",
                        (Some(_), Some(_), None) => "issue",
                        (Some(_), Some(_), Some(_)) => "article",
                    };
                    attrs.insert("level".into(), level.into());
                    attrs.insert("publication".into(), key.publication.clone());
                    for (name, part) in [
                        ("volume", key.volume),
                        ("issue", key.issue),
                        ("article", key.article),
                    ] {
                        if let Some(part) = part {
                            attrs.insert(name.into(), part);
                        }
                    }
                }
            }
            InsertStrategy::AccessTuple => {
                for (name, part) in
                    ["role", "reason", "collection", "age"].iter().zip(value.split('|'))
                {
                    attrs.insert(name.to_string(), part.to_string());
                }
            }
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
        assert_eq!(truncate("äöüß", 2), "äö");
    }

    #[test]
    fn normalizers_reject_invalid_values() {
        assert_eq!(Normalizer::CountryCode.apply("de"), Some("DE".into()));
        assert_eq!(Normalizer::CountryCode.apply("Germany"), None);
        assert_eq!(Normalizer::HttpStatus.apply("200"), Some("200".into()));
        assert_eq!(Normalizer::HttpStatus.apply("99"), None);
        assert_eq!(Normalizer::HttpStatus.apply("ok"), None);
        assert_eq!(Normalizer::IsoDate.apply("2024-02-30"), None);
        assert_eq!(
            Normalizer::Referrer.apply("https://a.org/x/?q=1#frag"),
            Some("https://a.org/x".into())
        );
        assert_eq!(Normalizer::KeyList.apply("9, 3,9"), Some("3,9".into()));
        assert_eq!(Normalizer::KeyList.apply("3,x"), None);
        assert_eq!(
            Normalizer::ContentPath.apply("/jnl/1/2/"),
            Some("jnl/1/2".into())
        );
    }

    #[test]
    fn insert_strategies_derive_columns() {
        let cal = InsertStrategy::Calendar.attrs("2024-02-29");
        assert_eq!(cal["year"], "2024");
        assert_eq!(cal["weekday"], "4");

        let content = InsertStrategy::ContentLevels.attrs("jnl/4/2/a7");
        assert_eq!(content["level"], "article");
        assert_eq!(content["article"], "a7");

        let access = InsertStrategy::AccessTuple.attrs("institution|-|journals|3");
        assert_eq!(access["role"], "institution");
        assert_eq!(access["age"], "3");
    }

    #[test]
    fn every_dimension_has_a_distinct_table() {
        let mut tables: Vec<_> = Dimension::ALL.iter().map(|d| d.table()).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), Dimension::ALL.len());
    }
}
