//! Parsers for the two access-log line formats: tab-delimited fields in a
//! fixed order, and one JSON object per line.

use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;

use crate::event::{AccessEvent, SkipReason};

const TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%b/%Y:%H:%M:%S",
];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusField {
    Number(i64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonLine {
    timestamp: Option<String>,
    service: Option<String>,
    status: Option<StatusField>,
    ip: Option<String>,
    session: Option<String>,
    identities: Vec<String>,
    primary: Option<String>,
    license: Option<String>,
    content: Option<String>,
    user_agent: Option<String>,
    referrer: Option<String>,
}

/// Raw fields common to both formats before validation.
struct Fields {
    timestamp: Option<String>,
    service: Option<String>,
    status: Option<String>,
    ip: Option<String>,
    session: Option<String>,
    identities: Vec<String>,
    primary: Option<String>,
    license: Option<String>,
    content: Option<String>,
    user_agent: Option<String>,
    referrer: Option<String>,
}

fn present(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "-")
        .map(str::to_string)
}

fn identity_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty() && *id != "-")
        .map(str::to_string)
        .collect()
}

/// Tab-delimited fields in order: timestamp, service, status, ip, session,
/// identities (comma separated), primary, license, content, user agent,
/// referrer. `-` marks an absent field.
fn tab_fields(line: &str) -> Fields {
    let cols: Vec<&str> = line.split('\t').collect();
    let get = |i: usize| present(cols.get(i).copied());
    Fields {
        timestamp: get(0),
        service: get(1),
        status: get(2),
        ip: get(3),
        session: get(4),
        identities: cols.get(5).map(|raw| identity_list(raw)).unwrap_or_default(),
        primary: get(6),
        license: get(7),
        content: get(8),
        user_agent: get(9),
        referrer: get(10),
    }
}

fn json_fields(line: &str) -> Result<Fields, SkipReason> {
    let parsed: JsonLine =
        serde_json::from_str(line).map_err(|_| SkipReason::Malformed)?;
    let status = parsed.status.map(|s| match s {
        StatusField::Number(n) => n.to_string(),
        StatusField::Text(t) => t,
    });
    Ok(Fields {
        timestamp: present(parsed.timestamp.as_deref()),
        service: present(parsed.service.as_deref()),
        status: present(status.as_deref()),
        ip: present(parsed.ip.as_deref()),
        session: present(parsed.session.as_deref()),
        identities: parsed
            .identities
            .iter()
            .flat_map(|raw| identity_list(raw))
            .collect(),
        primary: present(parsed.primary.as_deref()),
        license: present(parsed.license.as_deref()),
        content: present(parsed.content.as_deref()),
        user_agent: present(parsed.user_agent.as_deref()),
        referrer: present(parsed.referrer.as_deref()),
    })
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_local());
    }
    // Apache style carries a trailing zone offset.
    if let Ok(ts) = DateTime::parse_from_str(raw, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(ts.naive_local());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Parses one input line, auto-detecting its format. Lines that cannot
/// become an event report why.
pub fn parse_line(line: &str) -> Result<AccessEvent, SkipReason> {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(SkipReason::BlankLine);
    }
    if trimmed.starts_with('#') {
        return Err(SkipReason::Comment);
    }
    let fields = if trimmed.starts_with('{') {
        json_fields(trimmed)?
    } else {
        tab_fields(line)
    };

    let raw_ts = fields.timestamp.ok_or(SkipReason::MissingTimestamp)?;
    let timestamp = parse_timestamp(&raw_ts).ok_or(SkipReason::BadTimestamp)?;
    let service = fields.service.ok_or(SkipReason::MissingService)?;
    let status = fields
        .status
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..600).contains(s))
        .ok_or(SkipReason::BadStatus)?;
    if status >= 400 {
        return Err(SkipReason::ErrorStatus);
    }

    let mut event = AccessEvent::new(timestamp, service, status);
    event.ip = fields.ip;
    event.session_id = fields.session;
    event.identity_ids = fields.identities;
    event.primary_id = fields.primary;
    event.license_id = fields.license;
    event.content_path = fields.content;
    event.user_agent = fields.user_agent;
    event.referrer = fields.referrer;
    Ok(event)
}
