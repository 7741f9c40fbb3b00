//! Proxy access-log line parser
//!
//! Grammar (whitespace separated, order fixed):
//!
//! ```text
//! timestamp responseTimeMs clientIp ACTION[/status] responseSizeBytes method url username hierarchy contentType
//! ```
//!
//! The timestamp is either Unix epoch seconds with an optional fraction
//! (`1700000000.123`) or a `yyyy-MM-dd HH:mm:ss.SSS` datetime, which spans two
//! tokens. Lines that do not fit are rejected, never partially accepted.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Fields following the timestamp
const FIELDS_AFTER_TIMESTAMP: usize = 9;

/// One accepted access-log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub username: String,
    pub url: String,
    pub domain: Option<String>,
    pub status_code: u16,
    pub action: String,
    pub response_time_ms: u32,
    pub response_size_bytes: i64,
}

/// Why a line was not turned into a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Malformed,
    BadTimestamp,
    InvalidUsername,
}

/// Token view of a line that matched the grammar
struct Fields<'a> {
    raw_time: String,
    response_time_ms: u32,
    client_ip: &'a str,
    action: &'a str,
    status: Option<u16>,
    response_size_bytes: i64,
    url: &'a str,
    username: &'a str,
}

/// Parse one raw line into a record.
pub fn parse_line(line: &str) -> Result<LogRecord, Rejection> {
    let fields = split_fields(line).ok_or(Rejection::Malformed)?;

    let username = fields.username.trim();
    if !is_valid_username(username) {
        return Err(Rejection::InvalidUsername);
    }

    let timestamp = convert_timestamp(&fields.raw_time).ok_or(Rejection::BadTimestamp)?;

    Ok(LogRecord {
        timestamp,
        client_ip: fields.client_ip.to_string(),
        username: username.to_string(),
        url: fields.url.to_string(),
        domain: extract_domain(fields.url),
        status_code: fields
            .status
            .unwrap_or_else(|| infer_status_code(fields.action)),
        action: fields.action.to_string(),
        response_time_ms: fields.response_time_ms,
        response_size_bytes: fields.response_size_bytes,
    })
}

/// Timestamp of a line that matches the grammar, ignoring username validity.
pub fn peek_timestamp(line: &str) -> Option<DateTime<Utc>> {
    split_fields(line).and_then(|fields| convert_timestamp(&fields.raw_time))
}

fn split_fields(line: &str) -> Option<Fields<'_>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let first = *tokens.first()?;

    if is_epoch_token(first) {
        return fields_from(first.to_string(), &tokens[1..]);
    }

    // A datetime timestamp occupies two tokens; fall back to one so that an
    // unparsable timestamp is still told apart from a broken line.
    if tokens.len() > FIELDS_AFTER_TIMESTAMP + 1 {
        let joined = format!("{} {}", first, tokens[1]);
        if let Some(fields) = fields_from(joined, &tokens[2..]) {
            return Some(fields);
        }
    }
    fields_from(first.to_string(), &tokens[1..])
}

fn fields_from<'a>(raw_time: String, rest: &[&'a str]) -> Option<Fields<'a>> {
    if rest.len() < FIELDS_AFTER_TIMESTAMP {
        return None;
    }

    let response_time_ms = u32::try_from(parse_unsigned(rest[0])?).ok()?;
    let client_ip = rest[1];
    client_ip.parse::<IpAddr>().ok()?;
    let (action, status) = split_action(rest[2])?;
    // Sizes are stored as SQLite INTEGER
    let response_size_bytes = i64::try_from(parse_unsigned(rest[3])?).ok()?;

    Some(Fields {
        raw_time,
        response_time_ms,
        client_ip,
        action,
        status,
        response_size_bytes,
        url: rest[5],
        username: rest[6],
    })
}

fn parse_unsigned(token: &str) -> Option<u64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// `TCP_MISS/200` -> (`TCP_MISS`, Some(200)); `TCP_DENIED` -> (`TCP_DENIED`, None)
fn split_action(token: &str) -> Option<(&str, Option<u16>)> {
    let (action, status) = match token.split_once('/') {
        Some((action, status)) => (action, Some(status)),
        None => (token, None),
    };

    if action.is_empty() || !action.bytes().all(|b| b.is_ascii_uppercase() || b == b'_') {
        return None;
    }

    match status {
        None => Some((action, None)),
        Some(s) if s.len() == 3 && s.bytes().all(|b| b.is_ascii_digit()) => {
            Some((action, s.parse().ok()))
        }
        Some(_) => None,
    }
}

fn is_epoch_token(token: &str) -> bool {
    let mut parts = token.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let whole_ok = !whole.is_empty() && whole.bytes().all(|b| b.is_ascii_digit());
    match parts.next() {
        None => whole_ok,
        Some(fraction) => {
            whole_ok && !fraction.is_empty() && fraction.bytes().all(|b| b.is_ascii_digit())
        }
    }
}

/// Status for lines whose action token carries no explicit code.
pub fn infer_status_code(action: &str) -> u16 {
    if action.contains("DENIED") || action.contains("DENY") {
        403
    } else if ["MISS", "HIT", "TUNNEL", "REFRESH"]
        .iter()
        .any(|marker| action.contains(marker))
    {
        200
    } else {
        0
    }
}

/// Epoch seconds (fraction = sub-second precision) or `yyyy-MM-dd HH:mm:ss.SSS` in UTC.
pub fn convert_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if is_epoch_token(raw) {
        let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
        let seconds: i64 = whole.parse().ok()?;
        // Pad or truncate to nanoseconds instead of going through f64
        let mut digits: String = fraction.chars().take(9).collect();
        while digits.len() < 9 {
            digits.push('0');
        }
        let nanos: u32 = digits.parse().ok()?;
        return DateTime::from_timestamp(seconds, nanos);
    }

    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Admission heuristic: contains "user" (any case) or at least two underscores.
pub fn is_valid_username(username: &str) -> bool {
    if username.is_empty() || username == "-" {
        return false;
    }
    if username.to_lowercase().contains("user") {
        return true;
    }
    username.chars().filter(|&c| c == '_').count() >= 2
}

/// Host part of a url: scheme, userinfo, port and path are stripped.
pub fn extract_domain(url: &str) -> Option<String> {
    if url.is_empty() || url == "-" {
        return None;
    }

    let without_scheme = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();

    let host = if let Some(bracketed) = host_port.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        host_port.split(':').next().unwrap_or_default()
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
