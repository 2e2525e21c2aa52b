use chrono::{DateTime, NaiveDateTime, Utc};

/// Normalise an email `Date:` header (or an already-normalised timestamp) to UTC.
///
/// Tried in order:
/// 1. RFC 2822 (what Gmail sends), with any trailing `(comment)` such as `(UTC)` removed
/// 2. `%a, %d %b %Y %H:%M:%S` with no offset, read as UTC
/// 3. RFC 3339
pub fn parse_email_date(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = strip_trailing_comment(raw.trim());

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(ndt) = NaiveDateTime::parse_from_str(trimmed, "%a, %d %b %Y %H:%M:%S") {
        return Some(ndt.and_utc());
    }

    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// "Tue, 5 Mar 2024 10:00:00 +0000 (UTC)" -> "Tue, 5 Mar 2024 10:00:00 +0000"
fn strip_trailing_comment(value: &str) -> &str {
    if value.ends_with(')') {
        if let Some(open) = value.rfind('(') {
            return value[..open].trim_end();
        }
    }
    value
}
