use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

pub fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_default()
}

pub fn parse_rfc3339(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

/// Whole seconds from `from` to `to`, clamped at zero. `None` if either
/// timestamp does not parse.
pub fn seconds_between(from: &str, to: &str) -> Option<u64> {
    let from = parse_rfc3339(from)?;
    let to = parse_rfc3339(to)?;
    Some((to - from).whole_seconds().max(0) as u64)
}

/// Seconds elapsed since `ts` (clamped at zero).
pub fn seconds_since(ts: &str) -> Option<u64> {
    seconds_between(ts, &now_rfc3339())
}
