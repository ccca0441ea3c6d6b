use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Zone abbreviations seen in the wild that RFC 2822 parsing rejects or
/// that we want pinned to a known offset.
const ZONE_ABBREVIATIONS: &[(&str, &str)] = &[
    ("Z", "+0000"),
    ("UT", "+0000"),
    ("UTC", "+0000"),
    ("GMT", "+0000"),
    ("EST", "-0500"),
    ("EDT", "-0400"),
    ("CST", "-0600"),
    ("CDT", "-0500"),
    ("MST", "-0700"),
    ("MDT", "-0600"),
    ("PST", "-0800"),
    ("PDT", "-0700"),
    ("BST", "+0100"),
    ("CET", "+0100"),
    ("CEST", "+0200"),
    ("EET", "+0200"),
    ("EEST", "+0300"),
    ("IST", "+0530"),
    ("JST", "+0900"),
    ("AEST", "+1000"),
    ("AEDT", "+1100"),
];

/// Formats carrying an explicit numeric offset.
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%z",
    "%Y-%m-%d %H:%M:%S %z",
];

/// Formats without an offset; interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d %b %Y %H:%M:%S",
    "%d %B %Y %H:%M:%S",
    "%d %b %Y %I:%M:%S %p",
    "%d %b %Y %I:%M %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d %b %Y", "%d %B %Y", "%B %d, %Y", "%b %d, %Y"];

/// Parses a feed publish date into UTC.
///
/// RFC 2822 is tried first since that is what RSS mandates, then RFC 3339
/// (Atom), then a handful of formats publishers actually emit. Weekday names
/// are not trusted: a wrong or spelled-out weekday is dropped and the date
/// retried. Unknown zone abbreviations are read as UTC.
///
/// Returns `None` for anything unparseable; this never fails.
///
/// # Examples
///
/// ```
/// use podcast_ingest::util::parse_pub_date;
///
/// let dt = parse_pub_date("Wed, 03 Jan 2024 10:00:00 GMT").unwrap();
/// assert_eq!(dt.to_rfc3339(), "2024-01-03T10:00:00+00:00");
/// assert!(parse_pub_date("last Tuesday").is_none());
/// ```
pub fn parse_pub_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    parse_rfc2822_lenient(s)
        .or_else(|| parse_structured(s))
        .or_else(|| match strip_weekday(s) {
            stripped if stripped != s => parse_structured(stripped),
            _ => None,
        })
}

/// RFC 3339 and the fixed formats, without weekday handling.
fn parse_structured(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            OFFSET_FORMATS.iter().find_map(|fmt| {
                DateTime::parse_from_str(s, fmt)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            })
        })
        .or_else(|| {
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        })
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
}

fn parse_rfc2822_lenient(s: &str) -> Option<DateTime<Utc>> {
    let parse = |candidate: &str| {
        DateTime::parse_from_rfc2822(candidate)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    };

    // chrono would take a trailing AM/PM for an unknown zone.
    if s.rsplit(' ').next().is_some_and(is_meridiem) {
        return None;
    }

    // chrono reads unknown zone names as -0000, so pin them first.
    parse(&with_numeric_zone(s)).or_else(|| parse(&with_numeric_zone(strip_weekday(s))))
}

/// Drops a leading `Wed,` / `Wednesday,` prefix.
fn strip_weekday(s: &str) -> &str {
    match s.split_once(',') {
        Some((head, tail))
            if !head.trim().is_empty() && head.trim().chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            tail.trim_start()
        }
        _ => s,
    }
}

/// Replaces a trailing alphabetic zone name with a numeric offset.
///
/// Only a token following a clock time counts as a zone; `AM`/`PM` never do.
fn with_numeric_zone(s: &str) -> String {
    let Some((rest, zone)) = s.rsplit_once(' ') else {
        return s.to_string();
    };
    let after_time = rest.rsplit(' ').next().is_some_and(|t| t.contains(':'));
    if !after_time
        || zone.is_empty()
        || !zone.chars().all(|c| c.is_ascii_alphabetic())
        || is_meridiem(zone)
    {
        return s.to_string();
    }

    let upper = zone.to_ascii_uppercase();
    let offset = ZONE_ABBREVIATIONS
        .iter()
        .find(|(name, _)| *name == upper)
        .map_or("+0000", |(_, offset)| *offset);
    format!("{rest} {offset}")
}

fn is_meridiem(token: &str) -> bool {
    token.eq_ignore_ascii_case("am") || token.eq_ignore_ascii_case("pm")
}
