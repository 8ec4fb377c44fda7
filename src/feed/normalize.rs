//! Turns a [`RawFeedDocument`] into display-ready text and timestamps.
//!
//! Normalization is pure and infallible: a bad date on one item resolves to
//! `None` for that item and never affects the rest of the document.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};

use super::parser::{RawFeedDocument, RawItem};

/// RFC 1123 with a numeric zone, weekday already stripped.
const RFC1123Z_BODY: &str = "%d %b %Y %H:%M:%S %z";
/// RFC 1123 date and time, weekday and zone name already stripped.
const RFC1123_BODY: &str = "%d %b %Y %H:%M:%S";

/// A feed document with HTML entities decoded and publish dates resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFeedDocument {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<NormalizedItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    /// `None` when the feed gave no date or one in neither RFC 1123 form.
    pub published_at: Option<DateTime<FixedOffset>>,
}

/// Decode HTML entities in titles and descriptions and resolve item dates.
///
/// Links are passed through untouched.
pub fn normalize(raw: RawFeedDocument) -> NormalizedFeedDocument {
    NormalizedFeedDocument {
        title: unescape(&raw.title),
        link: raw.link,
        description: unescape(&raw.description),
        items: raw.items.into_iter().map(normalize_item).collect(),
    }
}

fn normalize_item(item: RawItem) -> NormalizedItem {
    NormalizedItem {
        title: unescape(&item.title),
        description: unescape(&item.description),
        published_at: resolve_published(&item.pub_date),
        link: item.link,
    }
}

fn unescape(s: &str) -> String {
    html_escape::decode_html_entities(s).into_owned()
}

/// Resolves an RSS `pubDate` string.
///
/// Tries RFC 1123 with a numeric zone (`Mon, 02 Jan 2006 15:04:05 -0700`)
/// first, then RFC 1123 with a zone name (`Mon, 02 Jan 2006 15:04:05 MST`).
/// The weekday must be present but its value is not checked against the
/// date, since many feeds get it wrong. Returns `None` if neither form
/// matches.
pub fn resolve_published(raw: &str) -> Option<DateTime<FixedOffset>> {
    let body = strip_weekday(raw.trim())?;

    DateTime::parse_from_str(body, RFC1123Z_BODY)
        .ok()
        .or_else(|| parse_named_zone(body))
}

/// Returns the text after `"Ddd, "`, or `None` when there is no weekday prefix.
fn strip_weekday(s: &str) -> Option<&str> {
    let (weekday, rest) = s.split_once(", ")?;
    let is_weekday = weekday.len() == 3 && weekday.chars().all(|c| c.is_ascii_alphabetic());
    is_weekday.then_some(rest)
}

fn parse_named_zone(body: &str) -> Option<DateTime<FixedOffset>> {
    let (datetime, zone) = body.rsplit_once(' ')?;
    if zone.is_empty() || zone.len() > 5 || !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(datetime, RFC1123_BODY).ok()?;
    let offset = FixedOffset::east_opt(zone_offset_hours(zone) * 3600)?;
    offset.from_local_datetime(&naive).single()
}

/// UTC offset in hours for RFC 822 zone names. Other abbreviations are
/// ambiguous and read as UTC.
fn zone_offset_hours(zone: &str) -> i32 {
    match zone.to_ascii_uppercase().as_str() {
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        _ => 0,
    }
}
