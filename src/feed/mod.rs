// src/feed/mod.rs
pub mod rss;

use anyhow::Result;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

pub use self::rss::RssFeed;

/// One feed entry as delivered by a provider. Read-only for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NewsItem {
    pub source: String, // feed label, e.g. "FXStreet"
    pub guid: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>, // may contain markup
    pub link: Option<String>,
    pub published: Option<String>, // as written by the feed
    pub published_ts: Option<i64>,  // unix seconds, when parseable
}

#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_latest(&self) -> Result<Vec<NewsItem>>;
    fn name(&self) -> &str;
}

/// RFC 2822 (RSS `pubDate`) first, then RFC 3339 (Atom). ISO-8601 values without
/// an offset are taken as UTC, a bare date as its midnight. `None` when nothing parses.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc2822) {
        return Some(dt.unix_timestamp());
    }
    // obsolete zone names ("GMT", "EST") that `time` rejects
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(dt.unix_timestamp());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rss_and_atom_dates() {
        assert_eq!(
            parse_timestamp("Mon, 01 Jan 2024 00:00:00 +0000"),
            Some(1_704_067_200)
        );
        assert_eq!(
            parse_timestamp("Mon, 01 Jan 2024 00:00:00 GMT"),
            Some(1_704_067_200)
        );
        assert_eq!(parse_timestamp("2024-01-01T01:00:00+01:00"), Some(1_704_067_200));
    }

    #[test]
    fn offsetless_iso_dates_are_utc() {
        assert_eq!(parse_timestamp("2024-01-01"), Some(1_704_067_200));
        assert_eq!(parse_timestamp("2024-01-01T00:00:00"), Some(1_704_067_200));
        assert_eq!(parse_timestamp("2024-01-01 01:30:00.250"), Some(1_704_072_600));
    }

    #[test]
    fn unparseable_dates_are_none() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("2024-13-01"), None);
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
