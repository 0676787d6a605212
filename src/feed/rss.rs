// src/feed/rss.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use std::time::Duration;

use crate::feed::{parse_timestamp, FeedSource, NewsItem};

/* ---- RSS 2.0 ---- */

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<TextNode>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

/* ---- Atom ---- */

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    id: Option<String>,
    title: Option<TextNode>,
    summary: Option<TextNode>,
    content: Option<TextNode>,
    #[serde(rename = "link", default)]
    link: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

/// Element whose attributes we ignore (`<guid isPermaLink="false">`, `<title type="html">`).
#[derive(Debug, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    value: Option<String>,
}

impl TextNode {
    fn into_text(self) -> Option<String> {
        self.value
    }
}

/// RSS/Atom feed provider. HTTP in production, an in-memory document in tests.
pub struct RssFeed {
    name: String,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

impl RssFeed {
    pub fn from_fixture(name: impl Into<String>, xml: &str) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(name: impl Into<String>, url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("market-news-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name: name.into(),
            mode: Mode::Http {
                url: url.into(),
                client,
            },
        }
    }

    pub fn parse_items_from_str(source: &str, s: &str) -> Result<Vec<NewsItem>> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(s);

        let out = match from_str::<Rss>(&xml_clean) {
            Ok(rss) => rss
                .channel
                .item
                .into_iter()
                .map(|it| rss_item(source, it))
                .collect::<Vec<_>>(),
            Err(rss_err) if !xml_clean.contains("<feed") => {
                return Err(anyhow!("{source}: parsing rss xml: {rss_err}"));
            }
            Err(rss_err) => {
                let atom: AtomFeed = from_str(&xml_clean).map_err(|atom_err| {
                    anyhow!("{source}: neither RSS ({rss_err}) nor Atom ({atom_err})")
                })?;
                atom.entry
                    .into_iter()
                    .map(|e| atom_entry(source, e))
                    .collect()
            }
        };

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("relay_feed_parse_ms").record(ms);
        Ok(out)
    }
}

fn rss_item(source: &str, it: Item) -> NewsItem {
    let published = non_blank(it.pub_date);
    NewsItem {
        source: source.to_string(),
        guid: non_blank(it.guid.and_then(TextNode::into_text)),
        title: non_blank(it.title),
        summary: non_blank(it.description),
        link: non_blank(it.link),
        published_ts: published.as_deref().and_then(parse_timestamp),
        published,
    }
}

fn atom_entry(source: &str, e: AtomEntry) -> NewsItem {
    // rel="alternate" (or no rel) is the article itself
    let link = e
        .link
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| e.link.first())
        .and_then(|l| l.href.clone());
    let published = non_blank(e.published).or_else(|| non_blank(e.updated));
    NewsItem {
        source: source.to_string(),
        guid: non_blank(e.id),
        title: non_blank(e.title.and_then(TextNode::into_text)),
        summary: non_blank(e.summary.and_then(TextNode::into_text))
            .or_else(|| non_blank(e.content.and_then(TextNode::into_text))),
        link: non_blank(link),
        published_ts: published.as_deref().and_then(parse_timestamp),
        published,
    }
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[async_trait]
impl FeedSource for RssFeed {
    async fn fetch_latest(&self) -> Result<Vec<NewsItem>> {
        match &self.mode {
            Mode::Fixture(s) => Self::parse_items_from_str(&self.name, s),
            Mode::Http { url, client } => {
                let resp = client
                    .get(url.as_str())
                    .send()
                    .await
                    .with_context(|| format!("{} http get()", self.name))?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(anyhow!("{}: HTTP {} when fetching {}", self.name, status, url));
                }
                let body = resp
                    .text()
                    .await
                    .with_context(|| format!("{} http .text()", self.name))?;
                Self::parse_items_from_str(&self.name, &body)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Entities that are valid HTML but undefined in XML.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test</title>
    <item>
      <title>Gold climbs&nbsp;after CPI</title>
      <link>https://example.com/a</link>
      <guid isPermaLink="false">a-1</guid>
      <pubDate>Mon, 01 Jan 2024 00:00:00 +0000</pubDate>
      <description><![CDATA[<p>Spot gold <b>rose</b> 1%.</p>]]></description>
    </item>
    <item>
      <title>   </title>
      <link>https://example.com/b</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom test</title>
  <entry>
    <id>urn:x:1</id>
    <title type="html">ECB holds rates</title>
    <link rel="self" href="https://example.com/self"/>
    <link rel="alternate" href="https://example.com/ecb"/>
    <updated>2024-01-01T00:00:00Z</updated>
    <content type="html">The ECB left rates unchanged.</content>
  </entry>
</feed>"#;

    #[test]
    fn rss_items_parse_with_optional_fields() {
        let items = RssFeed::parse_items_from_str("Test", RSS).unwrap();
        assert_eq!(items.len(), 2);

        let a = &items[0];
        assert_eq!(a.source, "Test");
        assert_eq!(a.guid.as_deref(), Some("a-1"));
        assert_eq!(a.title.as_deref(), Some("Gold climbs after CPI"));
        assert_eq!(a.summary.as_deref(), Some("<p>Spot gold <b>rose</b> 1%.</p>"));
        assert_eq!(a.published_ts, Some(1_704_067_200));

        let b = &items[1];
        assert_eq!(b.title, None);
        assert_eq!(b.published, None);
        assert_eq!(b.published_ts, None);
    }

    #[test]
    fn atom_fallback_picks_alternate_link() {
        let items = RssFeed::parse_items_from_str("Atom", ATOM).unwrap();
        assert_eq!(items.len(), 1);
        let e = &items[0];
        assert_eq!(e.guid.as_deref(), Some("urn:x:1"));
        assert_eq!(e.link.as_deref(), Some("https://example.com/ecb"));
        assert_eq!(e.summary.as_deref(), Some("The ECB left rates unchanged."));
        assert_eq!(e.published_ts, Some(1_704_067_200));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(RssFeed::parse_items_from_str("X", "<html><body>nope").is_err());
    }

    #[tokio::test]
    async fn fixture_provider_uses_its_name_as_source() {
        let p = RssFeed::from_fixture("DailyFX", RSS);
        assert_eq!(p.name(), "DailyFX");
        let items = p.fetch_latest().await.unwrap();
        assert!(items.iter().all(|i| i.source == "DailyFX"));
    }
}
