// tests/common/mod.rs
// Shared mocks for the integration tests. No network.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use market_news_relay::feed::{FeedSource, NewsItem};
use market_news_relay::notify::{DeliveryError, Notifier, SendOptions};

pub const MARKET_RSS: &str = include_str!("../fixtures/market_rss.xml");
pub const MARKET_ATOM: &str = include_str!("../fixtures/market_atom.xml");

/// Records every message; can be switched into failure mode.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String, SendOptions)>>,
    pub failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let n = Self::default();
        n.failing.store(true, Ordering::SeqCst);
        Arc::new(n)
    }

    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t, _)| t.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, target: &str, text: &str, opts: SendOptions) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Api {
                method: "sendMessage",
                status: 502,
                description: "Bad Gateway".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), text.to_string(), opts));
        Ok(())
    }
}

/// In-memory feed with a fixed item list.
pub struct StaticFeed {
    pub name: String,
    pub items: Vec<NewsItem>,
}

#[async_trait]
impl FeedSource for StaticFeed {
    async fn fetch_latest(&self) -> Result<Vec<NewsItem>> {
        Ok(self.items.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A feed that is always down.
pub struct BrokenFeed;

#[async_trait]
impl FeedSource for BrokenFeed {
    async fn fetch_latest(&self) -> Result<Vec<NewsItem>> {
        Err(anyhow!("connection refused"))
    }

    fn name(&self) -> &str {
        "Broken"
    }
}

pub fn item(source: &str, title: &str, summary: &str, link: &str, published: &str) -> NewsItem {
    NewsItem {
        source: source.to_string(),
        guid: None,
        title: Some(title.to_string()),
        summary: Some(summary.to_string()),
        link: Some(link.to_string()),
        published: Some(published.to_string()),
        published_ts: market_news_relay::feed::parse_timestamp(published),
    }
}
