// src/pipeline.rs
//! Delivery orchestrator. One run, strictly sequential:
//! lock → load state → per feed, per item:
//!   age filter → identifier → dedup → relevance → impact → extract → render → send → record
//! → persist state once.
//!
//! Per-item and per-feed failures are logged and counted; only lock/state IO errors
//! reach the caller.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::classify::Classifier;
use crate::config::RelaySettings;
use crate::feed::{FeedSource, NewsItem};
use crate::normalize::plain_text;
use crate::notify::{ContentType, Notifier, SendOptions};
use crate::render::{RenderInput, Renderer};
use crate::rules::RuleBook;
use crate::state::{compute_identifier, is_fresh, DeliveryState, IdentifierMode, RunLock};

/// One-time metrics registration.
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("relay_items_total", "Items fetched from all feeds.");
        describe_counter!("relay_stale_total", "Items outside the freshness window or undated.");
        describe_counter!("relay_duplicate_total", "Items already delivered in an earlier run.");
        describe_counter!("relay_irrelevant_total", "Items without any relevance keyword.");
        describe_counter!("relay_low_impact_total", "Relevant items that are not high impact.");
        describe_counter!("relay_delivered_total", "Posts accepted by the transport.");
        describe_counter!("relay_delivery_failures_total", "Posts the transport rejected.");
        describe_counter!("relay_feed_errors_total", "Feed fetch/parse errors.");
        describe_histogram!("relay_feed_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!("relay_last_run_ts", "Unix ts of the last completed run.");
    });
}

/// The parts of `RelaySettings` the orchestrator needs (no credentials).
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub target: String,
    pub state_path: PathBuf,
    pub max_age: Option<chrono::Duration>,
    pub preview: bool,
    pub identifier_mode: IdentifierMode,
    pub lock_stale_after: Duration,
}

impl RelayOptions {
    pub fn new(target: impl Into<String>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            state_path: state_path.into(),
            max_age: Some(chrono::Duration::hours(24)),
            preview: true,
            identifier_mode: IdentifierMode::default(),
            lock_stale_after: RunLock::DEFAULT_STALE_AFTER,
        }
    }
}

impl From<&RelaySettings> for RelayOptions {
    fn from(s: &RelaySettings) -> Self {
        Self {
            target: s.channel.clone(),
            state_path: s.state_path.clone(),
            max_age: s.max_age,
            preview: s.link_preview,
            identifier_mode: s.identifier_mode,
            lock_stale_after: RunLock::DEFAULT_STALE_AFTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Stale,
    Duplicate,
    Irrelevant,
    LowImpact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Skipped(SkipReason),
    Delivered,
    Failed,
}

/// Per-stage counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub fetched: usize,
    pub stale: usize,
    pub duplicate: usize,
    pub irrelevant: usize,
    pub low_impact: usize,
    pub delivered: usize,
    pub failed: usize,
    pub feed_errors: usize,
    /// Another run held the lock; nothing was read or written.
    pub locked_out: bool,
}

impl RunReport {
    fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Skipped(SkipReason::Stale) => self.stale += 1,
            Outcome::Skipped(SkipReason::Duplicate) => self.duplicate += 1,
            Outcome::Skipped(SkipReason::Irrelevant) => self.irrelevant += 1,
            Outcome::Skipped(SkipReason::LowImpact) => self.low_impact += 1,
            Outcome::Delivered => self.delivered += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

pub struct NewsRelay {
    opts: RelayOptions,
    classifier: Classifier,
    renderer: Renderer,
    feeds: Vec<Box<dyn FeedSource>>,
    notifier: Arc<dyn Notifier>,
}

impl NewsRelay {
    pub fn new(
        opts: RelayOptions,
        rules: Arc<RuleBook>,
        feeds: Vec<Box<dyn FeedSource>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            opts,
            classifier: Classifier::new(rules.clone()),
            renderer: Renderer::new(rules),
            feeds,
            notifier,
        }
    }

    pub async fn run_once(&self) -> Result<RunReport> {
        self.run_once_at(Utc::now()).await
    }

    /// `now` anchors the age filter.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<RunReport> {
        ensure_metrics_described();
        let path = &self.opts.state_path;
        let Some(_lock) = RunLock::acquire(path, self.opts.lock_stale_after)? else {
            info!(state = %path.display(), "another run holds the lock; skipping this run");
            return Ok(RunReport {
                locked_out: true,
                ..RunReport::default()
            });
        };

        let mut state = DeliveryState::load(path);
        debug!(known = state.len(), "delivery state loaded");
        let mut report = RunReport::default();

        for feed in &self.feeds {
            let items = match feed.fetch_latest().await {
                Ok(items) => items,
                Err(e) => {
                    warn!(feed = feed.name(), error = %format!("{e:#}"), "feed fetch failed");
                    counter!("relay_feed_errors_total").increment(1);
                    report.feed_errors += 1;
                    continue;
                }
            };
            debug!(feed = feed.name(), items = items.len(), "feed fetched");
            counter!("relay_items_total").increment(items.len() as u64);
            report.fetched += items.len();

            for item in &items {
                let outcome = self.process_item(item, now, &mut state).await;
                report.tally(outcome);
            }
        }

        state
            .save(path)
            .with_context(|| format!("persisting delivery state to {}", path.display()))?;
        gauge!("relay_last_run_ts").set(now.timestamp() as f64);

        info!(
            fetched = report.fetched,
            delivered = report.delivered,
            failed = report.failed,
            stale = report.stale,
            duplicate = report.duplicate,
            irrelevant = report.irrelevant,
            low_impact = report.low_impact,
            feed_errors = report.feed_errors,
            "run finished"
        );
        Ok(report)
    }

    async fn process_item(
        &self,
        item: &NewsItem,
        now: DateTime<Utc>,
        state: &mut DeliveryState,
    ) -> Outcome {
        let title = plain_text(item.title.as_deref());
        let summary = plain_text(item.summary.as_deref());
        let link = item.link.as_deref().unwrap_or("");

        if let Some(max_age) = self.opts.max_age {
            if !is_fresh(item.published_ts, now, max_age) {
                return skip(item, &title, SkipReason::Stale);
            }
        }

        let id = compute_identifier(item, self.opts.identifier_mode);
        if !state.is_new(&id) {
            return skip(item, &title, SkipReason::Duplicate);
        }

        if !self.classifier.is_relevant(&title, &summary, link) {
            return skip(item, &title, SkipReason::Irrelevant);
        }
        if !self.classifier.is_high_impact(&title, &summary) {
            return skip(item, &title, SkipReason::LowImpact);
        }

        let extraction = self.classifier.extract(&title, &summary);
        let message = self
            .renderer
            .render(&RenderInput::from_item(item, Some(&extraction)));

        let opts = SendOptions {
            content_type: ContentType::Html,
            preview: self.opts.preview,
        };
        match self.notifier.send(&self.opts.target, &message, opts).await {
            Ok(()) => {
                info!(
                    source = %item.source,
                    id = %id,
                    asset = extraction.primary_asset.as_ref().map(|a| a.tag.as_str()).unwrap_or("-"),
                    direction = extraction.direction.rule_label(),
                    "delivered: {title}"
                );
                counter!("relay_delivered_total").increment(1);
                state.record(id);
                Outcome::Delivered
            }
            Err(e) => {
                warn!(source = %item.source, id = %id, error = %e, "delivery failed; will retry next run");
                counter!("relay_delivery_failures_total").increment(1);
                Outcome::Failed
            }
        }
    }
}

fn skip(item: &NewsItem, title: &str, reason: SkipReason) -> Outcome {
    debug!(source = %item.source, ?reason, "skipped: {title}");
    let name = match reason {
        SkipReason::Stale => "relay_stale_total",
        SkipReason::Duplicate => "relay_duplicate_total",
        SkipReason::Irrelevant => "relay_irrelevant_total",
        SkipReason::LowImpact => "relay_low_impact_total",
    };
    counter!(name).increment(1);
    Outcome::Skipped(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::RssFeed;
    use crate::notify::DeliveryError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, _t: &str, text: &str, _o: SendOptions) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    const FEED: &str = r#"<rss><channel>
      <item><title>US CPI rises more than expected</title><link>https://x/1</link>
        <pubDate>Mon, 01 Jan 2024 08:00:00 +0000</pubDate><description>Inflation accelerated.</description></item>
      <item><title>Old CPI story</title><link>https://x/2</link>
        <pubDate>Fri, 01 Dec 2023 08:00:00 +0000</pubDate></item>
      <item><title>CPI preview without a date</title><link>https://x/3</link></item>
    </channel></rss>"#;

    fn relay(dir: &std::path::Path, rec: Arc<Recorder>) -> NewsRelay {
        let opts = RelayOptions::new("@chan", dir.join("state.json"));
        NewsRelay::new(
            opts,
            Arc::new(RuleBook::embedded().unwrap()),
            vec![Box::new(RssFeed::from_fixture("Test", FEED))],
            rec,
        )
    }

    #[tokio::test]
    async fn age_filter_excludes_old_and_undated_items() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Arc::new(Recorder::default());
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let report = relay(dir.path(), rec.clone()).run_once_at(now).await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.stale, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(rec.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn held_lock_skips_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        let _held = RunLock::acquire(&state, RunLock::DEFAULT_STALE_AFTER)
            .unwrap()
            .unwrap();
        let rec = Arc::new(Recorder::default());
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let report = relay(dir.path(), rec.clone()).run_once_at(now).await.unwrap();
        assert!(report.locked_out);
        assert!(rec.sent.lock().unwrap().is_empty());
        assert!(!state.exists());
    }

    #[test]
    fn options_follow_settings() {
        let s = RelaySettings::from_lookup(|k: &str| match k {
            "TELEGRAM_BOT_TOKEN" => Some("t".into()),
            "TELEGRAM_CHANNEL" => Some("@c".into()),
            "MAX_AGE_HOURS" => Some("0".into()),
            _ => None,
        })
        .unwrap();
        let o = RelayOptions::from(&s);
        assert_eq!(o.target, "@c");
        assert!(o.max_age.is_none());
    }
}
