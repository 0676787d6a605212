// src/relay.rs
//! Companion relay: reads new posts from the source channel, translates them
//! line by line and re-posts to the target channel.
//!
//! Cursor semantics follow `getUpdates`: `offset = N` acknowledges every update
//! below N. A failed post leaves the cursor on that update so the next run retries it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TranslateSettings;
use crate::notify::telegram::{ChannelPost, MessageEntity, TelegramBot, Update};
use crate::notify::{ContentType, DeliveryError, Notifier, SendOptions};
use crate::render::truncate_message;
use crate::state::write_atomic;
use crate::translate::{ensure_link_present, translate_keep_structure, PostLayout, Translator};

pub const MAX_MESSAGE_LEN: usize = 3800;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?://[^\s)>\]]+").expect("url regex"));

/// Where channel posts come from.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn updates(&self, offset: i64) -> Result<Vec<Update>, DeliveryError>;
}

#[async_trait]
impl UpdateSource for TelegramBot {
    async fn updates(&self, offset: i64) -> Result<Vec<Update>, DeliveryError> {
        self.get_updates(offset, 0).await
    }
}

/// Persisted `{ "offset": N }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCursor {
    #[serde(default)]
    pub offset: i64,
}

impl RelayCursor {
    /// Missing or unreadable state starts from 0.
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(state = %path.display(), error = %e, "relay cursor unreadable; starting from 0");
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(state = %path.display(), error = %e, "relay cursor unreadable; starting from 0");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self).context("serializing relay cursor")?;
        write_atomic(path, &bytes)
    }
}

#[derive(Debug, Clone)]
pub struct TranslateOptions {
    /// Lowercase, without `@`.
    pub source_username: String,
    pub target: String,
    pub state_path: PathBuf,
}

impl From<&TranslateSettings> for TranslateOptions {
    fn from(s: &TranslateSettings) -> Self {
        Self {
            source_username: s.source_username.clone(),
            target: s.target_channel.clone(),
            state_path: s.state_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub received: usize,
    pub relayed: usize,
    pub ignored: usize,
    /// Update that stopped the batch, if any.
    pub failed_update: Option<i64>,
    pub next_offset: i64,
}

pub struct TranslationRelay {
    opts: TranslateOptions,
    layout: PostLayout,
    source: Arc<dyn UpdateSource>,
    notifier: Arc<dyn Notifier>,
    translator: Arc<dyn Translator>,
}

impl TranslationRelay {
    pub fn new(
        opts: TranslateOptions,
        layout: PostLayout,
        source: Arc<dyn UpdateSource>,
        notifier: Arc<dyn Notifier>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        Self {
            opts,
            layout,
            source,
            notifier,
            translator,
        }
    }

    /// One batch. Engine availability is checked before any update is read.
    pub async fn run_once(&self) -> Result<RelayReport> {
        self.translator
            .ensure_language_pair()
            .await
            .context("translation engine not ready")?;

        let cursor = RelayCursor::load(&self.opts.state_path);
        let updates = self
            .source
            .updates(cursor.offset)
            .await
            .context("fetching channel updates")?;

        let mut report = RelayReport {
            received: updates.len(),
            next_offset: cursor.offset,
            ..RelayReport::default()
        };

        for upd in &updates {
            match self.handle(upd).await {
                Ok(true) => report.relayed += 1,
                Ok(false) => report.ignored += 1,
                Err(e) => {
                    warn!(update_id = upd.update_id, error = %format!("{e:#}"), "relay stopped; will retry this update next run");
                    report.failed_update = Some(upd.update_id);
                    report.next_offset = upd.update_id;
                    break;
                }
            }
            report.next_offset = report.next_offset.max(upd.update_id + 1);
        }

        RelayCursor {
            offset: report.next_offset,
        }
        .save(&self.opts.state_path)
        .with_context(|| format!("persisting relay cursor to {}", self.opts.state_path.display()))?;

        info!(
            received = report.received,
            relayed = report.relayed,
            ignored = report.ignored,
            next_offset = report.next_offset,
            "relay batch finished"
        );
        Ok(report)
    }

    /// `Ok(false)` when the update is not ours to relay.
    async fn handle(&self, upd: &Update) -> Result<bool> {
        let Some(post) = upd.channel_post.as_ref() else {
            return Ok(false);
        };
        if !self.is_from_source(post) {
            debug!(update_id = upd.update_id, "not from source channel");
            return Ok(false);
        }
        let Some((text, entities)) = post.body() else {
            return Ok(false);
        };
        if !self.layout.looks_like_market_news(text) {
            debug!(update_id = upd.update_id, "not a market news post");
            return Ok(false);
        }

        let url = extract_best_url(text, entities);
        let translated =
            translate_keep_structure(text, &url, &self.layout, self.translator.as_ref()).await?;
        let message = truncate_message(
            &ensure_link_present(&translated, &url, &self.layout),
            MAX_MESSAGE_LEN,
        );

        let opts = SendOptions {
            content_type: ContentType::Html,
            preview: true,
        };
        self.notifier.send(&self.opts.target, &message, opts).await?;
        info!(update_id = upd.update_id, message_id = post.message_id, "relayed post");
        Ok(true)
    }

    fn is_from_source(&self, post: &ChannelPost) -> bool {
        post.chat
            .username
            .as_deref()
            .is_some_and(|u| u.trim_start_matches('@').eq_ignore_ascii_case(&self.opts.source_username))
    }
}

/// First raw URL in the text, else the first `text_link`/`url` entity.
pub fn extract_best_url(text: &str, entities: &[MessageEntity]) -> String {
    if let Some(m) = URL_RE.find(text) {
        return m.as_str().to_string();
    }
    for e in entities {
        match e.kind.as_str() {
            "text_link" => {
                if let Some(u) = e.url.as_deref().filter(|u| !u.is_empty()) {
                    return u.to_string();
                }
            }
            "url" if e.length > 0 => {
                if let Some(u) = utf16_slice(text, e.offset, e.length) {
                    return u;
                }
            }
            _ => {}
        }
    }
    String::new()
}

/// Entity offsets count UTF-16 code units.
fn utf16_slice(text: &str, offset: usize, length: usize) -> Option<String> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let end = offset.checked_add(length)?;
    units.get(offset..end).map(String::from_utf16_lossy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(kind: &str, offset: usize, length: usize, url: Option<&str>) -> MessageEntity {
        MessageEntity {
            kind: kind.into(),
            offset,
            length,
            url: url.map(Into::into),
        }
    }

    #[test]
    fn raw_url_wins_over_entities() {
        let ents = [entity("text_link", 0, 4, Some("https://entity/1"))];
        assert_eq!(
            extract_best_url("see https://raw/1) now", &ents),
            "https://raw/1"
        );
    }

    #[test]
    fn text_link_entity_is_used_without_raw_url() {
        let ents = [entity("bold", 0, 4, None), entity("text_link", 5, 4, Some("https://x/9"))];
        assert_eq!(extract_best_url("read full", &ents), "https://x/9");
        assert_eq!(extract_best_url("nothing", &[]), "");
    }

    #[test]
    fn url_entity_offsets_are_utf16() {
        // "📈" is two UTF-16 units
        let text = "📈 example.org/a";
        let ents = [entity("url", 3, 13, None)];
        assert_eq!(extract_best_url(text, &ents), "example.org/a");
        let ents = [entity("url", 3, 99, None)];
        assert_eq!(extract_best_url(text, &ents), "");
    }

    #[test]
    fn cursor_defaults_on_missing_or_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("relay_state.json");
        assert_eq!(RelayCursor::load(&p).offset, 0);
        std::fs::write(&p, b"{not json").unwrap();
        assert_eq!(RelayCursor::load(&p).offset, 0);
        RelayCursor { offset: 42 }.save(&p).unwrap();
        assert_eq!(RelayCursor::load(&p).offset, 42);
    }
}
