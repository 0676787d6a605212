// src/render.rs
//! Fixed-section Telegram HTML post:
//! banner, headline, excerpt, impact block, source & time, link, disclaimer, hashtags.
//! User text is always escaped; template pieces are trusted markup from the rule book.

use chrono::{TimeZone, Utc};
use std::sync::Arc;

use crate::classify::Extraction;
use crate::feed::NewsItem;
use crate::normalize::{escape_attr, escape_text, plain_text};
use crate::rules::RuleBook;

const ELLIPSIS: &str = "...";

/// Everything the renderer needs about one item.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderInput<'a> {
    pub source: &'a str,
    pub title: Option<&'a str>,
    pub summary: Option<&'a str>,
    pub published: Option<&'a str>,
    pub published_ts: Option<i64>,
    pub link: Option<&'a str>,
    pub extraction: Option<&'a Extraction>,
}

impl<'a> RenderInput<'a> {
    pub fn from_item(item: &'a NewsItem, extraction: Option<&'a Extraction>) -> Self {
        Self {
            source: &item.source,
            title: item.title.as_deref(),
            summary: item.summary.as_deref(),
            published: item.published.as_deref(),
            published_ts: item.published_ts,
            link: item.link.as_deref(),
            extraction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    rules: Arc<RuleBook>,
}

impl Renderer {
    pub fn new(rules: Arc<RuleBook>) -> Self {
        Self { rules }
    }

    /// Never longer than the template's `max_len` (in chars).
    pub fn render(&self, input: &RenderInput<'_>) -> String {
        let t = self.rules.template();

        let title = non_empty(plain_text(input.title)).unwrap_or_else(|| t.missing_title.clone());
        let excerpt = match non_empty(plain_text(input.summary)) {
            Some(body) => truncate_excerpt(&body, t.excerpt_budget),
            None => t.missing_summary.clone(),
        };

        let mut sections: Vec<String> = Vec::with_capacity(8);
        sections.push(t.banner.clone());
        sections.push(format!("{}\n{}", t.headline_header, escape_text(&title)));
        sections.push(format!("{}\n{}", t.body_header, escape_text(&excerpt)));

        if t.show_impact {
            if let Some(ex) = input.extraction {
                sections.push(self.impact_block(ex));
            }
        }

        let source = non_empty(input.source.trim().to_string()).unwrap_or_else(|| "Unknown".into());
        sections.push(format!(
            "{}\n<b>Source:</b> {}\n<b>Date:</b> {}",
            t.source_header,
            escape_text(&source),
            escape_text(&display_time(input.published, input.published_ts)),
        ));

        if t.show_link {
            if let Some(link) = input.link.map(str::trim).filter(|l| !l.is_empty()) {
                sections.push(link_line(&t.link_label, link));
            }
        }

        sections.push(format!("<i>{}</i>", escape_text(&t.disclaimer)));

        if t.show_hashtags {
            if let Some(asset) = input.extraction.and_then(|e| e.primary_asset.as_ref()) {
                sections.push(self.rules.hashtags_for(&asset.tag).join(" "));
            }
        }

        truncate_message(&sections.join("\n\n"), t.max_len)
    }

    fn impact_block(&self, ex: &Extraction) -> String {
        let t = self.rules.template();
        let mut lines = vec![t.impact_header.clone()];
        let asset = ex
            .primary_asset
            .as_ref()
            .map(|a| a.tag.as_str())
            .unwrap_or("Not identified");
        lines.push(format!("<b>Asset:</b> {}", escape_text(asset)));
        let also: Vec<&str> = ex
            .affected_assets
            .iter()
            .map(String::as_str)
            .filter(|a| Some(*a) != ex.primary_asset.as_ref().map(|p| p.tag.as_str()))
            .collect();
        if !also.is_empty() {
            lines.push(format!("<b>Also watch:</b> {}", escape_text(&also.join(", "))));
        }
        lines.push(format!("<b>Direction:</b> {}", ex.direction.describe()));
        for note in &ex.impact_notes {
            lines.push(format!("• {}", escape_text(note)));
        }
        lines.join("\n")
    }
}

/// `🔗 <a href="..">Read full article</a>`: a leading emoji token stays outside the anchor.
pub fn link_line(label: &str, url: &str) -> String {
    let label = label.trim();
    let (prefix, text) = match label.split_once(char::is_whitespace) {
        Some((head, rest)) if !head.chars().any(char::is_alphanumeric) => (head, rest.trim()),
        _ => ("", label),
    };
    let anchor = format!("<a href=\"{}\">{}</a>", escape_attr(url), escape_text(text));
    if prefix.is_empty() {
        anchor
    } else {
        format!("{prefix} {anchor}")
    }
}

/// Cut at the last whitespace at or before `budget` chars and append "...".
/// Text within budget is returned unchanged. A first word longer than the
/// budget leaves only the ellipsis.
pub fn truncate_excerpt(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    // byte index of the char right after the budget
    let cut = text
        .char_indices()
        .nth(budget)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..cut];
    let next_is_space = text[cut..].chars().next().is_some_and(char::is_whitespace);
    let kept = if next_is_space {
        head
    } else {
        match head.rfind(char::is_whitespace) {
            Some(i) => &head[..i],
            None => "",
        }
    };
    format!("{}{}", kept.trim_end(), ELLIPSIS)
}

/// Hard cut to `max - 3` chars plus "..." when over `max`. May split markup.
pub fn truncate_message(msg: &str, max: usize) -> String {
    if msg.chars().count() <= max {
        return msg.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut out: String = msg.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

fn display_time(published: Option<&str>, ts: Option<i64>) -> String {
    if let Some(dt) = ts.and_then(|s| Utc.timestamp_opt(s, 0).single()) {
        return dt.format("%Y-%m-%d %H:%M UTC").to_string();
    }
    published
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or("n/a")
        .to_string()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
