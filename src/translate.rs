// src/translate.rs
//! Translation engine seam and the line-by-line translation of relay posts.
//!
//! Posts read back from Telegram arrive as plain text (formatting lives in
//! entities), so structural lines are recognised by the plain form of the
//! template pieces and rebuilt as HTML on the way out.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::normalize::{escape_text, plain_text};
use crate::render::link_line;
use crate::rules::TemplateCfg;

#[async_trait]
pub trait Translator: Send + Sync {
    /// Blank input comes back unchanged.
    async fn translate(&self, text: &str) -> Result<String>;

    /// Fails when the configured language pair cannot be served.
    async fn ensure_language_pair(&self) -> Result<()> {
        Ok(())
    }
}

/// LibreTranslate-compatible HTTP engine (`POST /translate`, `GET /languages`).
#[derive(Clone)]
pub struct LibreTranslateClient {
    base_url: String,
    api_key: Option<String>,
    from: String,
    to: String,
    client: Client,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

#[derive(Debug, Deserialize)]
struct Language {
    code: String,
    #[serde(default)]
    targets: Vec<String>,
}

impl LibreTranslateClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            from: from.into(),
            to: to.into(),
            client,
        }
    }
}

#[async_trait]
impl Translator for LibreTranslateClient {
    async fn translate(&self, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }
        let req = TranslateRequest {
            q: text,
            source: &self.from,
            target: &self.to,
            format: "text",
            api_key: self.api_key.as_deref(),
        };
        let rsp = self
            .client
            .post(format!("{}/translate", self.base_url))
            .json(&req)
            .send()
            .await
            .context("translate request")?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(anyhow!("translate: HTTP {status}: {}", body.trim()));
        }
        let out: TranslateResponse = rsp.json().await.context("translate response")?;
        Ok(out.translated_text)
    }

    async fn ensure_language_pair(&self) -> Result<()> {
        let rsp = self
            .client
            .get(format!("{}/languages", self.base_url))
            .send()
            .await
            .context("listing translation languages")?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(anyhow!("languages: HTTP {status}"));
        }
        let langs: Vec<Language> = rsp.json().await.context("languages response")?;
        if pair_available(&langs, &self.from, &self.to) {
            Ok(())
        } else {
            Err(anyhow!(
                "translation engine has no {} -> {} model installed",
                self.from,
                self.to
            ))
        }
    }
}

fn pair_available(langs: &[Language], from: &str, to: &str) -> bool {
    langs
        .iter()
        .any(|l| l.code == from && l.targets.iter().any(|t| t == to))
}

/* ----------------------------
Structure-preserving translation
---------------------------- */

/// Labels whose value is kept verbatim.
const KEPT_LABELS: [&str; 4] = ["source:", "date:", "asset:", "also watch:"];
const DIRECTION_LABEL: &str = "direction:";

/// Template pieces in the plain form they have after a Telegram round trip.
#[derive(Debug, Clone)]
pub struct PostLayout {
    /// (plain text, original markup)
    headers: Vec<(String, String)>,
    link_label: String,
    link_label_plain: String,
    banner_plain: String,
}

impl PostLayout {
    pub fn from_template(t: &TemplateCfg) -> Self {
        let headers = [
            &t.banner,
            &t.headline_header,
            &t.body_header,
            &t.impact_header,
            &t.source_header,
        ]
        .into_iter()
        .map(|h| (plain_text(Some(h.as_str())), h.clone()))
        .collect();
        Self {
            headers,
            link_label: t.link_label.clone(),
            link_label_plain: plain_text(Some(t.link_label.as_str())),
            banner_plain: plain_text(Some(t.banner.as_str())),
        }
    }

    /// Only posts carrying the relay banner are forwarded.
    pub fn looks_like_market_news(&self, text: &str) -> bool {
        !self.banner_plain.is_empty() && text.contains(&self.banner_plain)
    }

    fn header_markup(&self, line: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(plain, _)| plain == line)
            .map(|(_, markup)| markup.as_str())
    }

    pub fn link_line(&self, url: &str) -> String {
        link_line(&self.link_label, url)
    }
}

/// Translate prose lines; keep headers, labels, hashtags and links.
/// Output is Telegram HTML.
pub async fn translate_keep_structure(
    text: &str,
    url: &str,
    layout: &PostLayout,
    translator: &dyn Translator,
) -> Result<String> {
    let mut out: Vec<String> = Vec::new();

    for line in text.lines() {
        let s = line.trim();
        if s.is_empty() {
            out.push(String::new());
            continue;
        }
        if let Some(markup) = layout.header_markup(s) {
            out.push(markup.to_string());
            continue;
        }
        if s == layout.link_label_plain {
            if url.is_empty() {
                out.push(escape_text(s));
            } else {
                out.push(layout.link_line(url));
            }
            continue;
        }
        if s.starts_with('#') || s.starts_with("http://") || s.starts_with("https://") {
            out.push(escape_text(s));
            continue;
        }

        if let Some((key, value)) = KEPT_LABELS.iter().find_map(|l| split_label(s, l)) {
            out.push(format!("<b>{}</b> {}", escape_text(key), escape_text(value.trim())));
            continue;
        }
        if let Some((key, value)) = split_label(s, DIRECTION_LABEL) {
            let translated = translator.translate(value.trim()).await?;
            out.push(format!("<b>{}</b> {}", escape_text(key), escape_text(&translated)));
            continue;
        }
        if let Some(rest) = s.strip_prefix("• ") {
            let translated = translator.translate(rest).await?;
            out.push(format!("• {}", escape_text(&translated)));
            continue;
        }

        let translated = translator.translate(s).await?;
        out.push(escape_text(&translated));
    }

    Ok(out.join("\n").trim().to_string())
}

/// `("Source:", " FXStreet")` when `s` starts with `label`, ignoring ASCII case.
fn split_label<'a>(s: &'a str, label: &str) -> Option<(&'a str, &'a str)> {
    let key = s.get(..label.len())?;
    key.eq_ignore_ascii_case(label)
        .then(|| (key, &s[label.len()..]))
}

/// Append the link line when the post has a URL but the translation carries none.
pub fn ensure_link_present(text: &str, url: &str, layout: &PostLayout) -> String {
    if url.is_empty()
        || text.contains("http://")
        || text.contains("https://")
        || text.contains("<a href=")
    {
        return text.to_string();
    }
    format!("{}\n\n{}", text.trim_end(), layout.link_line(url))
        .trim()
        .to_string()
}
