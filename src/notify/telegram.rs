// src/notify/telegram.rs
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{ContentType, DeliveryError, Notifier, SendOptions};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
/// Upper bound for `with_retries`; keeps the backoff within a few seconds.
pub const MAX_RETRIES: u8 = 5;

/// Minimal Bot API client: `sendMessage` and `getUpdates`.
#[derive(Clone)]
pub struct TelegramBot {
    token: String,
    api_base: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl std::fmt::Debug for TelegramBot {
    // keeps the token out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramBot")
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl TelegramBot {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            client: Client::new(),
            timeout: Duration::from_secs(20),
            max_retries: 2,
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.clamp(1, MAX_RETRIES);
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.token,
            method
        )
    }

    pub async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        opts: SendOptions,
    ) -> Result<SentMessage, DeliveryError> {
        let body = SendMessageBody::new(chat_id, text, opts);
        self.call("sendMessage", &body).await
    }

    /// Channel posts after `offset`. `long_poll_secs` is Telegram's server-side wait.
    pub async fn get_updates(
        &self,
        offset: i64,
        long_poll_secs: u64,
    ) -> Result<Vec<Update>, DeliveryError> {
        let body = GetUpdatesBody {
            offset,
            timeout: long_poll_secs,
            allowed_updates: vec!["channel_post"],
        };
        self.call("getUpdates", &body).await
    }

    /// POST with retries on connection errors, 429 and 5xx.
    /// Timeouts are not retried: the message may already be out.
    async fn call<B, T>(&self, method: &'static str, body: &B) -> Result<T, DeliveryError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let url = self.method_url(method);
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&url)
                .timeout(self.timeout)
                .json(body)
                .send()
                .await;

            match res {
                Ok(rsp) => {
                    let status = rsp.status();
                    let text = rsp.text().await.map_err(|e| http_error(method, e))?;
                    match decode_response(method, status.as_u16(), &text) {
                        Ok(v) => return Ok(v),
                        Err(e) if is_transient(status) && attempt < self.max_retries => {
                            debug!(method, %status, attempt, "telegram transient error: {e}");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_timeout() => return Err(DeliveryError::Timeout { method }),
                Err(e) if e.is_connect() && attempt < self.max_retries => {
                    debug!(method, attempt, "telegram connect error: {}", e.without_url());
                }
                Err(e) => return Err(http_error(method, e)),
            }

            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}

#[async_trait]
impl Notifier for TelegramBot {
    async fn send(&self, target: &str, text: &str, opts: SendOptions) -> Result<(), DeliveryError> {
        self.send_message(target, text, opts).await.map(|_| ())
    }
}

fn http_error(method: &'static str, e: reqwest::Error) -> DeliveryError {
    // reqwest puts the URL (and so the bot token) in its Display
    DeliveryError::Http {
        method,
        source: e.without_url(),
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Telegram answers `{ok, result}` or `{ok: false, error_code, description}`.
pub(crate) fn decode_response<T: DeserializeOwned>(
    method: &'static str,
    status: u16,
    body: &str,
) -> Result<T, DeliveryError> {
    let parsed: Result<ApiResponse<T>, _> = serde_json::from_str(body);
    match parsed {
        Ok(ApiResponse {
            ok: true,
            result: Some(v),
            ..
        }) => Ok(v),
        Ok(r) => Err(DeliveryError::Api {
            method,
            status: r.error_code.unwrap_or(status),
            description: r
                .description
                .unwrap_or_else(|| "no description".to_string()),
        }),
        Err(e) => Err(DeliveryError::Api {
            method,
            status,
            description: format!("unreadable response: {e}"),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Debug, Serialize)]
struct SendMessageBody<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    link_preview_options: LinkPreviewOptions,
}

#[derive(Debug, Serialize)]
struct LinkPreviewOptions {
    is_disabled: bool,
}

impl<'a> SendMessageBody<'a> {
    fn new(chat_id: &'a str, text: &'a str, opts: SendOptions) -> Self {
        Self {
            chat_id,
            text,
            parse_mode: match opts.content_type {
                ContentType::Html => Some("HTML"),
                ContentType::Plain => None,
            },
            link_preview_options: LinkPreviewOptions {
                is_disabled: !opts.preview,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct GetUpdatesBody {
    offset: i64,
    timeout: u64,
    allowed_updates: Vec<&'static str>,
}

/* ---- Bot API models (only the fields the relays read) ---- */

#[derive(Debug, Clone, Deserialize)]
pub struct SentMessage {
    pub message_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub channel_post: Option<ChannelPost>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelPost {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    #[serde(default)]
    pub caption_entities: Vec<MessageEntity>,
}

impl ChannelPost {
    /// Text or caption, with the entities that index into it.
    pub fn body(&self) -> Option<(&str, &[MessageEntity])> {
        match (&self.text, &self.caption) {
            (Some(t), _) if !t.trim().is_empty() => Some((t.as_str(), &self.entities)),
            (_, Some(c)) if !c.trim().is_empty() => Some((c.as_str(), &self.caption_entities)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// `offset`/`length` are in UTF-16 code units.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default)]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_url_joins_base_and_token() {
        let bot = TelegramBot::new("123:abc").with_api_base("http://localhost:8081/");
        assert_eq!(
            bot.method_url("sendMessage"),
            "http://localhost:8081/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn retries_are_clamped() {
        assert_eq!(TelegramBot::new("t").with_retries(0).max_retries, 1);
        assert_eq!(TelegramBot::new("t").with_retries(200).max_retries, MAX_RETRIES);
    }

    #[test]
    fn debug_hides_token() {
        let bot = TelegramBot::new("123:secret");
        assert!(!format!("{bot:?}").contains("secret"));
    }

    #[test]
    fn send_body_maps_options() {
        let html = SendMessageBody::new("@chan", "<b>x</b>", SendOptions::default());
        let v = serde_json::to_value(&html).unwrap();
        assert_eq!(v["parse_mode"], "HTML");
        assert_eq!(v["link_preview_options"]["is_disabled"], false);

        let plain = SendMessageBody::new(
            "@chan",
            "x",
            SendOptions {
                content_type: ContentType::Plain,
                preview: false,
            },
        );
        let v = serde_json::to_value(&plain).unwrap();
        assert!(v.get("parse_mode").is_none());
        assert_eq!(v["link_preview_options"]["is_disabled"], true);
    }

    #[test]
    fn decode_ok_and_api_errors() {
        let ok: SentMessage =
            decode_response("sendMessage", 200, r#"{"ok":true,"result":{"message_id":7}}"#)
                .unwrap();
        assert_eq!(ok.message_id, 7);

        let err = decode_response::<SentMessage>(
            "sendMessage",
            400,
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )
        .unwrap_err();
        match err {
            DeliveryError::Api {
                status,
                description,
                ..
            } => {
                assert_eq!(status, 400);
                assert!(description.contains("chat not found"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = decode_response::<SentMessage>("sendMessage", 502, "<html>bad gateway</html>")
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Api { status: 502, .. }));
    }

    #[test]
    fn updates_parse_channel_posts() {
        let body = r#"{"ok":true,"result":[
            {"update_id":10,"channel_post":{"message_id":1,"chat":{"id":-100,"username":"FxNews","type":"channel"},
              "text":"hello https://x/1","entities":[{"type":"url","offset":6,"length":9}]}},
            {"update_id":11,"edited_channel_post":{"message_id":1,"chat":{"id":-100}}}
        ]}"#;
        let ups: Vec<Update> = decode_response("getUpdates", 200, body).unwrap();
        assert_eq!(ups.len(), 2);
        let post = ups[0].channel_post.as_ref().unwrap();
        assert_eq!(post.chat.username.as_deref(), Some("FxNews"));
        let (text, ents) = post.body().unwrap();
        assert!(text.starts_with("hello"));
        assert_eq!(ents[0].kind, "url");
        assert!(ups[1].channel_post.is_none());
    }
}
