// src/notify/mod.rs
pub mod telegram;

use async_trait::async_trait;
use thiserror::Error;

pub use self::telegram::TelegramBot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    Html,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub content_type: ContentType,
    pub preview: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            content_type: ContentType::Html,
            preview: true,
        }
    }
}

/// A failed delivery of one message. Never fatal for a run.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{method}: request timed out")]
    Timeout { method: &'static str },
    #[error("{method}: http error: {source}")]
    Http {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method}: rejected with {status}: {description}")]
    Api {
        method: &'static str,
        status: u16,
        description: String,
    },
}

/// Messaging transport. The caller pre-truncates `text`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, target: &str, text: &str, opts: SendOptions) -> Result<(), DeliveryError>;
}
