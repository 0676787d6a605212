// src/config.rs
//! Process configuration: credentials and knobs from the environment, the feed list
//! from TOML/JSON. Everything is collected into explicit settings objects that are
//! handed to `NewsRelay` / `TranslationRelay`; nothing is read from globals later.
//!
//! Any `ConfigError` is fatal and surfaces before network activity starts.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::notify::telegram::DEFAULT_API_BASE;
use crate::state::IdentifierMode;

pub const ENV_FEEDS_PATH: &str = "FEEDS_CONFIG_PATH";
pub const DEFAULT_FEEDS_PATH: &str = "config/feeds.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("{var} points to non-existent path {}", path.display())]
    MissingFile { var: &'static str, path: PathBuf },

    #[error("invalid value for {var}: {value:?}")]
    Parse { var: &'static str, value: String },

    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
}

impl ConfigError {
    /// Adapter for `map_err` on anyhow results.
    pub fn invalid(what: &'static str) -> impl Fn(anyhow::Error) -> ConfigError {
        move |e| ConfigError::Invalid {
            what,
            reason: format!("{e:#}"),
        }
    }
}

/// Settings for the news relay binary.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub bot_token: String,
    pub channel: String,
    pub state_path: PathBuf,
    /// `None` disables the age filter.
    pub max_age: Option<chrono::Duration>,
    pub link_preview: bool,
    pub identifier_mode: IdentifierMode,
    pub send_timeout: Duration,
    pub api_base: String,
}

impl RelaySettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup (tests pass a map instead of the process env).
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = required(&get, "TELEGRAM_BOT_TOKEN")?;
        let channel = required(&get, "TELEGRAM_CHANNEL")?;

        let max_age_hours: i64 = parse_or(&get, "MAX_AGE_HOURS", 24)?;
        let max_age = match max_age_hours {
            0 => None,
            h if h > 0 => Some(chrono::Duration::try_hours(h).ok_or(ConfigError::Parse {
                var: "MAX_AGE_HOURS",
                value: h.to_string(),
            })?),
            h => {
                return Err(ConfigError::Parse {
                    var: "MAX_AGE_HOURS",
                    value: h.to_string(),
                })
            }
        };

        let identifier_mode = match optional(&get, "IDENTIFIER_MODE").as_deref() {
            None | Some("content_hash") => IdentifierMode::ContentHash,
            Some("feed_id") => IdentifierMode::FeedId,
            Some(other) => {
                return Err(ConfigError::Parse {
                    var: "IDENTIFIER_MODE",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            bot_token,
            channel,
            state_path: optional(&get, "STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("state.json")),
            max_age,
            link_preview: parse_bool_or(&get, "LINK_PREVIEW", true)?,
            identifier_mode,
            send_timeout: Duration::from_secs(parse_or(&get, "SEND_TIMEOUT_SECS", 20)?),
            api_base: optional(&get, "TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }
}

/// Settings for the translation relay binary.
#[derive(Debug, Clone)]
pub struct TranslateSettings {
    pub bot_token: String,
    /// Lowercase, without leading `@`.
    pub source_username: String,
    pub target_channel: String,
    pub state_path: PathBuf,
    pub translate_url: String,
    pub translate_api_key: Option<String>,
    pub from_lang: String,
    pub to_lang: String,
    pub send_timeout: Duration,
    pub api_base: String,
}

impl TranslateSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = required(&get, "TRANSLATOR_BOT_TOKEN")?;
        let source_username = required(&get, "SOURCE_CHANNEL_USERNAME")?
            .trim_start_matches('@')
            .to_lowercase();
        if source_username.is_empty() {
            return Err(ConfigError::Missing("SOURCE_CHANNEL_USERNAME"));
        }
        let target_channel = required(&get, "TARGET_CHANNEL")?;

        Ok(Self {
            bot_token,
            source_username,
            target_channel,
            state_path: optional(&get, "RELAY_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("relay_state.json")),
            translate_url: optional(&get, "TRANSLATE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:5000".to_string()),
            translate_api_key: optional(&get, "TRANSLATE_API_KEY"),
            from_lang: optional(&get, "TRANSLATE_FROM").unwrap_or_else(|| "en".to_string()),
            to_lang: optional(&get, "TRANSLATE_TO").unwrap_or_else(|| "fa".to_string()),
            send_timeout: Duration::from_secs(parse_or(&get, "SEND_TIMEOUT_SECS", 30)?),
            api_base: optional(&get, "TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }
}

fn optional<F: Fn(&str) -> Option<String>>(get: &F, key: &str) -> Option<String> {
    get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<F: Fn(&str) -> Option<String>>(
    get: &F,
    key: &'static str,
) -> Result<String, ConfigError> {
    optional(get, key).ok_or(ConfigError::Missing(key))
}

fn parse_or<F, T>(get: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match optional(get, key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Parse { var: key, value: v }),
    }
}

fn parse_bool_or<F>(get: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match optional(get, key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Parse { var: key, value: v }),
        },
    }
}

/* ----------------------------
Feed list
---------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedCfg {
    pub name: String,
    pub url: String,
}

/// Built-in feed list used when no feed file is configured.
pub fn default_feeds() -> Vec<FeedCfg> {
    [
        ("FXStreet", "https://www.fxstreet.com/rss/news"),
        ("DailyFX", "https://www.dailyfx.com/feeds/market-news"),
        ("Forexlive", "https://www.forexlive.com/feed/news/"),
    ]
    .into_iter()
    .map(|(name, url)| FeedCfg {
        name: name.to_string(),
        url: url.to_string(),
    })
    .collect()
}

/// Load the feed list from an explicit path. Supports TOML or JSON formats.
pub fn load_feeds_from(path: &Path) -> Result<Vec<FeedCfg>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading feed list from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_feeds(&content, ext.as_str())
}

/// Load the feed list using env var + fallbacks:
/// 1) $FEEDS_CONFIG_PATH
/// 2) config/feeds.toml
/// 3) built-in defaults
pub fn load_feeds_default() -> Result<Vec<FeedCfg>, ConfigError> {
    if let Ok(p) = std::env::var(ENV_FEEDS_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(ConfigError::MissingFile {
                var: ENV_FEEDS_PATH,
                path: pb,
            });
        }
        return load_feeds_from(&pb).map_err(ConfigError::invalid("feed list"));
    }
    let local = PathBuf::from(DEFAULT_FEEDS_PATH);
    if local.exists() {
        return load_feeds_from(&local).map_err(ConfigError::invalid("feed list"));
    }
    Ok(default_feeds())
}

fn parse_feeds(s: &str, hint_ext: &str) -> Result<Vec<FeedCfg>> {
    #[derive(Deserialize)]
    struct TomlFeeds {
        feeds: Vec<FeedCfg>,
    }

    let parsed = if hint_ext == "json" {
        serde_json::from_str::<Vec<FeedCfg>>(s).context("parsing feed list json")?
    } else {
        toml::from_str::<TomlFeeds>(s)
            .context("parsing feed list toml")?
            .feeds
    };
    clean_feeds(parsed)
}

/// Trim names/urls, reject blanks and duplicate names (names label the state keys).
fn clean_feeds(items: Vec<FeedCfg>) -> Result<Vec<FeedCfg>> {
    let mut out: Vec<FeedCfg> = Vec::with_capacity(items.len());
    for it in items {
        let name = it.name.trim().to_string();
        let url = it.url.trim().to_string();
        if name.is_empty() || url.is_empty() {
            return Err(anyhow!("feed entries need both name and url"));
        }
        if out.iter().any(|f| f.name.eq_ignore_ascii_case(&name)) {
            return Err(anyhow!("duplicate feed name `{name}`"));
        }
        out.push(FeedCfg { name, url });
    }
    if out.is_empty() {
        return Err(anyhow!("feed list is empty"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let err = RelaySettings::from_lookup(lookup(&[("TELEGRAM_CHANNEL", "@x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TELEGRAM_BOT_TOKEN")));

        let err = RelaySettings::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_CHANNEL", "   "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TELEGRAM_CHANNEL")));
    }

    #[test]
    fn relay_defaults() {
        let s = RelaySettings::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_CHANNEL", "@chan"),
        ]))
        .unwrap();
        assert_eq!(s.state_path, PathBuf::from("state.json"));
        assert_eq!(s.max_age, Some(chrono::Duration::hours(24)));
        assert!(s.link_preview);
        assert_eq!(s.identifier_mode, IdentifierMode::ContentHash);
        assert_eq!(s.send_timeout, Duration::from_secs(20));
    }

    #[test]
    fn zero_max_age_disables_filter_and_bad_values_fail() {
        let s = RelaySettings::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_CHANNEL", "@chan"),
            ("MAX_AGE_HOURS", "0"),
            ("IDENTIFIER_MODE", "feed_id"),
            ("LINK_PREVIEW", "off"),
        ]))
        .unwrap();
        assert_eq!(s.max_age, None);
        assert_eq!(s.identifier_mode, IdentifierMode::FeedId);
        assert!(!s.link_preview);

        let err = RelaySettings::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_CHANNEL", "@chan"),
            ("MAX_AGE_HOURS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { var: "MAX_AGE_HOURS", .. }));
    }

    #[test]
    fn out_of_range_max_age_is_a_config_error() {
        for v in ["9223372036854775807", "-3"] {
            let err = RelaySettings::from_lookup(lookup(&[
                ("TELEGRAM_BOT_TOKEN", "t"),
                ("TELEGRAM_CHANNEL", "@chan"),
                ("MAX_AGE_HOURS", v),
            ]))
            .unwrap_err();
            assert!(matches!(err, ConfigError::Parse { var: "MAX_AGE_HOURS", .. }));
        }

        // representable, but reaches past the earliest date
        let s = RelaySettings::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_CHANNEL", "@chan"),
            ("MAX_AGE_HOURS", "10000000000"),
        ]))
        .unwrap();
        assert!(s.max_age.is_some());
    }

    #[test]
    fn translate_settings_normalize_username() {
        let s = TranslateSettings::from_lookup(lookup(&[
            ("TRANSLATOR_BOT_TOKEN", "t"),
            ("SOURCE_CHANNEL_USERNAME", "@MarketNews"),
            ("TARGET_CHANNEL", "@fa_news"),
        ]))
        .unwrap();
        assert_eq!(s.source_username, "marketnews");
        assert_eq!(s.from_lang, "en");
        assert_eq!(s.to_lang, "fa");

        let err = TranslateSettings::from_lookup(lookup(&[
            ("TRANSLATOR_BOT_TOKEN", "t"),
            ("SOURCE_CHANNEL_USERNAME", "@"),
            ("TARGET_CHANNEL", "@fa_news"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SOURCE_CHANNEL_USERNAME")));
    }

    #[test]
    fn feed_formats_parse_and_validate() {
        let toml = r#"
[[feeds]]
name = " FXStreet "
url = "https://www.fxstreet.com/rss/news"
"#;
        let v = parse_feeds(toml, "toml").unwrap();
        assert_eq!(v[0].name, "FXStreet");

        let json = r#"[{"name":"A","url":"https://a"},{"name":"a","url":"https://b"}]"#;
        assert!(parse_feeds(json, "json").is_err(), "duplicate names rejected");

        assert!(parse_feeds("feeds = []", "toml").is_err());
    }
}
