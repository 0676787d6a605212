//! News relay entrypoint: one run over all configured feeds, then exit.
//! Meant to be triggered by an external scheduler (cron, CI schedule).

use std::process::ExitCode;
use std::sync::Arc;

use market_news_relay::config::{load_feeds_default, ConfigError, RelaySettings};
use market_news_relay::feed::{FeedSource, RssFeed};
use market_news_relay::logging;
use market_news_relay::notify::TelegramBot;
use market_news_relay::pipeline::{NewsRelay, RelayOptions};
use market_news_relay::rules::RuleBook;

fn build() -> Result<NewsRelay, ConfigError> {
    let settings = RelaySettings::from_env()?;
    let rules = Arc::new(RuleBook::load_default()?);
    let feeds: Vec<Box<dyn FeedSource>> = load_feeds_default()?
        .into_iter()
        .map(|f| Box::new(RssFeed::from_url(f.name, f.url)) as Box<dyn FeedSource>)
        .collect();

    let bot = TelegramBot::new(settings.bot_token.clone())
        .with_api_base(settings.api_base.clone())
        .with_timeout(settings.send_timeout);

    Ok(NewsRelay::new(
        RelayOptions::from(&settings),
        rules,
        feeds,
        Arc::new(bot),
    ))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // .env in local runs; no-op when absent
    let _ = dotenvy::dotenv();
    logging::init();

    let relay = match build() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    match relay.run_once().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "run failed");
            ExitCode::FAILURE
        }
    }
}
