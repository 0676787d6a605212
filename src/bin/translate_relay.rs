//! Translation relay entrypoint: one `getUpdates` batch from the source channel,
//! translated and re-posted to the target channel.

use std::process::ExitCode;
use std::sync::Arc;

use market_news_relay::config::{ConfigError, TranslateSettings};
use market_news_relay::logging;
use market_news_relay::notify::TelegramBot;
use market_news_relay::relay::{TranslateOptions, TranslationRelay};
use market_news_relay::rules::RuleBook;
use market_news_relay::translate::{LibreTranslateClient, PostLayout};

fn build() -> Result<TranslationRelay, ConfigError> {
    let settings = TranslateSettings::from_env()?;
    let rules = RuleBook::load_default()?;

    let bot = Arc::new(
        TelegramBot::new(settings.bot_token.clone())
            .with_api_base(settings.api_base.clone())
            .with_timeout(settings.send_timeout),
    );
    let translator = LibreTranslateClient::new(
        settings.translate_url.clone(),
        settings.translate_api_key.clone(),
        settings.from_lang.clone(),
        settings.to_lang.clone(),
        settings.send_timeout,
    );

    Ok(TranslationRelay::new(
        TranslateOptions::from(&settings),
        PostLayout::from_template(rules.template()),
        bot.clone(),
        bot,
        Arc::new(translator),
    ))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
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
            tracing::error!(error = %format!("{e:#}"), "relay run failed");
            ExitCode::FAILURE
        }
    }
}
