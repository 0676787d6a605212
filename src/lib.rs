// src/lib.rs
// Public library surface for the two binaries and the integration tests.

pub mod classify;
pub mod config;
pub mod feed;
pub mod logging;
pub mod normalize;
pub mod notify;
pub mod pipeline;
pub mod relay;
pub mod render;
pub mod rules;
pub mod state;
pub mod translate;

// ---- Re-exports for stable public API ----
pub use crate::classify::{Classification, Classifier, Direction};
pub use crate::feed::{FeedSource, NewsItem};
pub use crate::notify::{DeliveryError, Notifier, SendOptions};
pub use crate::pipeline::{NewsRelay, RelayOptions, RunReport};
pub use crate::rules::RuleBook;
pub use crate::state::{compute_identifier, DeliveryState, Identifier, IdentifierMode};
