// src/rules.rs
//! Rule book: every keyword list, asset table and template string the relay uses,
//! loaded from TOML and compiled once.
//!
//! Resolution order for the rule file:
//! 1) $RULES_CONFIG_PATH (must exist)
//! 2) config/rules.toml
//! 3) the copy embedded at build time

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ConfigError;

pub const DEFAULT_RULES_PATH: &str = "config/rules.toml";
pub const ENV_RULES_PATH: &str = "RULES_CONFIG_PATH";

const EMBEDDED_RULES: &str = include_str!("../config/rules.toml");

/* ----------------------------
Config schema (from TOML)
---------------------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct RuleBookCfg {
    pub relevance: KeywordSet,
    pub impact: KeywordSet,
    #[serde(default)]
    pub pairs: Vec<PairCfg>,
    #[serde(default)]
    pub instruments: Vec<InstrumentCfg>,
    #[serde(default)]
    pub currencies: Vec<CurrencyCfg>,
    #[serde(default)]
    pub central_banks: Vec<CentralBankCfg>,
    pub direction: DirectionVocab,
    #[serde(default)]
    pub impact_notes: Vec<ImpactNoteCfg>,
    pub impact_fallback: ImpactFallback,
    #[serde(default)]
    pub template: TemplateCfg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordSet {
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairCfg {
    pub tag: String,
    pub base: String,
    pub quote: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentCfg {
    pub tag: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyCfg {
    pub code: String,
    pub names: Vec<String>,
    #[serde(default)]
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CentralBankCfg {
    pub currency: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectionVocab {
    pub up: Vec<String>,
    pub down: Vec<String>,
    pub flat: Vec<String>,
    pub volatile: Vec<String>,
    #[serde(default)]
    pub strengthen: Vec<String>,
    #[serde(default)]
    pub weaken: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpactNoteCfg {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub when: NoteWhen,
    pub sentence: String,
}

/// Condition of an impact note. Every present clause must hold.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoteWhen {
    pub any: Option<Vec<String>>,
    pub all: Option<Vec<String>>,
    pub none: Option<Vec<String>>,
    /// Direction labels, e.g. ["up", "volatile"].
    pub directions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpactFallback {
    pub sentence: String,
}

fn default_banner() -> String {
    "✅ <b>MARKET NEWS</b>".into()
}
fn default_headline_header() -> String {
    "📰 <b>Headline</b>".into()
}
fn default_body_header() -> String {
    "📌 <b>What happened?</b>".into()
}
fn default_impact_header() -> String {
    "📊 <b>Impact</b>".into()
}
fn default_source_header() -> String {
    "🕒 <b>Source &amp; time</b>".into()
}
fn default_link_label() -> String {
    "🔗 Read full article".into()
}
fn default_disclaimer() -> String {
    "This content is a direct reference to the original source and does not constitute trading advice."
        .into()
}
fn default_excerpt_budget() -> usize {
    800
}
fn default_max_len() -> usize {
    3800
}
fn default_missing_title() -> String {
    "Market update.".into()
}
fn default_missing_summary() -> String {
    "No summary was provided; see the source for details.".into()
}
fn default_true() -> bool {
    true
}

/// Fixed pieces of the rendered post. Header strings are trusted markup;
/// everything else is escaped by the renderer.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateCfg {
    #[serde(default = "default_banner")]
    pub banner: String,
    #[serde(default = "default_headline_header")]
    pub headline_header: String,
    #[serde(default = "default_body_header")]
    pub body_header: String,
    #[serde(default = "default_impact_header")]
    pub impact_header: String,
    #[serde(default = "default_source_header")]
    pub source_header: String,
    /// Plain text; the emoji prefix (if any) stays outside the anchor.
    #[serde(default = "default_link_label")]
    pub link_label: String,
    #[serde(default = "default_disclaimer")]
    pub disclaimer: String,
    #[serde(default = "default_true")]
    pub show_impact: bool,
    #[serde(default = "default_true")]
    pub show_link: bool,
    #[serde(default = "default_true")]
    pub show_hashtags: bool,
    #[serde(default = "default_excerpt_budget")]
    pub excerpt_budget: usize,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_missing_title")]
    pub missing_title: String,
    #[serde(default = "default_missing_summary")]
    pub missing_summary: String,
}

impl Default for TemplateCfg {
    fn default() -> Self {
        Self {
            banner: default_banner(),
            headline_header: default_headline_header(),
            body_header: default_body_header(),
            impact_header: default_impact_header(),
            source_header: default_source_header(),
            link_label: default_link_label(),
            disclaimer: default_disclaimer(),
            show_impact: true,
            show_link: true,
            show_hashtags: true,
            excerpt_budget: default_excerpt_budget(),
            max_len: default_max_len(),
            missing_title: default_missing_title(),
            missing_summary: default_missing_summary(),
        }
    }
}

/* ----------------------------
Compiled structures
---------------------------- */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetKind {
    Pair { base: String, quote: String },
    Instrument,
    Currency,
}

#[derive(Debug)]
pub(crate) struct CompiledPair {
    pub tag: String,
    pub base: String,
    pub quote: String,
    pub hashtags: Vec<String>,
    pub re: Regex,
}

#[derive(Debug)]
pub(crate) struct CompiledInstrument {
    pub tag: String,
    pub hashtags: Vec<String>,
    pub re: Regex,
}

#[derive(Debug)]
pub(crate) struct CompiledCurrency {
    pub code: String,
    pub hashtags: Vec<String>,
    /// Space-padded lowercase needles, e.g. " usd ".
    pub padded: Vec<String>,
    pub strengthens: Option<Regex>,
    pub weakens: Option<Regex>,
}

#[derive(Debug)]
pub(crate) struct CompiledBank {
    pub currency: String,
    pub keywords: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct CompiledDirection {
    pub up: Option<Regex>,
    pub down: Option<Regex>,
    pub flat: Option<Regex>,
    pub volatile: Option<Regex>,
}

/// Compiled rule book shared by the classifier and the renderer.
#[derive(Debug)]
pub struct RuleBook {
    pub cfg: RuleBookCfg,
    pub(crate) relevance: Vec<String>,
    /// Whole-word alternation over the impact keywords.
    pub(crate) impact: Option<Regex>,
    pub(crate) pairs: Vec<CompiledPair>,
    pub(crate) instruments: Vec<CompiledInstrument>,
    pub(crate) currencies: Vec<CompiledCurrency>,
    pub(crate) banks: Vec<CompiledBank>,
    pub(crate) direction: CompiledDirection,
}

impl RuleBook {
    /// Load using env var + fallbacks. Any failure is a configuration error.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(p) = std::env::var(ENV_RULES_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(ConfigError::MissingFile {
                    var: ENV_RULES_PATH,
                    path: pb,
                });
            }
            return Self::load_from(&pb).map_err(ConfigError::invalid("rule book"));
        }
        let local = PathBuf::from(DEFAULT_RULES_PATH);
        if local.exists() {
            return Self::load_from(&local).map_err(ConfigError::invalid("rule book"));
        }
        Self::embedded().map_err(ConfigError::invalid("rule book"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading rule book from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// The rule book compiled into the binary.
    pub fn embedded() -> Result<Self> {
        Self::from_toml_str(EMBEDDED_RULES)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let cfg: RuleBookCfg = toml::from_str(toml_str).context("parsing rule book toml")?;

        let relevance = clean_keywords(&cfg.relevance.keywords);
        let impact = word_alternation(&cfg.impact.keywords)
            .map_err(|e| anyhow!("impact keywords regex error: {e}"))?;
        if relevance.is_empty() {
            return Err(anyhow!("rule book has no relevance keywords"));
        }

        let pairs = cfg
            .pairs
            .iter()
            .map(|p| {
                let pattern = format!(
                    r"(?i)\b{}\s*[/\-]?\s*{}\b",
                    regex::escape(p.base.trim()),
                    regex::escape(p.quote.trim())
                );
                let re = Regex::new(&pattern)
                    .map_err(|e| anyhow!("pair `{}` regex error: {}", p.tag, e))?;
                Ok(CompiledPair {
                    tag: p.tag.to_ascii_uppercase(),
                    base: p.base.to_ascii_uppercase(),
                    quote: p.quote.to_ascii_uppercase(),
                    hashtags: hashtags_or_tag(&p.hashtags, &p.tag),
                    re,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let instruments = cfg
            .instruments
            .iter()
            .map(|i| {
                let re = word_alternation(&i.keywords)
                    .map_err(|e| anyhow!("instrument `{}` regex error: {}", i.tag, e))?
                    .ok_or_else(|| anyhow!("instrument `{}` has no keywords", i.tag))?;
                Ok(CompiledInstrument {
                    tag: i.tag.to_ascii_uppercase(),
                    hashtags: hashtags_or_tag(&i.hashtags, &i.tag),
                    re,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let currencies = cfg
            .currencies
            .iter()
            .map(|c| {
                let names = clean_keywords(&c.names);
                let padded = names.iter().map(|n| format!(" {n} ")).collect();
                let strengthens = subject_verb_regex(&names, &cfg.direction.strengthen)
                    .map_err(|e| anyhow!("currency `{}` regex error: {}", c.code, e))?;
                let weakens = subject_verb_regex(&names, &cfg.direction.weaken)
                    .map_err(|e| anyhow!("currency `{}` regex error: {}", c.code, e))?;
                Ok(CompiledCurrency {
                    code: c.code.to_ascii_uppercase(),
                    hashtags: hashtags_or_tag(&c.hashtags, &c.code),
                    padded,
                    strengthens,
                    weakens,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let banks = cfg
            .central_banks
            .iter()
            .map(|b| CompiledBank {
                currency: b.currency.to_ascii_uppercase(),
                keywords: clean_keywords(&b.keywords),
            })
            .collect();

        let d = &cfg.direction;
        let direction = CompiledDirection {
            up: word_alternation(&d.up).map_err(|e| anyhow!("direction `up` regex error: {e}"))?,
            down: word_alternation(&d.down)
                .map_err(|e| anyhow!("direction `down` regex error: {e}"))?,
            flat: word_alternation(&d.flat)
                .map_err(|e| anyhow!("direction `flat` regex error: {e}"))?,
            volatile: word_alternation(&d.volatile)
                .map_err(|e| anyhow!("direction `volatile` regex error: {e}"))?,
        };

        if cfg.template.max_len < 16 || cfg.template.excerpt_budget == 0 {
            return Err(anyhow!(
                "template limits out of range (max_len={}, excerpt_budget={})",
                cfg.template.max_len,
                cfg.template.excerpt_budget
            ));
        }

        Ok(Self {
            cfg,
            relevance,
            impact,
            pairs,
            instruments,
            currencies,
            banks,
            direction,
        })
    }

    pub fn template(&self) -> &TemplateCfg {
        &self.cfg.template
    }

    /// Hashtags configured for an asset tag, or `#TAG` when none are.
    pub fn hashtags_for(&self, tag: &str) -> Vec<String> {
        if let Some(p) = self.pairs.iter().find(|p| p.tag == tag) {
            return p.hashtags.clone();
        }
        if let Some(i) = self.instruments.iter().find(|i| i.tag == tag) {
            return i.hashtags.clone();
        }
        if let Some(c) = self.currencies.iter().find(|c| c.code == tag) {
            return c.hashtags.clone();
        }
        vec![format!("#{tag}")]
    }
}

/// Trim + lowercase + drop empties, preserving order.
fn clean_keywords(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for it in items {
        let t = it.trim().to_lowercase();
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

fn hashtags_or_tag(tags: &[String], tag: &str) -> Vec<String> {
    if tags.is_empty() {
        vec![format!("#{}", tag.to_ascii_uppercase())]
    } else {
        tags.to_vec()
    }
}

/// `(?i)\b(?:w1|w2|...)\b` over escaped words; `None` for an empty list.
fn word_alternation(words: &[String]) -> Result<Option<Regex>, regex::Error> {
    let words = clean_keywords(words);
    if words.is_empty() {
        return Ok(None);
    }
    let alts: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alts.join("|"))).map(Some)
}

/// `<name> <verb>` with at most one word in between ("dollar broadly strengthens").
fn subject_verb_regex(names: &[String], verbs: &[String]) -> Result<Option<Regex>, regex::Error> {
    let verbs = clean_keywords(verbs);
    if names.is_empty() || verbs.is_empty() {
        return Ok(None);
    }
    let n: Vec<String> = names.iter().map(|w| regex::escape(w)).collect();
    let v: Vec<String> = verbs.iter().map(|w| regex::escape(w)).collect();
    Regex::new(&format!(
        r"(?i)\b(?:{})\b(?:\s+\w+)?\s+(?:{})\b",
        n.join("|"),
        v.join("|")
    ))
    .map(Some)
}
