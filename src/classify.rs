// src/classify.rs
//! Rule-driven classification of a news item:
//! - relevance: broad substring OR over title + summary + link;
//! - impact: narrow whole-word OR over title + summary (Tier-1 macro events);
//! - extraction: primary asset (pair → instrument → lone currency), direction,
//!   affected assets and cautious impact notes.
//!
//! All vocabulary lives in the `RuleBook`; nothing here branches on literal keywords.

use serde::Serialize;
use std::sync::Arc;

use crate::normalize::fold;
use crate::rules::{AssetKind, NoteWhen, RuleBook};

/// Affected-assets cap.
pub const MAX_AFFECTED_ASSETS: usize = 4;
/// Impact notes rendered per item.
pub const MAX_IMPACT_NOTES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Up,
    Down,
    Range,
    Volatile,
    NotStated,
}

impl Direction {
    /// Label used in rule files (`directions = ["up"]`).
    pub fn rule_label(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Range => "range",
            Direction::Volatile => "volatile",
            Direction::NotStated => "not_stated",
        }
    }

    /// Human wording for the rendered post.
    pub fn describe(&self) -> &'static str {
        match self {
            Direction::Up => "Up",
            Direction::Down => "Down",
            Direction::Range => "Range-bound",
            Direction::Volatile => "Volatile / contradictory",
            Direction::NotStated => "Not stated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub tag: String,
    pub kind: AssetKind,
}

/// Derived per item, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub is_relevant: bool,
    pub is_high_impact: bool,
    pub primary_asset: Option<Asset>,
    pub direction: Direction,
    /// Primary asset first, then central-bank currencies; at most `MAX_AFFECTED_ASSETS`.
    pub affected_assets: Vec<String>,
    pub impact_notes: Vec<String>,
}

/// Extractor output (the part of `Classification` that needs no gating).
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub primary_asset: Option<Asset>,
    pub direction: Direction,
    pub affected_assets: Vec<String>,
    pub impact_notes: Vec<String>,
}

/// Case-folded text plus its space-padded word form (" eur usd falls ").
#[derive(Debug, Clone)]
pub struct ScanText {
    folded: String,
    padded: String,
}

impl ScanText {
    pub fn new(parts: &[&str]) -> Self {
        let folded = fold(&parts.join(" "));
        let mut padded = String::with_capacity(folded.len() + 2);
        padded.push(' ');
        let mut last_space = true;
        for ch in folded.chars() {
            if ch.is_alphanumeric() {
                padded.push(ch);
                last_space = false;
            } else if !last_space {
                padded.push(' ');
                last_space = true;
            }
        }
        if !last_space {
            padded.push(' ');
        }
        Self { folded, padded }
    }

    pub fn folded(&self) -> &str {
        &self.folded
    }

    fn has_word(&self, needle: &str) -> bool {
        self.padded.contains(&format!(" {needle} "))
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Arc<RuleBook>,
}

impl Classifier {
    pub fn new(rules: Arc<RuleBook>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleBook {
        &self.rules
    }

    /// Pure OR: one keyword hit anywhere is enough. Empty text is never relevant.
    pub fn is_relevant(&self, title: &str, summary: &str, link: &str) -> bool {
        let text = fold(&[title, summary, link].join(" "));
        contains_any(&text, &self.rules.relevance)
    }

    pub fn is_high_impact(&self, title: &str, summary: &str) -> bool {
        let text = [title, summary].join(" ");
        self.rules
            .impact
            .as_ref()
            .is_some_and(|re| re.is_match(&text))
    }

    /// Asset, direction, affected assets and notes from title + summary.
    pub fn extract(&self, title: &str, summary: &str) -> Extraction {
        let scan = ScanText::new(&[title, summary]);
        let primary_asset = self.primary_asset(&scan);
        let direction = self.direction(&scan, primary_asset.as_ref());
        let affected_assets = self.affected_assets(&scan, primary_asset.as_ref());
        let impact_notes = self.impact_notes(&scan, direction, primary_asset.as_ref());
        Extraction {
            primary_asset,
            direction,
            affected_assets,
            impact_notes,
        }
    }

    /// Every stage at once; the orchestrator short-circuits instead.
    pub fn classify(&self, title: &str, summary: &str, link: &str) -> Classification {
        let ex = self.extract(title, summary);
        Classification {
            is_relevant: self.is_relevant(title, summary, link),
            is_high_impact: self.is_high_impact(title, summary),
            primary_asset: ex.primary_asset,
            direction: ex.direction,
            affected_assets: ex.affected_assets,
            impact_notes: ex.impact_notes,
        }
    }

    /// Strict priority: currency pair, then instrument, then lone currency.
    pub fn primary_asset(&self, scan: &ScanText) -> Option<Asset> {
        if let Some(p) = self.rules.pairs.iter().find(|p| p.re.is_match(&scan.folded)) {
            return Some(Asset {
                tag: p.tag.clone(),
                kind: AssetKind::Pair {
                    base: p.base.clone(),
                    quote: p.quote.clone(),
                },
            });
        }
        if let Some(i) = self
            .rules
            .instruments
            .iter()
            .find(|i| i.re.is_match(&scan.folded))
        {
            return Some(Asset {
                tag: i.tag.clone(),
                kind: AssetKind::Instrument,
            });
        }
        self.rules
            .currencies
            .iter()
            .find(|c| c.padded.iter().any(|n| scan.padded.contains(n.as_str())))
            .map(|c| Asset {
                tag: c.code.clone(),
                kind: AssetKind::Currency,
            })
    }

    /// Both sides present or explicit volatility → `Volatile`; never picks a side.
    /// No vocabulary at all → pair inference, else `NotStated`.
    pub fn direction(&self, scan: &ScanText, primary: Option<&Asset>) -> Direction {
        let d = &self.rules.direction;
        let hit = |re: &Option<regex::Regex>| re.as_ref().is_some_and(|r| r.is_match(&scan.folded));

        let up = hit(&d.up);
        let down = hit(&d.down);
        if hit(&d.volatile) || (up && down) {
            return Direction::Volatile;
        }
        if up {
            return Direction::Up;
        }
        if down {
            return Direction::Down;
        }
        if hit(&d.flat) {
            return Direction::Range;
        }
        match primary.map(|a| &a.kind) {
            Some(AssetKind::Pair { base, quote }) => self.pair_inference(scan, base, quote),
            _ => Direction::NotStated,
        }
    }

    /// Base strengthening lifts the pair; quote strengthening sinks it.
    fn pair_inference(&self, scan: &ScanText, base: &str, quote: &str) -> Direction {
        let matches = |code: &str, strong: bool| {
            self.rules
                .currencies
                .iter()
                .filter(|c| c.code == code)
                .any(|c| {
                    let re = if strong { &c.strengthens } else { &c.weakens };
                    re.as_ref().is_some_and(|r| r.is_match(&scan.folded))
                })
        };
        let up = matches(base, true) || matches(quote, false);
        let down = matches(base, false) || matches(quote, true);
        match (up, down) {
            (true, true) => Direction::Volatile,
            (true, false) => Direction::Up,
            (false, true) => Direction::Down,
            (false, false) => Direction::NotStated,
        }
    }

    pub fn affected_assets(&self, scan: &ScanText, primary: Option<&Asset>) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(MAX_AFFECTED_ASSETS);
        if let Some(a) = primary {
            out.push(a.tag.clone());
        }
        for bank in &self.rules.banks {
            if out.len() >= MAX_AFFECTED_ASSETS {
                break;
            }
            if out.contains(&bank.currency) {
                continue;
            }
            if bank.keywords.iter().any(|k| scan.has_word(k)) {
                out.push(bank.currency.clone());
            }
        }
        out
    }

    /// Matching notes in rule order, capped; the fallback sentence when none match.
    pub fn impact_notes(
        &self,
        scan: &ScanText,
        direction: Direction,
        primary: Option<&Asset>,
    ) -> Vec<String> {
        let asset = primary
            .map(|a| a.tag.as_str())
            .unwrap_or("the affected markets");
        let fill = |s: &str| {
            s.replace("{asset}", asset)
                .replace("{direction}", &direction.describe().to_lowercase())
        };

        let mut notes: Vec<String> = self
            .rules
            .cfg
            .impact_notes
            .iter()
            .filter(|n| note_matches(&scan.folded, direction, &n.when))
            .map(|n| fill(&n.sentence))
            .take(MAX_IMPACT_NOTES)
            .collect();
        if notes.is_empty() {
            notes.push(fill(&self.rules.cfg.impact_fallback.sentence));
        }
        notes
    }
}

fn contains_any(text: &str, keywords: &[String]) -> bool {
    !text.trim().is_empty() && keywords.iter().any(|k| text.contains(k.as_str()))
}

fn note_matches(text: &str, direction: Direction, w: &NoteWhen) -> bool {
    let has = |p: &String| text.contains(p.trim().to_lowercase().as_str());
    if let Some(v) = &w.any {
        if !v.iter().any(has) {
            return false;
        }
    }
    if let Some(v) = &w.all {
        if !v.iter().all(has) {
            return false;
        }
    }
    if let Some(v) = &w.none {
        if v.iter().any(has) {
            return false;
        }
    }
    if let Some(v) = &w.directions {
        if !v
            .iter()
            .any(|d| d.trim().eq_ignore_ascii_case(direction.rule_label()))
        {
            return false;
        }
    }
    true
}
