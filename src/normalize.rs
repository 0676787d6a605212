// src/normalize.rs
//! Text normalization shared by the classifier, the renderer and the translation relay.
//!
//! Two forms are produced from raw feed text:
//! - a plain form (entities decoded, tags stripped, whitespace collapsed) used for
//!   keyword scanning and display;
//! - an escaped form that is safe inside Telegram's HTML parse mode.
//!
//! Nothing here truncates; length budgets belong to `render`.

use once_cell::sync::OnceCell;
use regex::Regex;

fn tag_regex() -> &'static Regex {
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[a-z!][^>]*>").expect("tag regex"))
}

fn ws_regex() -> &'static Regex {
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    RE_WS.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

/// Markup-free, whitespace-collapsed plain text. `None` is treated as empty.
pub fn plain_text(raw: Option<&str>) -> String {
    let Some(s) = raw else {
        return String::new();
    };

    // 1) Tags first so that `&lt;b&gt;` written as text survives as a literal
    let mut out = strip_tags(s);

    // 2) HTML entity decode
    out = html_escape::decode_html_entities(&out).to_string();

    // 3) Normalize typographic quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");

    // 4) Collapse whitespace
    out = ws_regex().replace_all(&out, " ").to_string();
    out.trim().to_string()
}

/// Best-effort tag removal. Unterminated tags stay as literal text.
pub fn strip_tags(s: &str) -> String {
    tag_regex().replace_all(s, "").to_string()
}

/// Escape user text for HTML parse mode (`&`, `<`, `>`).
pub fn escape_text(s: &str) -> String {
    html_escape::encode_text(s).to_string()
}

/// Escape a value placed inside a double-quoted attribute (`href="..."`).
pub fn escape_attr(s: &str) -> String {
    html_escape::encode_double_quoted_attribute(s).to_string()
}

/// Case-folded scan form used by the classifiers.
pub fn fold(s: &str) -> String {
    s.to_lowercase()
}
