// src/state.rs
//! Delivery bookkeeping: item identifiers, the persisted set of delivered ids,
//! the freshness filter and the run lock around load → persist.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::feed::NewsItem;

/// How an item's identifier is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentifierMode {
    /// SHA-256 over (source, link, title, published). Survives guid churn upstream.
    #[default]
    ContentHash,
    /// Feed guid, else link, else the content hash.
    FeedId,
}

/// Stable key naming one logical news item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pure and deterministic: identical (source, link, title, published) → identical id.
pub fn compute_identifier(item: &NewsItem, mode: IdentifierMode) -> Identifier {
    match mode {
        IdentifierMode::ContentHash => content_hash(item),
        IdentifierMode::FeedId => [item.guid.as_deref(), item.link.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(|s| Identifier(s.to_string()))
            .unwrap_or_else(|| content_hash(item)),
    }
}

fn content_hash(item: &NewsItem) -> Identifier {
    let mut hasher = Sha256::new();
    // 0x1f (unit separator) keeps ("ab","c") and ("a","bc") apart
    for field in [
        item.source.as_str(),
        item.link.as_deref().unwrap_or_default(),
        item.title.as_deref().unwrap_or_default(),
        item.published.as_deref().unwrap_or_default(),
    ] {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    Identifier(out)
}

/* ----------------------------
Delivery state
---------------------------- */

/// Set of identifiers already delivered. Persisted as a JSON array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryState {
    ids: BTreeSet<Identifier>,
}

impl DeliveryState {
    /// Missing, unreadable or corrupt state → empty set. Never fails.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no delivery state yet; starting empty");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable delivery state; starting empty");
                return Self::default();
            }
        };
        match serde_json::from_str::<Vec<Identifier>>(&raw) {
            Ok(ids) => Self {
                ids: ids.into_iter().collect(),
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt delivery state; starting empty");
                Self::default()
            }
        }
    }

    /// Write the full set atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let ids: Vec<&Identifier> = self.ids.iter().collect();
        let bytes = serde_json::to_vec(&ids).context("serialize delivery state")?;
        write_atomic(path, &bytes)
    }

    pub fn is_new(&self, id: &Identifier) -> bool {
        !self.ids.contains(id)
    }

    /// Returns false if the id was already present.
    pub fn record(&mut self, id: Identifier) -> bool {
        self.ids.insert(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("create state dir {}", dir.display()))?;
    }
    let tmp = tmp_path(path);
    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("create temp state {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write temp state {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/* ----------------------------
Age filter
---------------------------- */

/// Missing timestamp ⇒ not fresh. Timestamps in the future count as fresh,
/// as does everything when the window reaches past the representable range.
pub fn is_fresh(published_ts: Option<i64>, now: DateTime<Utc>, max_age: ChronoDuration) -> bool {
    match (published_ts, now.checked_sub_signed(max_age)) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(ts), Some(cutoff)) => ts >= cutoff.timestamp(),
    }
}

/* ----------------------------
Run lock
---------------------------- */

/// Exclusive `<state>.lock` file held from state load until persist.
/// Released on drop. A lock older than `stale_after` is taken over.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    token: String,
}

impl RunLock {
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

    /// `Ok(None)` when another live run holds the lock.
    pub fn acquire(state_path: &Path, stale_after: Duration) -> Result<Option<Self>> {
        let mut name = state_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        let path = state_path.with_file_name(name);

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("create lock dir {}", dir.display()))?;
        }

        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let token = format!("{}-{}", std::process::id(), nanos);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    writeln!(f, "{token}")
                        .with_context(|| format!("write run lock {}", path.display()))?;
                    return Ok(Some(Self { path, token }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let age = fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|m| SystemTime::now().duration_since(m).ok());
                    match age {
                        Some(a) if a >= stale_after => {
                            tracing::warn!(lock = %path.display(), age_secs = a.as_secs(), "taking over stale run lock");
                            let _ = fs::remove_file(&path);
                        }
                        _ => return Ok(None),
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("create run lock {}", path.display()))
                }
            }
        }
        Ok(None)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // a run that took over our stale lock owns the file now
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim() == self.token => {}
            Ok(_) => {
                tracing::warn!(lock = %self.path.display(), "run lock was taken over; leaving it");
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(lock = %self.path.display(), error = %e, "failed to read run lock");
                return;
            }
        }
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item() -> NewsItem {
        NewsItem {
            source: "FXStreet".into(),
            guid: Some("guid-1".into()),
            title: Some("US CPI rises more than expected".into()),
            summary: Some("Inflation accelerated".into()),
            link: Some("https://x/1".into()),
            published: Some("2024-01-01".into()),
            published_ts: None,
        }
    }

    #[test]
    fn content_hash_is_stable_and_field_sensitive() {
        let a = compute_identifier(&item(), IdentifierMode::ContentHash);
        let b = compute_identifier(&item(), IdentifierMode::ContentHash);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let mut changed = item();
        changed.source = "DailyFX".into();
        assert_ne!(a, compute_identifier(&changed, IdentifierMode::ContentHash));

        let mut changed = item();
        changed.link = Some("https://x/2".into());
        assert_ne!(a, compute_identifier(&changed, IdentifierMode::ContentHash));

        let mut changed = item();
        changed.title = Some("US CPI rises".into());
        assert_ne!(a, compute_identifier(&changed, IdentifierMode::ContentHash));

        let mut changed = item();
        changed.published = Some("2024-01-02".into());
        assert_ne!(a, compute_identifier(&changed, IdentifierMode::ContentHash));
    }

    #[test]
    fn content_hash_ignores_summary_and_guid() {
        let a = compute_identifier(&item(), IdentifierMode::ContentHash);
        let mut other = item();
        other.summary = Some("edited".into());
        other.guid = Some("guid-2".into());
        assert_eq!(a, compute_identifier(&other, IdentifierMode::ContentHash));
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        let mut a = item();
        a.title = Some("ab".into());
        a.published = Some("c".into());
        let mut b = item();
        b.title = Some("a".into());
        b.published = Some("bc".into());
        assert_ne!(
            compute_identifier(&a, IdentifierMode::ContentHash),
            compute_identifier(&b, IdentifierMode::ContentHash)
        );
    }

    #[test]
    fn feed_id_mode_prefers_guid_then_link_then_hash() {
        assert_eq!(compute_identifier(&item(), IdentifierMode::FeedId).as_str(), "guid-1");

        let mut no_guid = item();
        no_guid.guid = None;
        assert_eq!(
            compute_identifier(&no_guid, IdentifierMode::FeedId).as_str(),
            "https://x/1"
        );

        no_guid.link = Some("  ".into());
        assert_eq!(
            compute_identifier(&no_guid, IdentifierMode::FeedId),
            compute_identifier(&no_guid, IdentifierMode::ContentHash)
        );
    }

    #[test]
    fn record_and_is_new() {
        let mut st = DeliveryState::default();
        let id = compute_identifier(&item(), IdentifierMode::ContentHash);
        assert!(st.is_new(&id));
        assert!(st.record(id.clone()));
        assert!(!st.is_new(&id));
        assert!(!st.record(id));
        assert_eq!(st.len(), 1);
    }

    #[test]
    fn load_tolerates_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("state.json");
        assert!(DeliveryState::load(&p).is_empty());

        fs::write(&p, b"{not json").unwrap();
        assert!(DeliveryState::load(&p).is_empty());

        fs::write(&p, [0xff, 0xfe, 0x00]).unwrap();
        assert!(DeliveryState::load(&p).is_empty());
    }

    #[test]
    fn save_then_load_keeps_ids() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nested").join("state.json");
        let mut st = DeliveryState::default();
        st.record(compute_identifier(&item(), IdentifierMode::ContentHash));
        st.record(compute_identifier(&item(), IdentifierMode::FeedId));
        st.save(&p).unwrap();

        let raw = fs::read_to_string(&p).unwrap();
        let arr: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(DeliveryState::load(&p), st);
        assert!(!tmp_path(&p).exists());
    }

    #[test]
    fn legacy_plain_id_arrays_load() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("state.json");
        fs::write(&p, r#"["https://www.fxstreet.com/news/a", "guid-9"]"#).unwrap();
        let st = DeliveryState::load(&p);
        assert_eq!(st.len(), 2);
    }

    #[test]
    fn freshness_window() {
        let now = Utc.with_ymd_and_hms(2025, 9, 6, 12, 0, 0).unwrap();
        let window = ChronoDuration::hours(24);
        assert!(is_fresh(Some(now.timestamp()), now, window));
        assert!(is_fresh(Some((now - ChronoDuration::hours(23)).timestamp()), now, window));
        assert!(!is_fresh(Some((now - ChronoDuration::hours(25)).timestamp()), now, window));
        assert!(!is_fresh(None, now, window));
        assert!(is_fresh(Some((now + ChronoDuration::hours(1)).timestamp()), now, window));
    }

    #[test]
    fn oversized_window_keeps_everything_fresh() {
        let now = Utc.with_ymd_and_hms(2025, 9, 6, 12, 0, 0).unwrap();
        let window = ChronoDuration::try_hours(10_000_000_000).unwrap();
        assert!(is_fresh(Some(0), now, window));
        assert!(!is_fresh(None, now, window));
    }

    #[test]
    fn run_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("state.json");
        let first = RunLock::acquire(&p, RunLock::DEFAULT_STALE_AFTER).unwrap();
        assert!(first.is_some());
        assert!(RunLock::acquire(&p, RunLock::DEFAULT_STALE_AFTER)
            .unwrap()
            .is_none());
        drop(first);
        assert!(RunLock::acquire(&p, RunLock::DEFAULT_STALE_AFTER)
            .unwrap()
            .is_some());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("state.json");
        let _held = RunLock::acquire(&p, RunLock::DEFAULT_STALE_AFTER).unwrap();
        // zero staleness: any existing lock counts as abandoned
        let again = RunLock::acquire(&p, Duration::ZERO).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn superseded_holder_leaves_the_new_lock_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("state.json");
        let lock_file = dir.path().join("state.json.lock");
        let old = RunLock::acquire(&p, RunLock::DEFAULT_STALE_AFTER)
            .unwrap()
            .unwrap();
        let new = RunLock::acquire(&p, Duration::ZERO).unwrap().unwrap();

        drop(old);
        assert!(lock_file.exists());
        assert!(RunLock::acquire(&p, RunLock::DEFAULT_STALE_AFTER)
            .unwrap()
            .is_none());

        drop(new);
        assert!(!lock_file.exists());
    }
}
