//! Editable detection identifiers.
//!
//! Each target carries an ordered list of structural UI identifiers, either a
//! bare resource name (`shorts_container`) or a fully-qualified one
//! (`com.google.android.youtube:id/shorts_container`). Lists are validated
//! before anything is written, persisted immediately, then published to
//! subscribers through a `watch` channel.

use crate::clock::Clock;
use crate::error::{GuardError, Result};
use crate::store::KeyValueStore;
use crate::target::{MonitoredTarget, PerTarget};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use regex::Regex;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;

pub const MIN_IDENTIFIER_LEN: usize = 3;
pub const MAX_IDENTIFIER_LEN: usize = 100;
pub const MAX_IDENTIFIERS: usize = 50;

const KEY_CONFIG: &str = "view_id_config";
const BUNDLED_DEFAULTS: &str = include_str!("../assets/view_ids.json");

// ============================================================================
// Validation
// ============================================================================

/// Why a single identifier was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierIssue {
    Empty,
    TooShort,
    TooLong,
    BadFormat,
}

impl fmt::Display for IdentifierIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierIssue::Empty => write!(f, "cannot be empty"),
            IdentifierIssue::TooShort => {
                write!(f, "must be at least {MIN_IDENTIFIER_LEN} characters")
            }
            IdentifierIssue::TooLong => write!(f, "cannot exceed {MAX_IDENTIFIER_LEN} characters"),
            IdentifierIssue::BadFormat => write!(
                f,
                "must be 'view_name' or 'com.package:id/view_name' using letters, digits, '_' and '.'"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("at least one identifier required")]
    Empty,

    #[error("cannot have more than {} identifiers (got {})", MAX_IDENTIFIERS, .0)]
    TooMany(usize),

    #[error("invalid identifiers: {}", format_invalid(.0))]
    InvalidEntries(Vec<(String, IdentifierIssue)>),

    #[error("duplicate identifiers found: {}", .0.join(", "))]
    Duplicates(Vec<String>),
}

fn format_invalid(entries: &[(String, IdentifierIssue)]) -> String {
    entries
        .iter()
        .map(|(id, issue)| format!("'{id}' {issue}"))
        .collect::<Vec<_>>()
        .join("; ")
}

static IDENTIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_.]+(:id/[a-zA-Z0-9_]+)?$").unwrap()
});

fn matches_identifier_format(id: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(id)
}

/// Check one identifier.
pub fn validate_identifier(id: &str) -> std::result::Result<(), IdentifierIssue> {
    let len = id.chars().count();
    if id.trim().is_empty() {
        Err(IdentifierIssue::Empty)
    } else if len < MIN_IDENTIFIER_LEN {
        Err(IdentifierIssue::TooShort)
    } else if len > MAX_IDENTIFIER_LEN {
        Err(IdentifierIssue::TooLong)
    } else if !matches_identifier_format(id) {
        Err(IdentifierIssue::BadFormat)
    } else {
        Ok(())
    }
}

/// Check a whole list. Every offending entry is named in the error.
pub fn validate_identifiers(ids: &[String]) -> std::result::Result<(), ValidationError> {
    if ids.is_empty() {
        return Err(ValidationError::Empty);
    }
    if ids.len() > MAX_IDENTIFIERS {
        return Err(ValidationError::TooMany(ids.len()));
    }

    let invalid: Vec<_> = ids
        .iter()
        .filter_map(|id| validate_identifier(id).err().map(|issue| (id.clone(), issue)))
        .collect();
    if !invalid.is_empty() {
        return Err(ValidationError::InvalidEntries(invalid));
    }

    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for id in ids {
        if !seen.insert(id.as_str()) && !duplicates.contains(id) {
            duplicates.push(id.clone());
        }
    }
    if !duplicates.is_empty() {
        return Err(ValidationError::Duplicates(duplicates));
    }

    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

/// Identifier lists for both targets at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierConfig {
    pub ids: PerTarget<Vec<String>>,
    /// Epoch milliseconds of the last accepted change; 0 for pristine defaults.
    pub last_updated: i64,
}

impl IdentifierConfig {
    pub fn identifiers(&self, target: MonitoredTarget) -> &[String] {
        self.ids.get(target)
    }
}

#[derive(Deserialize)]
struct DefaultBundle {
    youtube: Vec<String>,
    instagram: Vec<String>,
}

/// Parse a default-identifier bundle. A target whose list fails to parse or
/// validate falls back to its built-in list.
pub fn parse_default_bundle(raw: &str) -> PerTarget<Vec<String>> {
    let fallback = |t: MonitoredTarget| -> Vec<String> {
        t.fallback_identifiers().iter().map(|s| s.to_string()).collect()
    };

    let bundle = match serde_json::from_str::<DefaultBundle>(raw) {
        Ok(bundle) => bundle,
        Err(e) => {
            log::warn!("identifiers: default bundle unreadable, using built-in list: {e}");
            return PerTarget::from_fn(fallback);
        }
    };

    let mut parsed = PerTarget {
        youtube: bundle.youtube,
        instagram: bundle.instagram,
    };
    for target in MonitoredTarget::ALL {
        if let Err(e) = validate_identifiers(parsed.get(target)) {
            log::warn!("identifiers: bundled {target} list rejected ({e}), using built-in list");
            *parsed.get_mut(target) = fallback(target);
        }
    }
    parsed
}

/// The defaults shipped with the crate.
pub fn bundled_defaults() -> PerTarget<Vec<String>> {
    parse_default_bundle(BUNDLED_DEFAULTS)
}

// ============================================================================
// Repository
// ============================================================================

/// Owns the persisted identifier configuration and publishes every change.
pub struct IdentifierRepository {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    defaults: PerTarget<Vec<String>>,
    config_tx: watch::Sender<IdentifierConfig>,
    write_lock: Mutex<()>,
}

impl IdentifierRepository {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_defaults(store, clock, bundled_defaults())
    }

    pub fn with_defaults(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        defaults: PerTarget<Vec<String>>,
    ) -> Self {
        let initial = load_config(store.as_ref(), &defaults);
        let (config_tx, _) = watch::channel(initial);
        Self {
            store,
            clock,
            defaults,
            config_tx,
            write_lock: Mutex::new(()),
        }
    }

    /// Receive the current configuration and every later change.
    pub fn subscribe(&self) -> watch::Receiver<IdentifierConfig> {
        self.config_tx.subscribe()
    }

    pub fn current(&self) -> IdentifierConfig {
        self.config_tx.borrow().clone()
    }

    pub fn identifiers(&self, target: MonitoredTarget) -> Vec<String> {
        self.config_tx.borrow().identifiers(target).to_vec()
    }

    /// Replace one target's list. Rejected input leaves everything untouched.
    pub fn update(&self, target: MonitoredTarget, ids: Vec<String>) -> Result<()> {
        validate_identifiers(&ids)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.current();
        *next.ids.get_mut(target) = ids;
        next.last_updated = self.next_stamp();
        self.persist(&next)?;

        self.config_tx.send_replace(next);
        log::info!(
            "identifiers: updated {target} list ({} entries)",
            self.config_tx.borrow().identifiers(target).len()
        );
        Ok(())
    }

    /// Restore both targets to the bundled defaults.
    pub fn reset_to_defaults(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = IdentifierConfig {
            ids: self.defaults.clone(),
            last_updated: self.next_stamp(),
        };
        self.persist(&next)?;

        self.config_tx.send_replace(next);
        log::info!("identifiers: reset to defaults");
        Ok(())
    }

    /// Both lists and the stamp go out in one write, so a failure leaves the
    /// stored configuration as it was.
    fn persist(&self, config: &IdentifierConfig) -> Result<()> {
        let json = serde_json::to_string(config).map_err(|e| GuardError::Anyhow(e.into()))?;
        self.store.set_string(KEY_CONFIG, &json)?;
        Ok(())
    }

    /// Strictly increasing so two edits inside one millisecond still order.
    fn next_stamp(&self) -> i64 {
        let previous = self.config_tx.borrow().last_updated;
        self.clock.now_ms().max(previous + 1)
    }
}

fn load_config(store: &dyn KeyValueStore, defaults: &PerTarget<Vec<String>>) -> IdentifierConfig {
    let pristine = || IdentifierConfig {
        ids: defaults.clone(),
        last_updated: 0,
    };

    let stored = match store.get_raw(KEY_CONFIG) {
        Ok(Some(json)) => json,
        Ok(None) => return pristine(),
        Err(e) => {
            log::error!("identifiers: failed to load stored configuration, using defaults: {e}");
            return pristine();
        }
    };
    let mut config: IdentifierConfig = match serde_json::from_str(&stored) {
        Ok(config) => config,
        Err(e) => {
            log::error!("identifiers: stored configuration is corrupt, using defaults: {e}");
            return pristine();
        }
    };

    for target in MonitoredTarget::ALL {
        if let Err(e) = validate_identifiers(config.ids.get(target)) {
            log::warn!("identifiers: stored {target} list rejected ({e}), using defaults");
            *config.ids.get_mut(target) = defaults.get(target).clone();
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn repo() -> (Arc<MemoryStore>, Arc<ManualClock>, IdentifierRepository) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let repo = IdentifierRepository::new(store.clone(), clock.clone());
        (store, clock, repo)
    }

    #[test]
    fn test_identifier_format() {
        assert!(validate_identifier("shorts_container").is_ok());
        assert!(validate_identifier("com.google.android.youtube:id/reel_player_page").is_ok());
        assert!(validate_identifier("a.b").is_ok());

        assert_eq!(validate_identifier("ab"), Err(IdentifierIssue::TooShort));
        assert_eq!(validate_identifier("   "), Err(IdentifierIssue::Empty));
        assert_eq!(validate_identifier(&"x".repeat(101)), Err(IdentifierIssue::TooLong));
        assert!(validate_identifier(&"x".repeat(100)).is_ok());
        assert_eq!(validate_identifier("has space"), Err(IdentifierIssue::BadFormat));
        assert_eq!(validate_identifier("pkg:id/"), Err(IdentifierIssue::BadFormat));
        assert_eq!(validate_identifier(":id/name"), Err(IdentifierIssue::BadFormat));
        assert_eq!(validate_identifier("pkg:id/a.b"), Err(IdentifierIssue::BadFormat));
        assert_eq!(validate_identifier("pkg:view/abc"), Err(IdentifierIssue::BadFormat));
        assert_eq!(validate_identifier("a:id/b:id/c"), Err(IdentifierIssue::BadFormat));
    }

    #[test]
    fn test_list_validation() {
        assert_eq!(validate_identifiers(&[]), Err(ValidationError::Empty));
        assert_eq!(
            ValidationError::Empty.to_string(),
            "at least one identifier required"
        );

        let too_many: Vec<String> = (0..51).map(|i| format!("view_{i}")).collect();
        assert_eq!(validate_identifiers(&too_many), Err(ValidationError::TooMany(51)));
        assert!(validate_identifiers(&too_many[..50]).is_ok());

        let err = validate_identifiers(&ids(&["good_one", "ab", "bad id"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'ab'"));
        assert!(msg.contains("'bad id'"));
        assert!(!msg.contains("good_one"));

        let err = validate_identifiers(&ids(&["aaa", "bbb", "aaa", "aaa"])).unwrap_err();
        assert_eq!(err, ValidationError::Duplicates(ids(&["aaa"])));
    }

    #[test]
    fn test_bundle_fallback() {
        let parsed = parse_default_bundle("{ not json");
        assert_eq!(parsed.youtube[0], "shorts_player_page");
        assert_eq!(parsed.instagram[0], "clips_viewer_view_pager");

        let parsed = parse_default_bundle(r#"{"youtube": ["custom_view"], "instagram": []}"#);
        assert_eq!(parsed.youtube, ids(&["custom_view"]));
        assert_eq!(parsed.instagram.len(), 4);

        let bundled = bundled_defaults();
        assert!(validate_identifiers(&bundled.youtube).is_ok());
        assert!(validate_identifiers(&bundled.instagram).is_ok());
    }

    #[test]
    fn test_update_preserves_order_and_persists() {
        let (store, _clock, repo) = repo();
        let list = ids(&["zeta_view", "alpha_view", "com.instagram.android:id/mid_view"]);
        repo.update(MonitoredTarget::Instagram, list.clone()).unwrap();

        assert_eq!(repo.identifiers(MonitoredTarget::Instagram), list);
        assert_eq!(repo.current().last_updated, 1_000);

        // A fresh repository over the same store sees the same list.
        let reloaded = IdentifierRepository::new(store, Arc::new(ManualClock::new(5)));
        assert_eq!(reloaded.identifiers(MonitoredTarget::Instagram), list);
        assert_eq!(reloaded.current().last_updated, 1_000);
    }

    #[test]
    fn test_rejected_update_leaves_config_untouched() {
        let (store, _clock, repo) = repo();
        let before = repo.current();
        let writes = store.write_count();

        assert!(matches!(
            repo.update(MonitoredTarget::YouTube, vec![]),
            Err(GuardError::Validation(ValidationError::Empty))
        ));
        assert!(matches!(
            repo.update(MonitoredTarget::YouTube, ids(&["ab"])),
            Err(GuardError::Validation(ValidationError::InvalidEntries(_)))
        ));

        assert_eq!(repo.current(), before);
        assert_eq!(store.write_count(), writes);
    }

    #[test]
    fn test_storage_failure_keeps_last_known_good() {
        let (store, _clock, repo) = repo();
        let before = repo.current();
        store.set_fail_writes(true);
        let err = repo
            .update(MonitoredTarget::YouTube, ids(&["new_view"]))
            .unwrap_err();
        assert!(matches!(err, GuardError::Storage(_)));
        assert_eq!(repo.current(), before);
    }

    #[test]
    fn test_failed_write_leaves_stored_config_untouched() {
        let (store, clock, repo) = repo();
        repo.update(MonitoredTarget::YouTube, ids(&["first_view"])).unwrap();
        let before = repo.current();

        store.fail_writes_to(KEY_CONFIG);
        clock.advance(50);
        assert!(repo.update(MonitoredTarget::YouTube, ids(&["second_view"])).is_err());
        assert!(repo.reset_to_defaults().is_err());
        assert_eq!(repo.current(), before);

        let reloaded = IdentifierRepository::new(store, clock);
        assert_eq!(reloaded.current(), before);
    }

    #[test]
    fn test_invalid_stored_list_falls_back_to_defaults() {
        let store = Arc::new(MemoryStore::new());
        let long_id = "x".repeat(500);
        let stored = serde_json::json!({
            "ids": {
                "youtube": ["kept_view", "other_view"],
                "instagram": ["dup_view", "dup_view", long_id],
            },
            "last_updated": 77,
        });
        store.set_string(KEY_CONFIG, &stored.to_string()).unwrap();

        let repo = IdentifierRepository::new(store.clone(), Arc::new(ManualClock::new(0)));
        let config = repo.current();
        assert_eq!(config.ids.youtube, ids(&["kept_view", "other_view"]));
        assert_eq!(config.ids.instagram, bundled_defaults().instagram);
        assert_eq!(config.last_updated, 77);

        store
            .set_string(KEY_CONFIG, r#"{"ids":{"youtube":[],"instagram":["clips_tab"]},"last_updated":3}"#)
            .unwrap();
        let repo = IdentifierRepository::new(store.clone(), Arc::new(ManualClock::new(0)));
        assert_eq!(repo.identifiers(MonitoredTarget::YouTube), bundled_defaults().youtube);
        assert_eq!(repo.identifiers(MonitoredTarget::Instagram), ids(&["clips_tab"]));

        store.set_string(KEY_CONFIG, "{ not json").unwrap();
        let repo = IdentifierRepository::new(store, Arc::new(ManualClock::new(0)));
        assert_eq!(repo.current().ids, bundled_defaults());
        assert_eq!(repo.current().last_updated, 0);
    }

    #[test]
    fn test_stamps_strictly_increase() {
        let (_store, _clock, repo) = repo();
        let mut rx = repo.subscribe();
        repo.update(MonitoredTarget::YouTube, ids(&["one_view"])).unwrap();
        let first = rx.borrow_and_update().last_updated;
        repo.update(MonitoredTarget::YouTube, ids(&["two_view"])).unwrap();
        let second = rx.borrow_and_update().last_updated;
        assert!(second > first);
    }

    #[test]
    fn test_reset_to_defaults() {
        let (_store, clock, repo) = repo();
        repo.update(MonitoredTarget::YouTube, ids(&["custom_view"])).unwrap();
        clock.advance(10);
        repo.reset_to_defaults().unwrap();
        assert_eq!(repo.current().ids, bundled_defaults());
        assert_eq!(repo.current().last_updated, 1_010);
    }
}
