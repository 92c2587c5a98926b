//! Persisted key-value storage.
//!
//! Everything the engine keeps across restarts (block windows, identifier
//! lists, enabled flags, daily counters) is a single-key write into a
//! [`KeyValueStore`]. There are no cross-key transactions; callers funnel all
//! writes for one key through a single logical writer instead.

use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be constructed. Not retried.
    #[error("store: unable to create secure storage - {0}")]
    Init(String),

    #[error("store: read failed for '{key}' - {reason}")]
    Read { key: String, reason: String },

    #[error("store: write failed for '{key}' - {reason}")]
    Write { key: String, reason: String },

    #[error("store: value for '{key}' is corrupt - {reason}")]
    Corrupt { key: String, reason: String },
}

/// String-valued key-value storage with typed accessors on top.
pub trait KeyValueStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Must be durable when it returns `Ok`.
    fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn get_i64(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        match self.get_raw(key)? {
            Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn set_i64(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.set_raw(key, &value.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, StoreError> {
        match self.get_raw(key)?.as_deref() {
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("expected bool, found '{other}'"),
            }),
            None => Ok(default),
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set_raw(key, if value { "true" } else { "false" })
    }

    fn get_string(&self, key: &str, default: &str) -> Result<String, StoreError> {
        Ok(self.get_raw(key)?.unwrap_or_else(|| default.to_string()))
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_raw(key, value)
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// Store backed by a single-table SQLite database in WAL mode.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let init = |e: rusqlite::Error| StoreError::Init(e.to_string());
        let conn = Connection::open(path).map_err(init)?;

        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(init)?;
        conn.execute_batch(
            "PRAGMA busy_timeout=5000;
             PRAGMA synchronous=FULL;
             CREATE TABLE IF NOT EXISTS kv (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
             );",
        )
        .map_err(init)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Init(e.to_string()))?;
        conn.execute_batch("CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT NOT NULL);")
            .map_err(|e| StoreError::Init(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| StoreError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map(|_| ())
        .map_err(|e| StoreError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map(|_| ())
            .map_err(|e| StoreError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// OS keyring
// ============================================================================

/// Store that keeps each key as its own entry in the OS credential store.
pub struct KeyringStore {
    service: String,
}

const PROBE_ACCOUNT: &str = "reelguard_probe";

impl KeyringStore {
    /// Fails with [`StoreError::Init`] when the platform credential store is
    /// unavailable.
    pub fn new(service: impl Into<String>) -> Result<Self, StoreError> {
        let service = service.into();
        let probe = Entry::new(&service, PROBE_ACCOUNT)
            .map_err(|e| StoreError::Init(format!("failed to access keyring: {e}")))?;
        match probe.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(Self { service }),
            Err(e) => Err(StoreError::Init(format!("keyring unavailable: {e}"))),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, key).map_err(|e| StoreError::Read {
            key: key.to_string(),
            reason: format!("failed to access keyring: {e}"),
        })
    }
}

impl KeyValueStore for KeyringStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(encoded) => {
                let bytes = general_purpose::STANDARD
                    .decode(&encoded)
                    .map_err(|e| StoreError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|e| StoreError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Read {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let encoded = general_purpose::STANDARD.encode(value.as_bytes());
        self.entry(key)?
            .set_password(&encoded)
            .map_err(|e| StoreError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Volatile store for tests and dry runs. Writes can be made to fail on
/// demand to exercise transient I/O paths.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    failing_keys: Mutex<HashSet<String>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail writes and removals for `key` only.
    pub fn fail_writes_to(&self, key: &str) {
        self.failing_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    /// Number of successful writes and removals.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self, key: &str) -> Result<(), StoreError> {
        let key_fails = self
            .failing_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key);
        if key_fails || self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_writable(key)?;
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check_writable(key)?;
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get_i64("missing", 7).unwrap(), 7);
        assert!(store.get_bool("flag", true).unwrap());
        assert_eq!(store.get_string("name", "dflt").unwrap(), "dflt");

        store.set_i64("ts", 1_700_000_000_123).unwrap();
        store.set_bool("flag", false).unwrap();
        store.set_string("name", "value with spaces").unwrap();

        assert_eq!(store.get_i64("ts", 0).unwrap(), 1_700_000_000_123);
        assert!(!store.get_bool("flag", true).unwrap());
        assert_eq!(store.get_string("name", "").unwrap(), "value with spaces");

        store.set_i64("ts", 5).unwrap();
        assert_eq!(store.get_i64("ts", 0).unwrap(), 5);

        store.remove("ts").unwrap();
        assert_eq!(store.get_i64("ts", -1).unwrap(), -1);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_memory_store_fails_single_key() {
        let store = MemoryStore::new();
        store.fail_writes_to("broken");
        assert!(matches!(
            store.set_i64("broken", 1),
            Err(StoreError::Write { ref key, .. }) if key == "broken"
        ));
        store.set_i64("fine", 2).unwrap();
        assert_eq!(store.get_i64("fine", 0).unwrap(), 2);
        assert_eq!(store.get_i64("broken", 0).unwrap(), 0);
    }

    #[test]
    fn test_sqlite_store_in_memory() {
        exercise(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite3");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.set_i64("youtube_blocked_until", 99).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_i64("youtube_blocked_until", 0).unwrap(), 99);
    }

    #[test]
    fn test_corrupt_values_are_reported() {
        let store = MemoryStore::new();
        store.set_raw("n", "not a number").unwrap();
        store.set_raw("b", "maybe").unwrap();
        assert!(matches!(store.get_i64("n", 0), Err(StoreError::Corrupt { .. })));
        assert!(matches!(store.get_bool("b", false), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_injected_write_failure() {
        let store = MemoryStore::new();
        store.set_i64("k", 1).unwrap();
        store.set_fail_writes(true);
        assert!(matches!(store.set_i64("k", 2), Err(StoreError::Write { .. })));
        assert_eq!(store.get_i64("k", 0).unwrap(), 1);
        assert_eq!(store.write_count(), 1);
    }
}
