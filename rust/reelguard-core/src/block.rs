//! Persisted block windows.
//!
//! One `blocked_until` timestamp per target, epoch milliseconds, 0 meaning
//! unblocked. Expiry is lazy: a stored value at or before now is cleared and
//! the clear persisted the next time it is read.

use crate::clock::Clock;
use crate::error::Result;
use crate::store::KeyValueStore;
use crate::target::{MonitoredTarget, PerTarget};
use std::sync::Arc;
use tokio::sync::watch;

fn blocked_until_key(target: MonitoredTarget) -> String {
    format!("{}_blocked_until", target.key())
}

pub struct BlockStateStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    observed: PerTarget<watch::Sender<i64>>,
}

impl BlockStateStore {
    /// Loads both records; a value that cannot be read starts at 0.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let observed = PerTarget::from_fn(|target| {
            let initial = store
                .get_i64(&blocked_until_key(target), 0)
                .unwrap_or_else(|e| {
                    log::error!("block: failed to load {target} block state: {e}");
                    0
                });
            watch::channel(initial).0
        });
        Self {
            store,
            clock,
            observed,
        }
    }

    /// Observe one target's `blocked_until`.
    pub fn subscribe(&self, target: MonitoredTarget) -> watch::Receiver<i64> {
        self.observed.get(target).subscribe()
    }

    /// Last published value, without the expiry check.
    pub fn observed(&self, target: MonitoredTarget) -> i64 {
        *self.observed.get(target).borrow()
    }

    pub fn set_blocked_until(&self, target: MonitoredTarget, until_ms: i64) -> Result<()> {
        self.store.set_i64(&blocked_until_key(target), until_ms)?;
        self.observed.get(target).send_replace(until_ms);
        log::info!("block: {target} blocked until {until_ms}");
        Ok(())
    }

    /// Current `blocked_until`, clearing it first if it has expired.
    pub fn get_blocked_until(&self, target: MonitoredTarget) -> Result<i64> {
        let until = self.store.get_i64(&blocked_until_key(target), 0)?;
        if until > 0 && until <= self.clock.now_ms() {
            log::debug!("block: {target} block expired at {until}, clearing");
            self.clear(target)?;
            return Ok(0);
        }
        self.observed.get(target).send_if_modified(|current| {
            let changed = *current != until;
            *current = until;
            changed
        });
        Ok(until)
    }

    /// Whether `target` is blocked right now. Read failures count as not
    /// blocked so a broken store never locks the user out.
    pub fn is_blocked(&self, target: MonitoredTarget) -> bool {
        match self.get_blocked_until(target) {
            Ok(until) => until > self.clock.now_ms(),
            Err(e) => {
                log::warn!("block: could not read {target} block state: {e}");
                false
            }
        }
    }

    pub fn clear(&self, target: MonitoredTarget) -> Result<()> {
        self.store.set_i64(&blocked_until_key(target), 0)?;
        self.observed.get(target).send_replace(0);
        Ok(())
    }
}
