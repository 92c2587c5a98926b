//! Per-target enabled flags and daily intervention counters.

use crate::clock::{Clock, DayBoundary};
use crate::error::Result;
use crate::store::KeyValueStore;
use crate::target::{MonitoredTarget, PerTarget};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

fn enabled_key(target: MonitoredTarget) -> String {
    format!("{}_enabled", target.key())
}

fn count_key(target: MonitoredTarget) -> String {
    format!("{}_interventions", target.key())
}

fn date_key(target: MonitoredTarget) -> String {
    format!("{}_intervention_date", target.key())
}

pub struct SettingsStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    day_boundary: DayBoundary,
    enabled: PerTarget<watch::Sender<bool>>,
    interventions: PerTarget<watch::Sender<u32>>,
    counter_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        day_boundary: DayBoundary,
    ) -> Self {
        let enabled = PerTarget::from_fn(|target| {
            let initial = store.get_bool(&enabled_key(target), true).unwrap_or_else(|e| {
                log::error!("settings: failed to load {target} enabled flag: {e}");
                true
            });
            watch::channel(initial).0
        });
        let today = day_boundary.date_key(clock.now_ms());
        let interventions = PerTarget::from_fn(|target| {
            let initial = read_count(store.as_ref(), target, &today).unwrap_or_else(|e| {
                log::error!("settings: failed to load {target} intervention count: {e}");
                0
            });
            watch::channel(initial).0
        });

        Self {
            store,
            clock,
            day_boundary,
            enabled,
            interventions,
            counter_lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self, target: MonitoredTarget) -> bool {
        *self.enabled.get(target).borrow()
    }

    pub fn subscribe_enabled(&self, target: MonitoredTarget) -> watch::Receiver<bool> {
        self.enabled.get(target).subscribe()
    }

    pub fn set_enabled(&self, target: MonitoredTarget, enabled: bool) -> Result<()> {
        self.store.set_bool(&enabled_key(target), enabled)?;
        self.enabled.get(target).send_replace(enabled);
        log::info!(
            "settings: {target} guard {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Today's count. A count stored under an earlier date reads as 0.
    pub fn interventions_today(&self, target: MonitoredTarget) -> Result<u32> {
        let today = self.today();
        let count = read_count(self.store.as_ref(), target, &today)?;
        self.interventions.get(target).send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
        Ok(count)
    }

    pub fn subscribe_interventions(&self, target: MonitoredTarget) -> watch::Receiver<u32> {
        self.interventions.get(target).subscribe()
    }

    /// Last published count, without re-reading the date.
    pub fn observed_interventions(&self, target: MonitoredTarget) -> u32 {
        *self.interventions.get(target).borrow()
    }

    /// Add one to today's count, starting from 0 when the stored date is not
    /// today. Returns the new count.
    pub fn increment_interventions(&self, target: MonitoredTarget) -> Result<u32> {
        let _guard = self
            .counter_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let today = self.today();
        let next = read_count(self.store.as_ref(), target, &today)? + 1;

        // Count before date: a failure in between leaves a stale date, which
        // reads as 0 rather than reviving an older day's count.
        self.store.set_i64(&count_key(target), i64::from(next))?;
        self.store.set_string(&date_key(target), &today)?;
        self.interventions.get(target).send_replace(next);
        log::debug!("settings: {target} interventions today: {next}");
        Ok(next)
    }

    fn today(&self) -> String {
        self.day_boundary.date_key(self.clock.now_ms())
    }
}

fn read_count(store: &dyn KeyValueStore, target: MonitoredTarget, today: &str) -> Result<u32> {
    let stored_date = store.get_string(&date_key(target), "")?;
    if stored_date != today {
        return Ok(0);
    }
    let count = store.get_i64(&count_key(target), 0)?;
    Ok(u32::try_from(count).unwrap_or(0))
}
