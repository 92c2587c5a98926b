//! Applies an intervention once a grace period runs out.

use crate::block::BlockStateStore;
use crate::clock::Clock;
use crate::error::Result;
use crate::navigation::NavigationSafetySequence;
use crate::quotes::QuoteBook;
use crate::settings::SettingsStore;
use crate::target::MonitoredTarget;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// What one intervention did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterventionRecord {
    pub target: MonitoredTarget,
    pub blocked_until: i64,
    /// Interventions for this target today, this one included.
    pub count: u32,
    pub quote: String,
    /// `false` when a navigation sequence was already running.
    pub navigation_started: bool,
}

pub struct InterventionExecutor {
    blocks: Arc<BlockStateStore>,
    settings: Arc<SettingsStore>,
    navigation: Arc<NavigationSafetySequence>,
    clock: Arc<dyn Clock>,
    quotes: QuoteBook,
    block_duration: Duration,
}

impl InterventionExecutor {
    pub fn new(
        blocks: Arc<BlockStateStore>,
        settings: Arc<SettingsStore>,
        navigation: Arc<NavigationSafetySequence>,
        clock: Arc<dyn Clock>,
        quotes: QuoteBook,
        block_duration: Duration,
    ) -> Self {
        Self {
            blocks,
            settings,
            navigation,
            clock,
            quotes,
            block_duration,
        }
    }

    /// Block `target` for the configured duration, count it, then navigate
    /// away. A storage failure stops before navigation and is returned.
    pub fn perform_intervention(&self, target: MonitoredTarget) -> Result<InterventionRecord> {
        log::debug!("intervention: performing for {target}");
        let duration_ms = i64::try_from(self.block_duration.as_millis()).unwrap_or(i64::MAX);
        let blocked_until = self.clock.now_ms().saturating_add(duration_ms);

        self.blocks.set_blocked_until(target, blocked_until)?;
        let count = self.settings.increment_interventions(target)?;
        let navigation_started = self.navigation.trigger();

        log::info!("intervention: {target} blocked until {blocked_until} ({count} today)");
        Ok(InterventionRecord {
            target,
            blocked_until,
            count,
            quote: self.quotes.random_quote().to_string(),
            navigation_started,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DayBoundary, ManualClock};
    use crate::error::GuardError;
    use crate::navigation::{NavAction, NavigationActions, NavigationTiming, RecordingNavigation};
    use crate::store::MemoryStore;

    const NOW: i64 = 1_710_072_000_000;
    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        store: Arc<MemoryStore>,
        blocks: Arc<BlockStateStore>,
        settings: Arc<SettingsStore>,
        actions: Arc<RecordingNavigation>,
        navigation: Arc<NavigationSafetySequence>,
        executor: InterventionExecutor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
        let blocks = Arc::new(BlockStateStore::new(store.clone(), clock.clone()));
        let settings = Arc::new(SettingsStore::new(
            store.clone(),
            clock.clone(),
            DayBoundary::FixedOffset { minutes: 0 },
        ));
        let actions = Arc::new(RecordingNavigation::new());
        let navigation = Arc::new(NavigationSafetySequence::new(
            Arc::clone(&actions) as Arc<dyn NavigationActions>,
            NavigationTiming::default(),
        ));
        let executor = InterventionExecutor::new(
            blocks.clone(),
            settings.clone(),
            navigation.clone(),
            clock,
            QuoteBook::from_quotes(vec!["Go outside.".to_string()]),
            HOUR,
        );
        Fixture {
            store,
            blocks,
            settings,
            actions,
            navigation,
            executor,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_intervention_blocks_counts_and_navigates() {
        let f = fixture();
        let record = f.executor.perform_intervention(MonitoredTarget::YouTube).unwrap();

        assert_eq!(record.blocked_until, NOW + 3_600_000);
        assert_eq!(record.count, 1);
        assert_eq!(record.quote, "Go outside.");
        assert!(record.navigation_started);
        assert!(f.blocks.is_blocked(MonitoredTarget::YouTube));
        assert!(!f.blocks.is_blocked(MonitoredTarget::Instagram));

        f.navigation.wait_idle().await;
        assert_eq!(f.actions.count(NavAction::Back), 3);
        assert_eq!(f.actions.count(NavAction::RequestHome), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_intervention_same_day() {
        let f = fixture();
        f.executor.perform_intervention(MonitoredTarget::Instagram).unwrap();
        f.navigation.wait_idle().await;
        let second = f.executor.perform_intervention(MonitoredTarget::Instagram).unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(
            f.settings.observed_interventions(MonitoredTarget::Instagram),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_skips_navigation() {
        let f = fixture();
        f.store.set_fail_writes(true);

        let err = f
            .executor
            .perform_intervention(MonitoredTarget::YouTube)
            .unwrap_err();
        assert!(matches!(err, GuardError::Storage(_)));
        assert!(!f.navigation.is_running());
        assert!(f.actions.calls().is_empty());
        assert_eq!(f.blocks.observed(MonitoredTarget::YouTube), 0);
        assert_eq!(f.settings.observed_interventions(MonitoredTarget::YouTube), 0);
    }
}
