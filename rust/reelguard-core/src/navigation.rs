//! Navigation safety sequence.
//!
//! Pulls the user off a blocked surface: a bounded run of back actions with
//! a pause after each, a settle delay, then a trip to the home screen. Only
//! one sequence runs at a time; a request that arrives while one is in
//! flight is coalesced into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// Hard upper bound on back actions per sequence.
pub const MAX_BACK_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    #[error("navigation: {action} rejected - {reason}")]
    Rejected { action: NavAction, reason: String },
}

/// Platform navigation primitives.
pub trait NavigationActions: Send + Sync {
    fn back(&self) -> Result<(), NavigationError>;

    /// Ask the launcher to come to the foreground.
    fn request_home(&self) -> Result<(), NavigationError>;

    /// System-wide home action, used when the explicit request fails.
    fn global_home(&self) -> Result<(), NavigationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavAction {
    Back,
    RequestHome,
    GlobalHome,
}

impl std::fmt::Display for NavAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NavAction::Back => write!(f, "back"),
            NavAction::RequestHome => write!(f, "home request"),
            NavAction::GlobalHome => write!(f, "global home"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationTiming {
    pub back_delay: Duration,
    pub max_back_attempts: u32,
    pub home_settle_delay: Duration,
}

impl Default for NavigationTiming {
    fn default() -> Self {
        Self {
            back_delay: Duration::from_millis(300),
            max_back_attempts: MAX_BACK_ATTEMPTS,
            home_settle_delay: Duration::from_millis(500),
        }
    }
}

/// How the sequence reached (or failed to reach) the home screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeRoute {
    Requested,
    GlobalFallback,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    Completed(HomeRoute),
    /// Another sequence was already running.
    Coalesced,
    /// Stopped by [`NavigationSafetySequence::cancel`] before finishing.
    Cancelled,
}

// ============================================================================
// In-progress flag
// ============================================================================

#[derive(Default)]
struct SequenceFlag {
    running: AtomicBool,
    idle: Notify,
}

/// Holds the in-progress flag. Dropping it clears the flag however the
/// sequence ended: completion, panic, cancellation or an aborted task.
struct FlagGuard(Arc<SequenceFlag>);

impl FlagGuard {
    fn acquire(flag: &Arc<SequenceFlag>) -> Option<Self> {
        flag.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

// ============================================================================
// Sequence
// ============================================================================

pub struct NavigationSafetySequence {
    actions: Arc<dyn NavigationActions>,
    timing: NavigationTiming,
    flag: Arc<SequenceFlag>,
    cancel_tx: watch::Sender<u64>,
}

impl NavigationSafetySequence {
    pub fn new(actions: Arc<dyn NavigationActions>, timing: NavigationTiming) -> Self {
        let timing = NavigationTiming {
            max_back_attempts: timing.max_back_attempts.clamp(1, MAX_BACK_ATTEMPTS),
            ..timing
        };
        Self {
            actions,
            timing,
            flag: Arc::default(),
            cancel_tx: watch::channel(0).0,
        }
    }

    pub fn timing(&self) -> NavigationTiming {
        self.timing
    }

    pub fn is_running(&self) -> bool {
        self.flag.running.load(Ordering::Acquire)
    }

    /// Run the sequence on the current task.
    pub async fn run(&self) -> NavigationOutcome {
        let Some(guard) = FlagGuard::acquire(&self.flag) else {
            log::debug!("navigation: sequence already running, coalescing");
            return NavigationOutcome::Coalesced;
        };
        let cancel_rx = self.cancel_tx.subscribe();
        self.execute(guard, cancel_rx).await
    }

    /// Start the sequence on a new task. Returns `false` when one was already
    /// running and this request was coalesced into it.
    pub fn trigger(self: &Arc<Self>) -> bool {
        let Some(guard) = FlagGuard::acquire(&self.flag) else {
            log::debug!("navigation: sequence already running, coalescing");
            return false;
        };
        let cancel_rx = self.cancel_tx.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(guard, cancel_rx).await;
        });
        true
    }

    /// Stop any running sequence at its next delay.
    pub fn cancel(&self) {
        self.cancel_tx.send_modify(|epoch| *epoch += 1);
    }

    /// Resolves once no sequence is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.flag.idle.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    async fn execute(
        &self,
        _guard: FlagGuard,
        mut cancel_rx: watch::Receiver<u64>,
    ) -> NavigationOutcome {
        let started = Instant::now();

        for attempt in 1..=self.timing.max_back_attempts {
            if let Err(e) = self.actions.back() {
                log::warn!("navigation: back attempt {attempt} failed: {e}");
            }
            if !pause(self.timing.back_delay, &mut cancel_rx).await {
                log::info!("navigation: cancelled after {attempt} back actions");
                return NavigationOutcome::Cancelled;
            }
        }

        if !pause(self.timing.home_settle_delay, &mut cancel_rx).await {
            log::info!("navigation: cancelled before going home");
            return NavigationOutcome::Cancelled;
        }

        let route = match self.actions.request_home() {
            Ok(()) => HomeRoute::Requested,
            Err(e) => {
                log::warn!("navigation: {e}, falling back to global home");
                match self.actions.global_home() {
                    Ok(()) => HomeRoute::GlobalFallback,
                    Err(e) => {
                        log::error!("navigation: could not reach home screen: {e}");
                        HomeRoute::Failed
                    }
                }
            }
        };
        log::debug!(
            "navigation: sequence finished in {}ms ({route:?})",
            started.elapsed().as_millis()
        );
        NavigationOutcome::Completed(route)
    }
}

/// Sleep for `delay`. Returns `false` if cancelled first.
async fn pause(delay: Duration, cancel_rx: &mut watch::Receiver<u64>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel_rx.changed() => false,
    }
}

// ============================================================================
// Recording backend
// ============================================================================

/// Records every action with its (tokio) timestamp. Individual actions can
/// be made to fail.
#[derive(Default)]
pub struct RecordingNavigation {
    calls: Mutex<Vec<(NavAction, Instant)>>,
    failing: Mutex<Vec<NavAction>>,
}

impl RecordingNavigation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, action: NavAction) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
    }

    pub fn calls(&self) -> Vec<(NavAction, Instant)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn actions(&self) -> Vec<NavAction> {
        self.calls().into_iter().map(|(action, _)| action).collect()
    }

    pub fn count(&self, action: NavAction) -> usize {
        self.actions().into_iter().filter(|a| *a == action).count()
    }

    fn record(&self, action: NavAction) -> Result<(), NavigationError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((action, Instant::now()));
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&action);
        if failing {
            return Err(NavigationError::Rejected {
                action,
                reason: "configured to fail".to_string(),
            });
        }
        Ok(())
    }
}

impl NavigationActions for RecordingNavigation {
    fn back(&self) -> Result<(), NavigationError> {
        self.record(NavAction::Back)
    }

    fn request_home(&self) -> Result<(), NavigationError> {
        self.record(NavAction::RequestHome)
    }

    fn global_home(&self) -> Result<(), NavigationError> {
        self.record(NavAction::GlobalHome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(actions: &Arc<RecordingNavigation>) -> Arc<NavigationSafetySequence> {
        Arc::new(NavigationSafetySequence::new(
            Arc::clone(actions) as Arc<dyn NavigationActions>,
            NavigationTiming::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sequence_timing() {
        let actions = Arc::new(RecordingNavigation::new());
        let nav = sequence(&actions);
        let start = Instant::now();

        let outcome = nav.run().await;
        assert_eq!(outcome, NavigationOutcome::Completed(HomeRoute::Requested));
        assert!(!nav.is_running());

        let calls = actions.calls();
        let kinds: Vec<_> = calls.iter().map(|(a, _)| *a).collect();
        assert_eq!(
            kinds,
            vec![NavAction::Back, NavAction::Back, NavAction::Back, NavAction::RequestHome]
        );
        let offsets: Vec<u128> = calls
            .iter()
            .map(|(_, at)| at.duration_since(start).as_millis())
            .collect();
        assert_eq!(offsets, vec![0, 300, 600, 1400]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_global_home() {
        let actions = Arc::new(RecordingNavigation::new());
        actions.fail(NavAction::RequestHome);
        let nav = sequence(&actions);

        assert_eq!(
            nav.run().await,
            NavigationOutcome::Completed(HomeRoute::GlobalFallback)
        );
        assert_eq!(actions.count(NavAction::GlobalHome), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_still_clears_flag() {
        let actions = Arc::new(RecordingNavigation::new());
        actions.fail(NavAction::Back);
        actions.fail(NavAction::RequestHome);
        actions.fail(NavAction::GlobalHome);
        let nav = sequence(&actions);

        assert_eq!(nav.run().await, NavigationOutcome::Completed(HomeRoute::Failed));
        assert_eq!(actions.count(NavAction::Back), 3);
        assert!(!nav.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_coalesce() {
        let actions = Arc::new(RecordingNavigation::new());
        let nav = sequence(&actions);

        assert!(nav.trigger());
        assert!(!nav.trigger());
        assert_eq!(nav.run().await, NavigationOutcome::Coalesced);

        nav.wait_idle().await;
        assert_eq!(actions.count(NavAction::Back), 3);
        assert_eq!(actions.count(NavAction::RequestHome), 1);

        // A later request starts a fresh sequence.
        assert!(nav.trigger());
        nav.wait_idle().await;
        assert_eq!(actions.count(NavAction::Back), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_delays() {
        let actions = Arc::new(RecordingNavigation::new());
        let nav = sequence(&actions);

        assert!(nav.trigger());
        tokio::time::sleep(Duration::from_millis(350)).await;
        nav.cancel();
        nav.wait_idle().await;

        assert!(!nav.is_running());
        assert_eq!(actions.actions(), vec![NavAction::Back, NavAction::Back]);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(actions.count(NavAction::RequestHome), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let actions = Arc::new(RecordingNavigation::new());
        let nav = NavigationSafetySequence::new(
            Arc::clone(&actions) as Arc<dyn NavigationActions>,
            NavigationTiming {
                max_back_attempts: 10,
                ..NavigationTiming::default()
            },
        );
        nav.run().await;
        assert_eq!(actions.count(NavAction::Back), MAX_BACK_ATTEMPTS as usize);
    }
}
