//! Per-target grace timers.
//!
//! Each target has at most one live timer. Arming bumps a generation counter
//! and replaces the previous timer, so a fire that was already in flight when
//! the timer was re-armed carries an old generation and is dropped by
//! [`GraceTimerManager::begin_fire`].

use crate::target::MonitoredTarget;
use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed,
    Firing,
}

struct TimerSlot {
    state: TimerState,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl Default for TimerSlot {
    fn default() -> Self {
        Self {
            state: TimerState::Idle,
            generation: 0,
            handle: None,
        }
    }
}

pub struct GraceTimerManager {
    grace_period: Duration,
    slots: DashMap<MonitoredTarget, TimerSlot>,
}

impl GraceTimerManager {
    pub fn new(grace_period: Duration) -> Self {
        let slots = DashMap::new();
        for target in MonitoredTarget::ALL {
            slots.insert(target, TimerSlot::default());
        }
        Self {
            grace_period,
            slots,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Start or restart the grace period for `target`. After it elapses
    /// `on_fire` is called with the generation this call returned.
    ///
    /// Arming while `Firing` is ignored and returns `None`: the intervention
    /// that is running already covers the surface.
    pub fn arm<F, Fut>(&self, target: MonitoredTarget, on_fire: F) -> Option<u64>
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slots.entry(target).or_default();
        if slot.state == TimerState::Firing {
            log::debug!("timer: {target} fire in progress, not re-arming");
            return None;
        }

        if let Some(previous) = slot.handle.take() {
            previous.abort();
        }
        slot.generation += 1;
        slot.state = TimerState::Armed;

        let generation = slot.generation;
        let delay = self.grace_period;
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(generation).await;
        }));
        log::debug!(
            "timer: {target} armed (generation {generation}, {}s)",
            delay.as_secs()
        );
        Some(generation)
    }

    /// Claim a fire. Succeeds only for the current generation of an armed
    /// timer, moving it to `Firing`.
    pub fn begin_fire(&self, target: MonitoredTarget, generation: u64) -> bool {
        let Some(mut slot) = self.slots.get_mut(&target) else {
            return false;
        };
        if slot.state != TimerState::Armed || slot.generation != generation {
            log::debug!(
                "timer: {target} dropping stale fire (generation {generation}, current {})",
                slot.generation
            );
            return false;
        }
        slot.state = TimerState::Firing;
        slot.handle = None;
        true
    }

    pub fn finish_fire(&self, target: MonitoredTarget) {
        if let Some(mut slot) = self.slots.get_mut(&target) {
            if slot.state == TimerState::Firing {
                slot.state = TimerState::Idle;
            }
        }
    }

    pub fn cancel(&self, target: MonitoredTarget) {
        if let Some(mut slot) = self.slots.get_mut(&target) {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
            slot.generation += 1;
            slot.state = TimerState::Idle;
        }
    }

    pub fn cancel_all(&self) {
        for target in MonitoredTarget::ALL {
            self.cancel(target);
        }
        log::debug!("timer: all timers cancelled");
    }

    pub fn state(&self, target: MonitoredTarget) -> TimerState {
        self.slots
            .get(&target)
            .map(|slot| slot.state)
            .unwrap_or(TimerState::Idle)
    }

    pub fn generation(&self, target: MonitoredTarget) -> u64 {
        self.slots.get(&target).map(|slot| slot.generation).unwrap_or(0)
    }
}

impl Drop for GraceTimerManager {
    fn drop(&mut self) {
        for mut slot in self.slots.iter_mut() {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const GRACE: Duration = Duration::from_secs(300);

    fn arm_to_channel(
        timers: &GraceTimerManager,
        target: MonitoredTarget,
        tx: &mpsc::UnboundedSender<u64>,
    ) -> Option<u64> {
        let tx = tx.clone();
        timers.arm(target, move |generation| async move {
            let _ = tx.send(generation);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_grace_period() {
        let timers = GraceTimerManager::new(GRACE);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let generation = arm_to_channel(&timers, MonitoredTarget::YouTube, &tx).unwrap();
        assert_eq!(timers.state(MonitoredTarget::YouTube), TimerState::Armed);

        tokio::time::sleep(GRACE - Duration::from_millis(1)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.recv().await, Some(generation));
        assert!(timers.begin_fire(MonitoredTarget::YouTube, generation));
        assert_eq!(timers.state(MonitoredTarget::YouTube), TimerState::Firing);
        timers.finish_fire(MonitoredTarget::YouTube);
        assert_eq!(timers.state(MonitoredTarget::YouTube), TimerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_debounces() {
        let timers = GraceTimerManager::new(GRACE);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..5 {
            arm_to_channel(&timers, MonitoredTarget::Instagram, &tx);
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(GRACE).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, timers.generation(MonitoredTarget::Instagram));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_ignored() {
        let timers = GraceTimerManager::new(GRACE);
        let first = timers.arm(MonitoredTarget::YouTube, |_| async {}).unwrap();
        let second = timers.arm(MonitoredTarget::YouTube, |_| async {}).unwrap();
        assert!(second > first);
        assert!(!timers.begin_fire(MonitoredTarget::YouTube, first));
        assert!(timers.begin_fire(MonitoredTarget::YouTube, second));
        assert!(!timers.begin_fire(MonitoredTarget::YouTube, second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_while_firing_is_ignored() {
        let timers = GraceTimerManager::new(GRACE);
        let generation = timers.arm(MonitoredTarget::YouTube, |_| async {}).unwrap();
        assert!(timers.begin_fire(MonitoredTarget::YouTube, generation));
        assert!(timers.arm(MonitoredTarget::YouTube, |_| async {}).is_none());
        timers.finish_fire(MonitoredTarget::YouTube);
        assert!(timers.arm(MonitoredTarget::YouTube, |_| async {}).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_pending_fires() {
        let timers = GraceTimerManager::new(GRACE);
        let (tx, mut rx) = mpsc::unbounded_channel();
        arm_to_channel(&timers, MonitoredTarget::YouTube, &tx);
        arm_to_channel(&timers, MonitoredTarget::Instagram, &tx);

        timers.cancel_all();
        tokio::time::sleep(GRACE * 2).await;
        assert!(rx.try_recv().is_err());
        for target in MonitoredTarget::ALL {
            assert_eq!(timers.state(target), TimerState::Idle);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_are_independent() {
        let timers = GraceTimerManager::new(GRACE);
        let yt = timers.arm(MonitoredTarget::YouTube, |_| async {}).unwrap();
        timers.arm(MonitoredTarget::Instagram, |_| async {}).unwrap();
        timers.cancel(MonitoredTarget::Instagram);
        assert_eq!(timers.state(MonitoredTarget::YouTube), TimerState::Armed);
        assert!(timers.begin_fire(MonitoredTarget::YouTube, yt));
    }
}
