//! Drive the engine from a recorded session.
//!
//! A recording is JSON lines, one step per line, ordered by `at_ms` (offset
//! from the start of the replay):
//!
//! ```text
//! {"kind":"window","at_ms":0,"root":{"children":[{"view_id":"com.google.android.youtube:id/reel_player_page"}]}}
//! {"kind":"event","at_ms":10,"event_type":"window_state_changed","package":"com.google.android.youtube"}
//! ```
//!
//! `window` replaces the foreground tree (omit `root` for no window) and
//! `event` feeds one UI event. Blank lines and lines starting with `#` are
//! skipped.

use anyhow::{bail, Context, Result};
use reelguard_core::{
    Clock, Engine, EngineDeps, GuardConfig, GuardEvent, GuardStatus, KeyValueStore, NavAction,
    NavigationActions, NavigationError, SnapshotNode, SnapshotProvider, SystemClock, UiEvent,
    UiEventType,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayStep {
    Window {
        at_ms: u64,
        #[serde(default)]
        root: Option<SnapshotNode>,
    },
    Event {
        at_ms: u64,
        event_type: UiEventType,
        package: String,
    },
}

impl ReplayStep {
    pub fn at_ms(&self) -> u64 {
        match self {
            ReplayStep::Window { at_ms, .. } | ReplayStep::Event { at_ms, .. } => *at_ms,
        }
    }
}

pub fn parse_script(raw: &str) -> Result<Vec<ReplayStep>> {
    let mut steps = Vec::new();
    let mut last_at = 0;
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step: ReplayStep = serde_json::from_str(line)
            .with_context(|| format!("line {}: invalid replay step", index + 1))?;
        if step.at_ms() < last_at {
            bail!(
                "line {}: at_ms {} goes back in time (previous {})",
                index + 1,
                step.at_ms(),
                last_at
            );
        }
        last_at = step.at_ms();
        steps.push(step);
    }
    Ok(steps)
}

// =============================================================================
// Replay collaborators
// =============================================================================

/// Logs each navigation action instead of performing it.
#[derive(Default)]
pub struct LoggingNavigation {
    actions: Mutex<Vec<NavAction>>,
}

impl LoggingNavigation {
    pub fn actions(&self) -> Vec<NavAction> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn perform(&self, action: NavAction) -> Result<(), NavigationError> {
        log::info!("navigation: {action}");
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
        Ok(())
    }
}

impl NavigationActions for LoggingNavigation {
    fn back(&self) -> Result<(), NavigationError> {
        self.perform(NavAction::Back)
    }

    fn request_home(&self) -> Result<(), NavigationError> {
        self.perform(NavAction::RequestHome)
    }

    fn global_home(&self) -> Result<(), NavigationError> {
        self.perform(NavAction::GlobalHome)
    }
}

/// Wall clock that advances with tokio time, so a paused runtime moves it
/// too.
pub struct TokioClock {
    base_ms: i64,
    origin: Instant,
}

impl TokioClock {
    pub fn starting_at(base_ms: i64) -> Self {
        Self {
            base_ms,
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.base_ms.saturating_add(elapsed)
    }
}

// =============================================================================
// Replay
// =============================================================================

/// Keep running for one grace period plus five seconds after the last step.
pub fn default_tail_ms(grace_period_ms: u64) -> u64 {
    grace_period_ms.saturating_add(5_000)
}

/// About thirty years out, for offsets too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(base: Instant, offset: Duration) -> Instant {
    base.checked_add(offset).unwrap_or_else(|| base + FAR_FUTURE)
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub events: Vec<GuardEvent>,
    pub navigation: Vec<String>,
    pub status: GuardStatus,
}

/// Play `steps` against a fresh engine over `store`, then keep running for
/// `tail` so pending grace timers can fire.
pub async fn run_replay(
    steps: Vec<ReplayStep>,
    store: Arc<dyn KeyValueStore>,
    config: GuardConfig,
    tail: Duration,
) -> Result<ReplayReport> {
    let tree = Arc::new(SnapshotProvider::new(None));
    let navigation = Arc::new(LoggingNavigation::default());
    let clock = Arc::new(TokioClock::starting_at(SystemClock.now_ms()));
    let depth = config.event_queue_depth;

    let engine = Engine::new(
        config,
        EngineDeps {
            store,
            tree: tree.clone(),
            navigation: navigation.clone(),
            clock,
        },
    )?;
    let mut events_rx = engine.subscribe();
    let (tx, rx) = mpsc::channel(depth);
    let origin = Instant::now();
    engine.start(rx).await?;

    let mut events = Vec::new();
    for step in steps {
        let deadline = deadline_after(origin, Duration::from_millis(step.at_ms()));
        collect_until(deadline, &mut events_rx, &mut events).await;
        match step {
            ReplayStep::Window { root, .. } => tree.set_root(root),
            ReplayStep::Event {
                event_type,
                package,
                ..
            } => tx
                .send(UiEvent::new(event_type, package))
                .await
                .context("engine stopped accepting events")?,
        }
    }
    collect_until(deadline_after(Instant::now(), tail), &mut events_rx, &mut events).await;

    engine.stop().await?;
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }

    Ok(ReplayReport {
        events,
        navigation: navigation
            .actions()
            .into_iter()
            .map(|a| a.to_string())
            .collect(),
        status: engine.status(),
    })
}

async fn collect_until(
    deadline: Instant,
    rx: &mut broadcast::Receiver<GuardEvent>,
    out: &mut Vec<GuardEvent>,
) {
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return,
            received = rx.recv() => match received {
                Ok(event) => out.push(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("replay: missed {n} engine events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    sleep.as_mut().await;
                    return;
                }
            },
        }
    }
}
