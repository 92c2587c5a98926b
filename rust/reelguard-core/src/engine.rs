//! The guard engine.
//!
//! Owns every component and runs the event pipeline:
//!
//! ```text
//! events ─► dispatcher ─► worker(YouTube)   ─► detector ─► grace timer ─┐
//!                    └──► worker(Instagram) ─► ...                      │
//!                                    ▲                                  │
//!                                    └──────── TimerFired(generation) ◄─┘
//! ```
//!
//! Each target has one worker task. Grace-timer fires are posted back into
//! the same worker's queue, so detection and interventions for one target
//! never run concurrently while the two targets stay independent.

use crate::block::BlockStateStore;
use crate::cache::IdentifierCache;
use crate::classifier::{classify, UiEvent};
use crate::clock::{Clock, SystemClock};
use crate::config::{GuardConfig, ReelguardConfig};
use crate::detector::detect;
use crate::error::{GuardError, Result};
use crate::identifiers::{IdentifierConfig, IdentifierRepository};
use crate::intervention::{InterventionExecutor, InterventionRecord};
use crate::navigation::{NavigationActions, NavigationSafetySequence};
use crate::quotes::QuoteBook;
use crate::settings::SettingsStore;
use crate::store::KeyValueStore;
use crate::target::{MonitoredTarget, PerTarget};
use crate::timer::{GraceTimerManager, TimerState};
use crate::tree::WindowTreeProvider;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 100;

// ============================================================================
// Events and status
// ============================================================================

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardEvent {
    /// The surface was detected and the grace period (re)started.
    GraceArmed {
        target: MonitoredTarget,
        generation: u64,
    },
    InterventionPerformed {
        target: MonitoredTarget,
        blocked_until: i64,
        count: u32,
        quote: String,
    },
    InterventionFailed {
        target: MonitoredTarget,
        reason: String,
    },
    /// An event arrived for a blocked target and the user was sent away.
    BlockEnforced {
        target: MonitoredTarget,
        blocked_until: i64,
    },
    /// A block persisted before the last shutdown is still active.
    StartupBlockRestored {
        target: MonitoredTarget,
        blocked_until: i64,
    },
}

impl From<InterventionRecord> for GuardEvent {
    fn from(record: InterventionRecord) -> Self {
        GuardEvent::InterventionPerformed {
            target: record.target,
            blocked_until: record.blocked_until,
            count: record.count,
            quote: record.quote,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    pub enabled: bool,
    /// 0 when not blocked.
    pub blocked_until: i64,
    pub interventions_today: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardStatus {
    pub running: bool,
    pub identifiers_version: i64,
    pub targets: PerTarget<TargetStatus>,
}

// ============================================================================
// Engine
// ============================================================================

/// Platform collaborators handed to the engine.
pub struct EngineDeps {
    pub store: Arc<dyn KeyValueStore>,
    pub tree: Arc<dyn WindowTreeProvider>,
    pub navigation: Arc<dyn NavigationActions>,
    pub clock: Arc<dyn Clock>,
}

enum WorkerMessage {
    Event(UiEvent),
    TimerFired(u64),
}

/// Shared state a worker task needs.
#[derive(Clone)]
struct Pipeline {
    tree: Arc<dyn WindowTreeProvider>,
    cache: Arc<IdentifierCache>,
    blocks: Arc<BlockStateStore>,
    settings: Arc<SettingsStore>,
    timers: Arc<GraceTimerManager>,
    navigation: Arc<NavigationSafetySequence>,
    executor: Arc<InterventionExecutor>,
    events_tx: broadcast::Sender<GuardEvent>,
}

pub struct Engine {
    config: GuardConfig,
    pipeline: Pipeline,
    identifiers: Arc<IdentifierRepository>,
    running: Arc<RwLock<bool>>,
    liveness_tx: Arc<watch::Sender<bool>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: GuardConfig, deps: EngineDeps) -> Result<Self> {
        config
            .validate()
            .map_err(|e| GuardError::InvalidConfig(e.to_string()))?;

        let EngineDeps {
            store,
            tree,
            navigation,
            clock,
        } = deps;

        let identifiers = Arc::new(IdentifierRepository::new(store.clone(), clock.clone()));
        let blocks = Arc::new(BlockStateStore::new(store.clone(), clock.clone()));
        let settings = Arc::new(SettingsStore::new(
            store,
            clock.clone(),
            config.day_boundary,
        ));
        let navigation = Arc::new(NavigationSafetySequence::new(
            navigation,
            config.navigation_timing(),
        ));
        let executor = Arc::new(InterventionExecutor::new(
            blocks.clone(),
            settings.clone(),
            navigation.clone(),
            clock,
            QuoteBook::bundled(),
            Duration::from_millis(config.block_duration_ms),
        ));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            pipeline: Pipeline {
                tree,
                cache: Arc::new(IdentifierCache::new()),
                blocks,
                settings,
                timers: Arc::new(GraceTimerManager::new(config.grace_period())),
                navigation,
                executor,
                events_tx,
            },
            config,
            identifiers,
            running: Arc::new(RwLock::new(false)),
            liveness_tx: Arc::new(watch::channel(false).0),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Build an engine over the store named by `config`, on the system clock.
    pub fn from_config(
        config: &ReelguardConfig,
        tree: Arc<dyn WindowTreeProvider>,
        navigation: Arc<dyn NavigationActions>,
    ) -> Result<Self> {
        let store = config.open_store()?;
        Self::new(
            config.guard.clone(),
            EngineDeps {
                store,
                tree,
                navigation,
                clock: Arc::new(SystemClock),
            },
        )
    }

    /// Start consuming `events`. Blocks that outlived the previous run are
    /// enforced immediately.
    pub async fn start(&self, mut events: mpsc::Receiver<UiEvent>) -> Result<()> {
        {
            let mut running = self.running.write().unwrap_or_else(PoisonError::into_inner);
            if *running {
                return Err(GuardError::AlreadyRunning);
            }
            *running = true;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);

        let mut tasks = Vec::new();

        // Identifier cache
        let cache = Arc::clone(&self.pipeline.cache);
        let identifiers_rx = self.identifiers.subscribe();
        cache.apply(&identifiers_rx.borrow());
        tasks.push(tokio::spawn(cache.follow(identifiers_rx)));

        // Per-target workers
        let depth = self.config.event_queue_depth;
        let mut senders = PerTarget::from_fn(|_| None);
        for target in MonitoredTarget::ALL {
            let (tx, rx) = mpsc::channel::<WorkerMessage>(depth);
            let worker = Worker {
                target,
                pipeline: self.pipeline.clone(),
                self_tx: tx.downgrade(),
            };
            tasks.push(tokio::spawn(worker.run(rx)));
            *senders.get_mut(target) = Some(tx);
        }

        self.restore_active_blocks();
        self.liveness_tx.send_replace(true);

        // Dispatcher
        let liveness_tx = Arc::clone(&self.liveness_tx);
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,

                    event = events.recv() => {
                        let Some(event) = event else {
                            log::info!("engine: event stream closed");
                            break;
                        };
                        let Some(target) = classify(&event) else {
                            continue;
                        };
                        let Some(tx) = senders.get(target) else {
                            continue;
                        };
                        if let Err(e) = tx.try_send(WorkerMessage::Event(event)) {
                            log::warn!("engine: {target} queue unavailable, dropping event: {e}");
                        }
                    }
                }
            }
            liveness_tx.send_replace(false);
        }));

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        log::info!("engine: started");
        Ok(())
    }

    /// Stop all tasks, timers and any running navigation sequence.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut running = self.running.write().unwrap_or_else(PoisonError::into_inner);
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(()).await;
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        self.pipeline.timers.cancel_all();
        self.pipeline.navigation.cancel();
        self.pipeline.navigation.wait_idle().await;
        self.pipeline.cache.clear();
        self.liveness_tx.send_replace(false);
        log::info!("engine: stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        *self.liveness_tx.borrow()
    }

    /// `true` while the engine is consuming events.
    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.pipeline.events_tx.subscribe()
    }

    pub fn status(&self) -> GuardStatus {
        let pipeline = &self.pipeline;
        GuardStatus {
            running: self.is_running(),
            identifiers_version: self.identifiers.current().last_updated,
            targets: PerTarget::from_fn(|target| TargetStatus {
                enabled: pipeline.settings.is_enabled(target),
                blocked_until: pipeline.blocks.get_blocked_until(target).unwrap_or_else(|e| {
                    log::warn!("engine: {e}");
                    pipeline.blocks.observed(target)
                }),
                interventions_today: pipeline
                    .settings
                    .interventions_today(target)
                    .unwrap_or_else(|e| {
                        log::warn!("engine: {e}");
                        pipeline.settings.observed_interventions(target)
                    }),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Settings and block state
    // ------------------------------------------------------------------------

    pub fn is_enabled(&self, target: MonitoredTarget) -> bool {
        self.pipeline.settings.is_enabled(target)
    }

    /// Disabling a target also drops its pending grace timer.
    pub fn set_enabled(&self, target: MonitoredTarget, enabled: bool) -> Result<()> {
        self.pipeline.settings.set_enabled(target, enabled)?;
        if !enabled {
            self.pipeline.timers.cancel(target);
        }
        Ok(())
    }

    pub fn subscribe_enabled(&self, target: MonitoredTarget) -> watch::Receiver<bool> {
        self.pipeline.settings.subscribe_enabled(target)
    }

    pub fn subscribe_blocked_until(&self, target: MonitoredTarget) -> watch::Receiver<i64> {
        self.pipeline.blocks.subscribe(target)
    }

    pub fn subscribe_interventions(&self, target: MonitoredTarget) -> watch::Receiver<u32> {
        self.pipeline.settings.subscribe_interventions(target)
    }

    pub fn blocked_until(&self, target: MonitoredTarget) -> Result<i64> {
        self.pipeline.blocks.get_blocked_until(target)
    }

    pub fn interventions_today(&self, target: MonitoredTarget) -> Result<u32> {
        self.pipeline.settings.interventions_today(target)
    }

    pub fn clear_block(&self, target: MonitoredTarget) -> Result<()> {
        self.pipeline.blocks.clear(target)?;
        log::info!("engine: {target} block cleared");
        Ok(())
    }

    pub fn timer_state(&self, target: MonitoredTarget) -> TimerState {
        self.pipeline.timers.state(target)
    }

    // ------------------------------------------------------------------------
    // Identifiers
    // ------------------------------------------------------------------------

    pub fn identifiers(&self, target: MonitoredTarget) -> Vec<String> {
        self.identifiers.identifiers(target)
    }

    pub fn subscribe_identifiers(&self) -> watch::Receiver<IdentifierConfig> {
        self.identifiers.subscribe()
    }

    pub fn update_identifiers(&self, target: MonitoredTarget, ids: Vec<String>) -> Result<()> {
        self.identifiers.update(target, ids)
    }

    pub fn reset_identifiers(&self) -> Result<()> {
        self.identifiers.reset_to_defaults()
    }

    fn restore_active_blocks(&self) {
        let pipeline = &self.pipeline;
        for target in MonitoredTarget::ALL {
            if !pipeline.settings.is_enabled(target) {
                continue;
            }
            let blocked_until = match pipeline.blocks.get_blocked_until(target) {
                Ok(until) => until,
                Err(e) => {
                    log::error!("engine: could not restore {target} block: {e}");
                    continue;
                }
            };
            if blocked_until == 0 {
                continue;
            }
            log::info!("engine: enforcing {target} block carried over until {blocked_until}");
            pipeline.emit(GuardEvent::StartupBlockRestored {
                target,
                blocked_until,
            });
            pipeline.navigation.trigger();
        }
    }
}

impl Pipeline {
    fn emit(&self, event: GuardEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    target: MonitoredTarget,
    pipeline: Pipeline,
    /// Weak so the queue closes once the dispatcher is gone.
    self_tx: mpsc::WeakSender<WorkerMessage>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<WorkerMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Event(event) => self.handle_event(&event),
                WorkerMessage::TimerFired(generation) => self.handle_timer_fired(generation),
            }
        }
        log::debug!("engine: {} worker exiting", self.target);
    }

    fn handle_event(&self, event: &UiEvent) {
        let target = self.target;
        let pipeline = &self.pipeline;

        if !pipeline.settings.is_enabled(target) {
            return;
        }

        if pipeline.blocks.is_blocked(target) {
            log::debug!("engine: {target} is blocked, navigating away ({:?})", event.event_type);
            pipeline.emit(GuardEvent::BlockEnforced {
                target,
                blocked_until: pipeline.blocks.observed(target),
            });
            pipeline.navigation.trigger();
            return;
        }

        if !self.surface_displayed() {
            return;
        }
        // The target may have been disabled while the tree was walked.
        if !pipeline.settings.is_enabled(target) {
            return;
        }

        let self_tx = self.self_tx.clone();
        let armed = pipeline.timers.arm(target, move |generation| async move {
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(WorkerMessage::TimerFired(generation)).await;
            }
        });
        // set_enabled publishes the flag before cancelling, so either this
        // check sees it or its cancel runs after the arm.
        if !pipeline.settings.is_enabled(target) {
            pipeline.timers.cancel(target);
            return;
        }
        if let Some(generation) = armed {
            pipeline.emit(GuardEvent::GraceArmed { target, generation });
        }
    }

    /// Node handles are acquired and released inside this call.
    fn surface_displayed(&self) -> bool {
        let snapshot = self.pipeline.cache.snapshot();
        let root = self.pipeline.tree.root_in_active_window();
        detect(
            root.as_deref(),
            snapshot.identifiers(self.target),
            self.target.keywords(),
        )
    }

    fn handle_timer_fired(&self, generation: u64) {
        let target = self.target;
        let pipeline = &self.pipeline;

        if !pipeline.settings.is_enabled(target) {
            log::debug!("engine: {target} disabled, dropping grace fire");
            pipeline.timers.cancel(target);
            return;
        }
        if !pipeline.timers.begin_fire(target, generation) {
            return;
        }
        match pipeline.executor.perform_intervention(target) {
            Ok(record) => pipeline.emit(record.into()),
            Err(e) => {
                log::error!("engine: intervention for {target} failed: {e}");
                pipeline.emit(GuardEvent::InterventionFailed {
                    target,
                    reason: e.to_string(),
                });
            }
        }
        pipeline.timers.finish_fire(target);
    }
}
