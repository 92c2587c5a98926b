pub mod block;
pub mod cache;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod identifiers;
pub mod intervention;
pub mod navigation;
pub mod quotes;
pub mod settings;
pub mod store;
pub mod target;
pub mod timer;
pub mod tree;

// Re-export common types
pub use crate::classifier::{classify, UiEvent, UiEventType};
pub use crate::clock::{Clock, DayBoundary, ManualClock, SystemClock};
pub use crate::config::{GuardConfig, ReelguardConfig, StorageBackend};
pub use crate::engine::{Engine, EngineDeps, GuardEvent, GuardStatus, TargetStatus};
pub use crate::error::{GuardError, Result};
pub use crate::identifiers::{validate_identifiers, IdentifierConfig, ValidationError};
pub use crate::navigation::{
    NavAction, NavigationActions, NavigationError, NavigationOutcome, NavigationTiming,
    RecordingNavigation,
};
pub use crate::store::{KeyValueStore, KeyringStore, MemoryStore, SqliteStore, StoreError};
pub use crate::target::{MonitoredTarget, PerTarget};
pub use crate::tree::{NodeRef, SnapshotNode, SnapshotProvider, UiNode, WindowTreeProvider};
