//! The two monitored applications.
//!
//! Every per-target concern in the engine is keyed by [`MonitoredTarget`]. The
//! set is closed: adding a target means adding a variant and letting the
//! compiler point at every `match` that needs a new arm.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An application whose short-form video surface is guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoredTarget {
    /// YouTube Shorts
    YouTube,
    /// Instagram Reels
    Instagram,
}

impl MonitoredTarget {
    /// Both targets, in a stable order.
    pub const ALL: [MonitoredTarget; 2] = [MonitoredTarget::YouTube, MonitoredTarget::Instagram];

    /// Package name of the monitored application.
    pub fn package(self) -> &'static str {
        match self {
            MonitoredTarget::YouTube => "com.google.android.youtube",
            MonitoredTarget::Instagram => "com.instagram.android",
        }
    }

    /// Route a source package to its target.
    pub fn from_package(package: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.package() == package)
    }

    /// Fixed free-text keywords, already lowercase.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            MonitoredTarget::YouTube => &["shorts", "short", "reel"],
            MonitoredTarget::Instagram => &["reels", "reel", "clips"],
        }
    }

    /// Identifiers used when neither storage nor the bundled defaults yield any.
    pub fn fallback_identifiers(self) -> &'static [&'static str] {
        match self {
            MonitoredTarget::YouTube => &[
                "shorts_player_page",
                "reel_player_page",
                "shorts_container",
                "shorts_video_container",
            ],
            MonitoredTarget::Instagram => &[
                "clips_viewer_view_pager",
                "reel_viewer_fragment_container",
                "clips_tab",
                "reel_feed_timeline",
            ],
        }
    }

    /// Short lowercase key used as a storage prefix.
    pub fn key(self) -> &'static str {
        match self {
            MonitoredTarget::YouTube => "youtube",
            MonitoredTarget::Instagram => "instagram",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            MonitoredTarget::YouTube => 0,
            MonitoredTarget::Instagram => 1,
        }
    }
}

impl fmt::Display for MonitoredTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitoredTarget::YouTube => write!(f, "YouTube"),
            MonitoredTarget::Instagram => write!(f, "Instagram"),
        }
    }
}

/// A value held once per target.
///
/// Indexing is exhaustive over [`MonitoredTarget`], so there is no missing-key
/// case to handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerTarget<T> {
    pub youtube: T,
    pub instagram: T,
}

impl<T> PerTarget<T> {
    pub fn from_fn(mut f: impl FnMut(MonitoredTarget) -> T) -> Self {
        Self {
            youtube: f(MonitoredTarget::YouTube),
            instagram: f(MonitoredTarget::Instagram),
        }
    }

    pub fn get(&self, target: MonitoredTarget) -> &T {
        match target {
            MonitoredTarget::YouTube => &self.youtube,
            MonitoredTarget::Instagram => &self.instagram,
        }
    }

    pub fn get_mut(&mut self, target: MonitoredTarget) -> &mut T {
        match target {
            MonitoredTarget::YouTube => &mut self.youtube,
            MonitoredTarget::Instagram => &mut self.instagram,
        }
    }
}
