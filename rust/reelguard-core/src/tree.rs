//! Foreground UI tree access.
//!
//! The platform hands out UI nodes as handles that must be given back once
//! inspected. [`NodeRef`] owns one such handle and releases it on drop, so a
//! traversal holds at most the chain of ancestors of the node it is looking
//! at, and never keeps a node past the traversal call.

use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraversalError {
    /// The node was recycled or its window went away mid-traversal.
    #[error("tree: stale node reference - {0}")]
    Stale(String),

    #[error("tree: node access failed - {0}")]
    Access(String),

    #[error("tree: depth limit {0} exceeded")]
    TooDeep(usize),
}

/// Read-only view of one platform UI node.
pub trait UiNode {
    /// Structural identifier, e.g. `com.google.android.youtube:id/shorts_container`.
    fn view_id(&self) -> Result<Option<String>, TraversalError>;

    /// Visible text.
    fn text(&self) -> Result<Option<String>, TraversalError>;

    /// Accessible label.
    fn content_description(&self) -> Result<Option<String>, TraversalError>;

    fn child_count(&self) -> Result<usize, TraversalError>;

    /// Acquire the child at `index`. `Ok(None)` when the slot is empty.
    fn child(&self, index: usize) -> Result<Option<NodeRef>, TraversalError>;

    /// Hand the platform handle back. Called once, when the owning
    /// [`NodeRef`] drops.
    fn release(&mut self) {}
}

/// Owned handle to an acquired node.
pub struct NodeRef {
    node: Box<dyn UiNode>,
}

impl NodeRef {
    pub fn new(node: impl UiNode + 'static) -> Self {
        Self {
            node: Box::new(node),
        }
    }
}

impl Deref for NodeRef {
    type Target = dyn UiNode;

    fn deref(&self) -> &Self::Target {
        self.node.as_ref()
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.node.release();
    }
}

/// Accessor for the root of the current foreground window.
pub trait WindowTreeProvider: Send + Sync {
    /// `None` when there is no active window.
    fn root_in_active_window(&self) -> Option<NodeRef>;
}

// ============================================================================
// Snapshot trees
// ============================================================================

/// A captured UI tree, as recorded for replays and used by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SnapshotNode>,
    /// Simulates a recycled node: every accessor fails.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

impl SnapshotNode {
    pub fn with_id(view_id: &str) -> Self {
        Self {
            view_id: Some(view_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn with_description(description: &str) -> Self {
        Self {
            content_description: Some(description.to_string()),
            ..Self::default()
        }
    }

    pub fn child(mut self, child: SnapshotNode) -> Self {
        self.children.push(child);
        self
    }
}

/// Acquire/release bookkeeping for snapshot handles.
#[derive(Debug, Default)]
pub struct HandleStats {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl HandleStats {
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Handles currently held.
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

struct SnapshotHandle {
    root: Arc<SnapshotNode>,
    path: Vec<usize>,
    stats: Arc<HandleStats>,
    released: bool,
}

impl SnapshotHandle {
    fn acquire(root: Arc<SnapshotNode>, path: Vec<usize>, stats: Arc<HandleStats>) -> NodeRef {
        stats.acquired.fetch_add(1, Ordering::SeqCst);
        NodeRef::new(Self {
            root,
            path,
            stats,
            released: false,
        })
    }

    fn resolve(&self) -> Result<&SnapshotNode, TraversalError> {
        if self.released {
            return Err(TraversalError::Stale("handle already released".to_string()));
        }
        let mut node = self.root.as_ref();
        for &i in &self.path {
            node = node
                .children
                .get(i)
                .ok_or_else(|| TraversalError::Stale(format!("child {i} vanished")))?;
        }
        if node.stale {
            return Err(TraversalError::Stale(format!("node at {:?}", self.path)));
        }
        Ok(node)
    }
}

impl UiNode for SnapshotHandle {
    fn view_id(&self) -> Result<Option<String>, TraversalError> {
        Ok(self.resolve()?.view_id.clone())
    }

    fn text(&self) -> Result<Option<String>, TraversalError> {
        Ok(self.resolve()?.text.clone())
    }

    fn content_description(&self) -> Result<Option<String>, TraversalError> {
        Ok(self.resolve()?.content_description.clone())
    }

    fn child_count(&self) -> Result<usize, TraversalError> {
        Ok(self.resolve()?.children.len())
    }

    fn child(&self, index: usize) -> Result<Option<NodeRef>, TraversalError> {
        if index >= self.resolve()?.children.len() {
            return Ok(None);
        }
        let mut path = self.path.clone();
        path.push(index);
        Ok(Some(SnapshotHandle::acquire(
            Arc::clone(&self.root),
            path,
            Arc::clone(&self.stats),
        )))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.stats.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Serves a replaceable snapshot as the active window.
#[derive(Default)]
pub struct SnapshotProvider {
    root: Mutex<Option<Arc<SnapshotNode>>>,
    stats: Arc<HandleStats>,
    root_requests: AtomicU64,
}

impl SnapshotProvider {
    pub fn new(root: Option<SnapshotNode>) -> Self {
        let provider = Self::default();
        provider.set_root(root);
        provider
    }

    pub fn set_root(&self, root: Option<SnapshotNode>) {
        *self.root.lock().unwrap_or_else(PoisonError::into_inner) = root.map(Arc::new);
    }

    pub fn stats(&self) -> Arc<HandleStats> {
        Arc::clone(&self.stats)
    }

    /// How many times the active window was asked for, i.e. detection passes.
    pub fn root_requests(&self) -> u64 {
        self.root_requests.load(Ordering::SeqCst)
    }
}

impl WindowTreeProvider for SnapshotProvider {
    fn root_in_active_window(&self) -> Option<NodeRef> {
        self.root_requests.fetch_add(1, Ordering::SeqCst);
        let root = self
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        Some(SnapshotHandle::acquire(root, Vec::new(), Arc::clone(&self.stats)))
    }
}
