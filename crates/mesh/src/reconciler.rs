//! Peer-table reconciler interface.
//!
//! The encrypted tunnel driver is an external collaborator: the mesh core
//! only tells it to converge on the peer set implied by the current registry
//! view. Implementations must be idempotent and tolerate being called from
//! the observer task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

/// Failure from the tunnel driver; logged, never propagated to the engine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("peer table refresh failed: {0}")]
pub struct ReconcilerError(pub String);

/// Drives the external tunnel driver toward the registry's peer set.
#[async_trait]
pub trait PeerReconciler: Clone + Send + Sync + 'static {
    async fn refresh_peers(&self) -> Result<(), ReconcilerError>;
}

/// Reconciler that does nothing, for nodes without a tunnel interface.
#[derive(Debug, Clone, Default)]
pub struct NoopReconciler;

#[async_trait]
impl PeerReconciler for NoopReconciler {
    async fn refresh_peers(&self) -> Result<(), ReconcilerError> {
        Ok(())
    }
}

/// Reconciler that counts refresh calls; used in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingReconciler {
    calls: Arc<AtomicUsize>,
}

impl RecordingReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refreshes requested so far.
    pub fn refresh_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerReconciler for RecordingReconciler {
    async fn refresh_peers(&self) -> Result<(), ReconcilerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
