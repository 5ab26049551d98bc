//! Plugin watcher capability: best-effort mesh event emission.

use ember_registry::Peer;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// A node's role in the consensus group as derived at observation time.
///
/// Eventually consistent with the log; never stored in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Leader,
    Voter,
    NonVoter,
    Unknown,
}

/// What happened to the node carried by a [`MeshEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshEventKind {
    NodeJoin,
    NodeLeave,
    LeaderChange,
}

/// An event emitted to plugin watchers.
#[derive(Debug, Clone)]
pub struct MeshEvent {
    pub kind: MeshEventKind,
    /// The affected node's registry record at emission time.
    pub node: Peer,
    pub status: ClusterStatus,
}

/// Capability interface for plugin watchers.
///
/// Emission is best-effort and non-blocking; a consumer that needs
/// read-your-writes must re-read through storage.
pub trait MeshWatchers: Clone + Send + Sync + 'static {
    /// Whether any watcher is registered. Observers skip record lookups when
    /// nothing is listening.
    fn has_watchers(&self) -> bool;

    /// Deliver `event` to all watchers.
    fn emit(&self, event: MeshEvent);
}

/// Watcher set that drops all events.
#[derive(Debug, Clone, Default)]
pub struct NoopWatchers;

impl MeshWatchers for NoopWatchers {
    fn has_watchers(&self) -> bool {
        false
    }

    fn emit(&self, _event: MeshEvent) {}
}

/// Broadcast-backed watcher set.
#[derive(Debug, Clone)]
pub struct BroadcastWatchers {
    tx: broadcast::Sender<MeshEvent>,
}

impl BroadcastWatchers {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Attach a watcher.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastWatchers {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshWatchers for BroadcastWatchers {
    fn has_watchers(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    fn emit(&self, event: MeshEvent) {
        // Nothing listening is fine; emission is best-effort.
        let _ = self.tx.send(event);
    }
}
