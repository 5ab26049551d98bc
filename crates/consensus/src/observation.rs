//! Observation stream of membership, leadership, and heartbeat events.

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::broadcast;

const OBSERVATION_CHANNEL_CAPACITY: usize = 256;

/// A node's voting status in the consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suffrage {
    /// Full voting member.
    Voter,
    /// Replicating, non-voting member.
    NonVoter,
}

/// An event observed on a replica, delivered in log order.
#[derive(Debug, Clone)]
pub enum Observation {
    /// A server entered or left the consensus group.
    PeerChange {
        /// The affected node id.
        id: String,
        /// The node's suffrage at the time of the change.
        suffrage: Suffrage,
        /// Whether the node was removed from the group.
        removed: bool,
    },

    /// Leadership moved to a new node.
    LeaderChange {
        /// The new leader's node id.
        leader: String,
    },

    /// The replication layer failed to reach a follower.
    FailedHeartbeat {
        /// The suspected node id.
        id: String,
    },

    /// A previously suspected follower answered again.
    ResumedHeartbeat {
        /// The recovered node id.
        id: String,
    },
}

/// Fan-out point for [`Observation`]s.
///
/// The metrics watcher publishes membership and leadership transitions here,
/// and the replication transport reports per-target delivery failures. A
/// `ResumedHeartbeat` is only emitted for a peer that previously failed.
#[derive(Debug)]
pub struct ObservationHub {
    tx: broadcast::Sender<Observation>,
    suspected: Mutex<HashSet<String>>,
}

impl ObservationHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(OBSERVATION_CHANNEL_CAPACITY);
        Self {
            tx,
            suspected: Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe to the observation stream.
    pub fn observe(&self) -> broadcast::Receiver<Observation> {
        self.tx.subscribe()
    }

    /// Publish an observation to all subscribers.
    pub fn emit(&self, observation: Observation) {
        // No subscribers is fine; observation delivery is best-effort.
        let _ = self.tx.send(observation);
    }

    /// Record a failed delivery to `id` and emit a heartbeat failure.
    pub fn report_unreachable(&self, id: &str) {
        self.suspected.lock().insert(id.to_string());
        self.emit(Observation::FailedHeartbeat { id: id.to_string() });
    }

    /// Record a successful delivery to `id`, emitting a resume if it was
    /// previously suspected.
    pub fn report_reachable(&self, id: &str) {
        if self.suspected.lock().remove(id) {
            self.emit(Observation::ResumedHeartbeat { id: id.to_string() });
        }
    }
}

impl Default for ObservationHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resume_only_after_failure() {
        let hub = ObservationHub::new();
        let mut rx = hub.observe();

        hub.report_reachable("a");
        hub.report_unreachable("a");
        hub.report_reachable("a");

        // The initial reachable report for an unsuspected peer is silent.
        assert!(matches!(
            rx.recv().await.unwrap(),
            Observation::FailedHeartbeat { id } if id == "a"
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Observation::ResumedHeartbeat { id } if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_repeated_failures_each_emit() {
        let hub = ObservationHub::new();
        let mut rx = hub.observe();

        hub.report_unreachable("b");
        hub.report_unreachable("b");
        hub.report_unreachable("b");

        for _ in 0..3 {
            assert!(matches!(
                rx.recv().await.unwrap(),
                Observation::FailedHeartbeat { id } if id == "b"
            ));
        }
    }
}
