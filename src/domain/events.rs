//! Repository Events
//!
//! Immutable records of cache entry lifecycle transitions and topology
//! changes. They feed audit logging and let tests observe the protocol
//! without reaching into entry internals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ports::NamespaceId;

/// Event representing a significant occurrence in the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RepoEvent {
    // =========================================================================
    // Entry Lifecycle Events
    // =========================================================================
    /// A cache entry was created and its builder spawned.
    EntryCreated {
        namespace_id: NamespaceId,
        shard: usize,
        timestamp: DateTime<Utc>,
    },

    /// The interface was built and published.
    InterfaceBuilt {
        namespace_id: NamespaceId,
        shard: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Construction failed or was cancelled.
    ConstructionFailed {
        namespace_id: NamespaceId,
        shard: usize,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A draining entry was acquired again before teardown.
    EntryRevived {
        namespace_id: NamespaceId,
        shard: usize,
        timestamp: DateTime<Utc>,
    },

    /// The entry was torn down and removed from its shard map.
    EntryTornDown {
        namespace_id: NamespaceId,
        shard: usize,
        forced: bool,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Topology Events
    // =========================================================================
    /// The set of live namespaces changed.
    NamespacesChanged {
        added: Vec<NamespaceId>,
        removed: Vec<NamespaceId>,
        timestamp: DateTime<Utc>,
    },
}

impl RepoEvent {
    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            RepoEvent::EntryCreated { .. } => "EntryCreated",
            RepoEvent::InterfaceBuilt { .. } => "InterfaceBuilt",
            RepoEvent::ConstructionFailed { .. } => "ConstructionFailed",
            RepoEvent::EntryRevived { .. } => "EntryRevived",
            RepoEvent::EntryTornDown { .. } => "EntryTornDown",
            RepoEvent::NamespacesChanged { .. } => "NamespacesChanged",
        }
    }

    /// The namespace the event concerns, if it concerns exactly one.
    pub fn namespace_id(&self) -> Option<NamespaceId> {
        match self {
            RepoEvent::EntryCreated { namespace_id, .. }
            | RepoEvent::InterfaceBuilt { namespace_id, .. }
            | RepoEvent::ConstructionFailed { namespace_id, .. }
            | RepoEvent::EntryRevived { namespace_id, .. }
            | RepoEvent::EntryTornDown { namespace_id, .. } => Some(*namespace_id),
            RepoEvent::NamespacesChanged { .. } => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RepoEvent::EntryCreated { timestamp, .. }
            | RepoEvent::InterfaceBuilt { timestamp, .. }
            | RepoEvent::ConstructionFailed { timestamp, .. }
            | RepoEvent::EntryRevived { timestamp, .. }
            | RepoEvent::EntryTornDown { timestamp, .. }
            | RepoEvent::NamespacesChanged { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type() {
        let event = RepoEvent::EntryTornDown {
            namespace_id: NamespaceId::nil(),
            shard: 0,
            forced: false,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "EntryTornDown");
        assert_eq!(event.namespace_id(), Some(NamespaceId::nil()));
    }

    #[test]
    fn test_event_serialization() {
        let event = RepoEvent::NamespacesChanged {
            added: vec![NamespaceId::nil()],
            removed: vec![],
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"NamespacesChanged\""));

        let back: RepoEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "NamespacesChanged");
        assert_eq!(back.namespace_id(), None);
    }
}
