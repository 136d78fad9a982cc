//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the value objects the repository is keyed by and the
//! abstractions (ports) for the collaborators it does not own: the interface
//! factory, the messaging substrate and the event sink.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  InterfaceFactory │ Messenger │ EventPublisher       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  SimulatedFactory │ LoopbackMessenger │ Logging...   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::metadata::TopologySnapshot;

// =============================================================================
// Value Objects
// =============================================================================

/// Namespace (logical table) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub Uuid);

impl NamespaceId {
    /// Generate a fresh random identifier.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero identifier.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl std::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NamespaceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Cluster peer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open key range `[start, end)`; `end == None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
}

impl KeyRange {
    pub fn new(start: impl Into<String>, end: Option<String>) -> Self {
        Self {
            start: start.into(),
            end,
        }
    }

    /// The range covering every key.
    pub fn universe() -> Self {
        Self::new("", None)
    }

    pub fn contains(&self, key: &str) -> bool {
        key >= self.start.as_str() && self.end.as_deref().map_or(true, |end| key < end)
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        let starts_before_other_ends = other.end.as_deref().map_or(true, |end| self.start.as_str() < end);
        let other_starts_before_end = self.end.as_deref().map_or(true, |end| other.start.as_str() < end);
        starts_before_other_ends && other_starts_before_end
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.end {
            Some(end) => write!(f, "[{:?}, {:?})", self.start, end),
            None => write!(f, "[{:?}, +inf)", self.start),
        }
    }
}

// =============================================================================
// Interface Factory Port
// =============================================================================

/// Port for building and discarding namespace interfaces.
///
/// Builds run on an execution shard, so neither the factory futures nor the
/// interface they produce need to be `Send`. A build may take several network
/// round trips and must return promptly once `cancel` fires.
///
/// # Example
///
/// ```ignore
/// struct ClusterFactory { /* ... */ }
///
/// #[async_trait(?Send)]
/// impl InterfaceFactory for ClusterFactory {
///     type Interface = ClusterNamespaceInterface;
///
///     async fn build(&self, namespace_id: NamespaceId, topology: TopologySnapshot,
///                    messenger: Arc<dyn Messenger>, cancel: CancellationToken)
///         -> Result<Self::Interface> {
///         // Handshake with every master of `namespace_id`
///     }
///
///     async fn teardown(&self, interface: &Self::Interface) {
///         interface.close().await;
///     }
/// }
/// ```
#[async_trait(?Send)]
pub trait InterfaceFactory: Send + Sync + 'static {
    /// The constructed interface type, owned by the cache entry.
    type Interface: 'static;

    /// Build the interface for a namespace.
    async fn build(
        &self,
        namespace_id: NamespaceId,
        topology: TopologySnapshot,
        messenger: Arc<dyn Messenger>,
        cancel: CancellationToken,
    ) -> Result<Self::Interface>;

    /// Release whatever the interface holds on remote peers.
    ///
    /// Called at most once per successfully built interface.
    async fn teardown(&self, interface: &Self::Interface);
}

// =============================================================================
// Messaging Port
// =============================================================================

/// Port for the cluster messaging substrate.
///
/// The repository never inspects payloads; it only hands the messenger to the
/// factory.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// The peer this process runs as.
    fn local_peer(&self) -> PeerId;

    /// Send an opaque payload to a peer.
    async fn send(&self, peer: PeerId, payload: Bytes) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

use super::events::RepoEvent;

/// Port for publishing repository events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a repository event.
    async fn publish(&self, event: RepoEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<RepoEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::new("b", Some("d".to_string()));

        assert!(range.contains("b"));
        assert!(range.contains("c"));
        assert!(range.contains("czzz"));
        assert!(!range.contains("d"));
        assert!(!range.contains("a"));
    }

    #[test]
    fn test_key_range_unbounded() {
        let range = KeyRange::new("m", None);
        assert!(range.contains("m"));
        assert!(range.contains("zzzz"));
        assert!(!range.contains("l"));

        assert!(KeyRange::universe().contains(""));
    }

    #[test]
    fn test_key_range_overlaps() {
        let left = KeyRange::new("a", Some("m".to_string()));
        let right = KeyRange::new("m", None);
        let middle = KeyRange::new("k", Some("p".to_string()));

        assert!(!left.overlaps(&right));
        assert!(left.overlaps(&middle));
        assert!(right.overlaps(&middle));
        assert!(KeyRange::universe().overlaps(&left));
    }

    #[test]
    fn test_namespace_id_display() {
        let id = NamespaceId::nil();
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000000");
        assert_ne!(NamespaceId::new_v4(), NamespaceId::new_v4());
    }

    #[test]
    fn test_key_range_serde() {
        let range: KeyRange = serde_json::from_str(r#"{"start":"a"}"#).unwrap();
        assert_eq!(range, KeyRange::new("a", None));
    }
}
