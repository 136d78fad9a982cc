//! Topology Watcher
//!
//! Background task that consumes namespace-configuration changes and keeps
//! the routing table in step with them. It never touches cache entries: an
//! interface for a deleted namespace simply stops being requested and drains
//! on its own.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::NamespacesMetadata;
use crate::domain::{EventPublisher, KeyRange, NamespaceId, PeerId, RepoEvent};

// =============================================================================
// Routing Table
// =============================================================================

/// Key range → primary owner, for one namespace.
pub type RegionMap = BTreeMap<KeyRange, PeerId>;

/// Region-to-primary maps for every live namespace, shared by all shards.
#[derive(Debug, Default)]
pub struct RoutingTable {
    regions: DashMap<NamespaceId, Arc<RegionMap>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Region map for a namespace, if it is live.
    pub fn regions(&self, namespace_id: &NamespaceId) -> Option<Arc<RegionMap>> {
        self.regions.get(namespace_id).map(|r| Arc::clone(r.value()))
    }

    /// Primary owner of `key` within `namespace_id`.
    pub fn primary_for(&self, namespace_id: &NamespaceId, key: &str) -> Option<PeerId> {
        let regions = self.regions.get(namespace_id)?;
        regions
            .iter()
            .find(|(range, _)| range.contains(key))
            .map(|(_, peer)| *peer)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Rebuild from a namespaces snapshot; deleted namespaces are dropped.
    pub fn rebuild(&self, metadata: &NamespacesMetadata) {
        self.regions.retain(|id, _| metadata.is_live(id));

        for (id, config) in metadata.live_namespaces() {
            let map: RegionMap = config
                .primaries
                .iter()
                .map(|assignment| (assignment.range.clone(), assignment.primary))
                .collect();

            if map.len() != config.primaries.len() {
                warn!(namespace = %id, "Duplicate key ranges in primary assignment");
            }

            self.regions.insert(*id, Arc::new(map));
        }
    }
}

// =============================================================================
// Watcher
// =============================================================================

/// Consumes namespace configuration changes until cancelled.
pub struct TopologyWatcher {
    changes: watch::Receiver<Arc<NamespacesMetadata>>,
    routing: Arc<RoutingTable>,
    events: Option<Arc<dyn EventPublisher>>,
    known: HashSet<NamespaceId>,
}

impl TopologyWatcher {
    pub fn new(
        changes: watch::Receiver<Arc<NamespacesMetadata>>,
        routing: Arc<RoutingTable>,
        events: Option<Arc<dyn EventPublisher>>,
    ) -> Self {
        Self {
            changes,
            routing,
            events,
            known: HashSet::new(),
        }
    }

    /// Run until `cancel` fires or the metadata publisher goes away.
    #[instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Starting topology watcher");

        // Seed from whatever is current before waiting for changes
        let initial = Arc::clone(&self.changes.borrow_and_update());
        self.apply(&initial).await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Topology watcher cancelled");
                    break;
                }

                changed = self.changes.changed() => {
                    if changed.is_err() {
                        info!("Namespace metadata publisher closed");
                        break;
                    }
                    let snapshot = Arc::clone(&self.changes.borrow_and_update());
                    self.apply(&snapshot).await;
                }
            }
        }

        info!("Topology watcher stopped");
    }

    /// Re-evaluate the live namespace set and refresh routing.
    async fn apply(&mut self, metadata: &NamespacesMetadata) {
        self.routing.rebuild(metadata);

        let current: HashSet<NamespaceId> =
            metadata.live_namespaces().map(|(id, _)| *id).collect();

        let mut added: Vec<NamespaceId> = current.difference(&self.known).copied().collect();
        let mut removed: Vec<NamespaceId> = self.known.difference(&current).copied().collect();
        self.known = current;

        if added.is_empty() && removed.is_empty() {
            debug!("Namespace metadata changed without membership changes");
            return;
        }

        added.sort();
        removed.sort();
        info!(
            added = added.len(),
            removed = removed.len(),
            live = self.known.len(),
            "Namespace set changed"
        );

        if let Some(events) = &self.events {
            let event = RepoEvent::NamespacesChanged {
                added,
                removed,
                timestamp: Utc::now(),
            };
            if let Err(e) = events.publish(event).await {
                warn!("Failed to publish namespace change event: {}", e);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
