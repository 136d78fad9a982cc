//! Cluster Metadata Views
//!
//! Read-only, subscribable views of the two pieces of cluster metadata the
//! repository consumes:
//!
//! - the namespaces configuration (which tables exist, their primaries)
//! - the directory (which shards each peer currently serves)
//!
//! Both are published through `tokio::sync::watch` channels. The repository
//! never writes to them; [`MetadataPublisher`] stands in for the metadata
//! subsystem that does.

mod watcher;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::domain::{KeyRange, NamespaceId, PeerId};

pub use watcher::{RegionMap, RoutingTable, TopologyWatcher};

// =============================================================================
// Namespaces Configuration
// =============================================================================

/// A key range pinned to a primary peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionAssignment {
    pub range: KeyRange,
    pub primary: PeerId,
}

/// Configuration of one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Human readable table name
    pub name: String,

    /// Tombstone; deleted namespaces stay in the map
    #[serde(default)]
    pub deleted: bool,

    /// Primary assignment per key range
    #[serde(default)]
    pub primaries: Vec<RegionAssignment>,
}

impl NamespaceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_primary(mut self, range: KeyRange, primary: PeerId) -> Self {
        self.primaries.push(RegionAssignment { range, primary });
        self
    }
}

/// Configuration of every namespace in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacesMetadata {
    #[serde(default)]
    pub namespaces: HashMap<NamespaceId, NamespaceConfig>,
}

impl NamespacesMetadata {
    pub fn with_namespace(mut self, id: NamespaceId, config: NamespaceConfig) -> Self {
        self.namespaces.insert(id, config);
        self
    }

    /// Namespaces that exist and are not tombstoned.
    pub fn live_namespaces(&self) -> impl Iterator<Item = (&NamespaceId, &NamespaceConfig)> {
        self.namespaces.iter().filter(|(_, config)| !config.deleted)
    }

    pub fn is_live(&self, id: &NamespaceId) -> bool {
        self.namespaces.get(id).is_some_and(|config| !config.deleted)
    }
}

// =============================================================================
// Directory
// =============================================================================

/// What one peer currently serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDirectory {
    /// Key ranges this peer is master for, per namespace
    #[serde(default)]
    pub masters: HashMap<NamespaceId, Vec<KeyRange>>,
}

/// Per-peer directory of served shards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMetadata {
    #[serde(default)]
    pub peers: HashMap<PeerId, PeerDirectory>,
}

impl DirectoryMetadata {
    pub fn with_master(mut self, peer: PeerId, namespace_id: NamespaceId, range: KeyRange) -> Self {
        self.peers
            .entry(peer)
            .or_default()
            .masters
            .entry(namespace_id)
            .or_default()
            .push(range);
        self
    }

    /// Every (peer, range) currently mastering part of `namespace_id`,
    /// ordered by range.
    pub fn masters_of(&self, namespace_id: &NamespaceId) -> Vec<(PeerId, KeyRange)> {
        let mut masters: Vec<(PeerId, KeyRange)> = self
            .peers
            .iter()
            .flat_map(|(peer, dir)| {
                dir.masters
                    .get(namespace_id)
                    .into_iter()
                    .flatten()
                    .map(move |range| (*peer, range.clone()))
            })
            .collect();
        masters.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        masters
    }
}

// =============================================================================
// Views
// =============================================================================

/// Point-in-time copy of both metadata views, handed to the factory.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    pub namespaces: Arc<NamespacesMetadata>,
    pub directory: Arc<DirectoryMetadata>,
}

/// Subscribable read side of the cluster metadata.
#[derive(Debug, Clone)]
pub struct MetadataView {
    namespaces: watch::Receiver<Arc<NamespacesMetadata>>,
    directory: watch::Receiver<Arc<DirectoryMetadata>>,
}

/// Write side of the cluster metadata.
#[derive(Debug)]
pub struct MetadataPublisher {
    namespaces: watch::Sender<Arc<NamespacesMetadata>>,
    directory: watch::Sender<Arc<DirectoryMetadata>>,
}

impl MetadataView {
    /// Create a connected publisher/view pair seeded with initial metadata.
    pub fn channel(
        namespaces: NamespacesMetadata,
        directory: DirectoryMetadata,
    ) -> (MetadataPublisher, MetadataView) {
        let (ns_tx, ns_rx) = watch::channel(Arc::new(namespaces));
        let (dir_tx, dir_rx) = watch::channel(Arc::new(directory));
        (
            MetadataPublisher {
                namespaces: ns_tx,
                directory: dir_tx,
            },
            MetadataView {
                namespaces: ns_rx,
                directory: dir_rx,
            },
        )
    }

    /// Current state of both views.
    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            namespaces: Arc::clone(&self.namespaces.borrow()),
            directory: Arc::clone(&self.directory.borrow()),
        }
    }

    pub fn namespaces(&self) -> Arc<NamespacesMetadata> {
        Arc::clone(&self.namespaces.borrow())
    }

    /// A fresh subscription to namespace configuration changes.
    pub fn subscribe_namespaces(&self) -> watch::Receiver<Arc<NamespacesMetadata>> {
        self.namespaces.clone()
    }

    /// A fresh subscription to directory changes.
    pub fn subscribe_directory(&self) -> watch::Receiver<Arc<DirectoryMetadata>> {
        self.directory.clone()
    }
}

impl MetadataPublisher {
    pub fn publish_namespaces(&self, namespaces: NamespacesMetadata) {
        self.namespaces.send_replace(Arc::new(namespaces));
    }

    pub fn publish_directory(&self, directory: DirectoryMetadata) {
        self.directory.send_replace(Arc::new(directory));
    }

    /// Apply an in-place edit to the namespaces configuration.
    pub fn update_namespaces(&self, edit: impl FnOnce(&mut NamespacesMetadata)) {
        self.namespaces.send_modify(|current| edit(Arc::make_mut(current)));
    }
}

// =============================================================================
// Tests
// =============================================================================
