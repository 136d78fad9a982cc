//! Namespace Repository
//!
//! The cache engine: one [`ShardCache`] per execution shard, one builder task
//! per entry, and a shutdown gate shared by all of them.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::access::EntryProvider;
use super::builder::Builder;
use super::entry::CacheEntry;
use super::metrics::{MetricsSnapshot, RepoMetrics};
use super::shard::{shard_local, ShardCache, ShardId};
use crate::domain::{EventPublisher, InterfaceFactory, Messenger, NamespaceId};
use crate::error::{Error, Result};
use crate::metadata::{MetadataView, RoutingTable, TopologyWatcher};

// =============================================================================
// Configuration
// =============================================================================

/// Repository configuration
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// How long an unused entry waits for a new user before teardown.
    /// Zero tears down as soon as the builder observes a zero count.
    pub drain_grace: Duration,

    /// Upper bound on a single construction; `None` waits indefinitely
    pub construction_timeout: Option<Duration>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::ZERO,
            construction_timeout: None,
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// State shared by every shard and every builder task.
pub(crate) struct RepoShared<F: InterfaceFactory> {
    pub(crate) id: Uuid,
    pub(crate) config: RepoConfig,
    pub(crate) factory: F,
    pub(crate) metadata: MetadataView,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) routing: Arc<RoutingTable>,
    pub(crate) events: Option<Arc<dyn EventPublisher>>,
    pub(crate) metrics: RepoMetrics,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`NamespaceRepo`].
pub struct RepoBuilder<F: InterfaceFactory> {
    config: RepoConfig,
    factory: F,
    metadata: MetadataView,
    messenger: Arc<dyn Messenger>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl<F: InterfaceFactory> RepoBuilder<F> {
    pub fn config(mut self, config: RepoConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> NamespaceRepo<F> {
        let routing = Arc::new(RoutingTable::new());
        routing.rebuild(&self.metadata.namespaces());

        NamespaceRepo {
            shared: Arc::new(RepoShared {
                id: Uuid::new_v4(),
                config: self.config,
                factory: self.factory,
                metadata: self.metadata,
                messenger: self.messenger,
                routing,
                events: self.events,
                metrics: RepoMetrics::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Constructs and caches namespace interfaces, one cache per execution shard.
///
/// The repository itself is `Send + Sync` and is usually shared behind an
/// `Arc`. Lookups must run inside a `LocalSet` (every [`ShardPool`] shard
/// does), because entries and their builders are confined to the calling
/// shard.
///
/// [`ShardPool`]: super::shard::ShardPool
pub struct NamespaceRepo<F: InterfaceFactory> {
    shared: Arc<RepoShared<F>>,
}

impl<F: InterfaceFactory> NamespaceRepo<F> {
    /// Create a repository with default configuration.
    pub fn new(factory: F, metadata: MetadataView, messenger: Arc<dyn Messenger>) -> Self {
        Self::builder(factory, metadata, messenger).build()
    }

    pub fn builder(factory: F, metadata: MetadataView, messenger: Arc<dyn Messenger>) -> RepoBuilder<F> {
        RepoBuilder {
            config: RepoConfig::default(),
            factory,
            metadata,
            messenger,
            events: None,
        }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Region-to-primary maps maintained by the topology watcher.
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.shared.routing
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// The calling shard's cache.
    pub fn local_cache(&self) -> Result<Rc<ShardCache<F::Interface>>> {
        shard_local(self.shared.id, &self.shared.shutdown, || {
            ShardCache::new(ShardId::current())
        })
        .ok_or_else(|| Error::Internal("shard-local cache registered with another type".to_string()))
    }

    /// Start the background task that follows namespace configuration
    /// changes. Shutdown stops it and waits for it.
    pub fn spawn_topology_watcher(&self) -> JoinHandle<()> {
        let watcher = TopologyWatcher::new(
            self.shared.metadata.subscribe_namespaces(),
            Arc::clone(&self.shared.routing),
            self.shared.events.clone(),
        );
        self.shared.tracker.spawn(watcher.run(self.shared.shutdown.clone()))
    }

    /// Cancel all in-flight construction, force teardown of every live entry
    /// and wait until every builder on every shard has finished.
    ///
    /// New lookups fail with [`Error::RepoShuttingDown`] from the moment this
    /// is called.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Shutting down namespace repository");

        self.shared.shutdown.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        info!(
            teardowns = self.shared.metrics.teardowns(),
            "Namespace repository shutdown complete"
        );
    }
}

impl<F: InterfaceFactory> EntryProvider for NamespaceRepo<F> {
    type Interface = F::Interface;

    /// # Panics
    ///
    /// Panics when called outside a `LocalSet` while the entry does not
    /// exist yet, since its builder cannot be spawned. The shard map is left
    /// untouched in that case.
    fn cache_entry(&self, namespace_id: NamespaceId) -> Result<Rc<CacheEntry<F::Interface>>> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::RepoShuttingDown);
        }

        let cache = self.local_cache()?;
        if let Some(entry) = cache.get(&namespace_id) {
            self.shared.metrics.record_cache_hit();
            return Ok(entry);
        }

        // Registered before the re-check, so `shutdown` cannot finish
        // waiting between the check and the spawn
        let tracked = self.shared.tracker.token();
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::RepoShuttingDown);
        }

        let entry = Rc::new(CacheEntry::new(namespace_id, cache.shard()));
        let builder = Builder::new(Arc::clone(&self.shared), Rc::clone(&cache), Rc::clone(&entry));
        tokio::task::spawn_local(async move {
            let _tracked = tracked;
            builder.run().await;
        });

        // The builder cannot run before this returns to the scheduler
        cache.insert(Rc::clone(&entry));
        self.shared.metrics.record_entry_created();
        debug!(namespace = %namespace_id, shard = %cache.shard(), "Created cache entry");

        Ok(entry)
    }
}

impl<F: InterfaceFactory> Drop for NamespaceRepo<F> {
    fn drop(&mut self) {
        // Builders keep the shared state alive; make sure they wind down
        self.shared.shutdown.cancel();
    }
}

impl<F: InterfaceFactory> std::fmt::Debug for NamespaceRepo<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceRepo")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LoopbackMessenger, SimulatedFactory};
    use crate::domain::{KeyRange, PeerId};
    use crate::metadata::{DirectoryMetadata, MetadataPublisher, NamespaceConfig, NamespacesMetadata};
    use crate::repo::EntryState;
    use tokio::task::LocalSet;

    fn repo() -> (NamespaceRepo<SimulatedFactory>, MetadataPublisher, NamespaceId) {
        let ns = NamespaceId::new_v4();
        let peer = PeerId::new_v4();
        let (publisher, view) = MetadataView::channel(
            NamespacesMetadata::default()
                .with_namespace(ns, NamespaceConfig::new("table").with_primary(KeyRange::universe(), peer)),
            DirectoryMetadata::default().with_master(peer, ns, KeyRange::universe()),
        );
        let repo = NamespaceRepo::new(SimulatedFactory::new(), view, Arc::new(LoopbackMessenger::new()));
        (repo, publisher, ns)
    }

    #[tokio::test]
    async fn test_new_entry_is_tracked_before_its_builder_runs() {
        let (repo, _publisher, ns) = repo();

        LocalSet::new()
            .run_until(async {
                let entry = repo.cache_entry(ns).unwrap();
                assert_eq!(repo.shared.tracker.len(), 1);
                assert!(repo.local_cache().unwrap().contains(&ns));

                // A hit does not register anything new
                let again = repo.cache_entry(ns).unwrap();
                assert!(Rc::ptr_eq(&entry, &again));
                assert_eq!(repo.shared.tracker.len(), 1);

                repo.shutdown().await;
                assert!(repo.shared.tracker.is_empty());
                assert_eq!(entry.state(), EntryState::TornDown);
                assert!(!repo.local_cache().unwrap().contains(&ns));
            })
            .await;
    }

    #[tokio::test]
    async fn test_lookup_after_shutdown_registers_nothing() {
        let (repo, _publisher, ns) = repo();
        repo.shared.shutdown.cancel();

        LocalSet::new()
            .run_until(async {
                assert!(matches!(repo.cache_entry(ns), Err(Error::RepoShuttingDown)));
                assert!(repo.shared.tracker.is_empty());
            })
            .await;

        assert_eq!(repo.metrics().entries_created, 0);
    }

    #[tokio::test]
    async fn test_failed_spawn_leaves_shard_map_untouched() {
        let (repo, _publisher, ns) = repo();

        // No LocalSet: the builder cannot be spawned
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| repo.cache_entry(ns)));
        assert!(outcome.is_err());
        assert!(!repo.local_cache().unwrap().contains(&ns));
        assert!(repo.shared.tracker.is_empty());
        assert_eq!(repo.metrics().live_entries, 0);
    }
}
