//! Entry Builder Task
//!
//! One task per cache entry, spawned on the entry's shard. It owns the
//! entry's whole lifecycle:
//!
//! ```text
//!  Constructing ──ok──► Live ──count==0──► DrainPending ──still 0──► TornDown
//!       │                ▲                     │
//!       │                └──────revived────────┘
//!       └──failed/cancelled──► removed (no teardown)
//! ```
//!
//! The builder is the only code that removes an entry from its shard map.
//! Removal happens in the same non-suspending step as the final zero check,
//! so once teardown has begun no lookup can reach the entry any more.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::entry::{BuildFailure, CacheEntry, EntryState};
use super::repository::RepoShared;
use super::shard::ShardCache;
use crate::domain::{InterfaceFactory, RepoEvent};
use crate::error::Error;

pub(crate) struct Builder<F: InterfaceFactory> {
    shared: Arc<RepoShared<F>>,
    cache: Rc<ShardCache<F::Interface>>,
    entry: Rc<CacheEntry<F::Interface>>,
}

impl<F: InterfaceFactory> Builder<F> {
    pub(crate) fn new(
        shared: Arc<RepoShared<F>>,
        cache: Rc<ShardCache<F::Interface>>,
        entry: Rc<CacheEntry<F::Interface>>,
    ) -> Self {
        Self {
            shared,
            cache,
            entry,
        }
    }

    pub(crate) async fn run(self) {
        let namespace_id = self.entry.namespace_id();
        let shard = self.entry.shard().index();

        self.emit(RepoEvent::EntryCreated {
            namespace_id,
            shard,
            timestamp: Utc::now(),
        })
        .await;

        let started = Instant::now();
        match self.construct().await {
            Ok(interface) => {
                self.entry.publish(Ok(interface));
                self.entry.set_state(EntryState::Live);
                self.shared.metrics.record_build_succeeded();
                debug!(
                    namespace = %namespace_id,
                    shard,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Namespace interface built"
                );
            }
            Err(failure) => {
                self.entry.publish(Err(failure.clone()));
                self.retire();

                match &failure {
                    BuildFailure::Cancelled => {
                        self.shared.metrics.record_build_cancelled();
                        debug!(namespace = %namespace_id, shard, "Construction cancelled");
                    }
                    BuildFailure::Failed(reason) => {
                        self.shared.metrics.record_build_failed();
                        warn!(namespace = %namespace_id, shard, "Construction failed: {}", reason);
                    }
                }

                self.emit(RepoEvent::ConstructionFailed {
                    namespace_id,
                    shard,
                    reason: failure.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
                return;
            }
        }

        self.emit(RepoEvent::InterfaceBuilt {
            namespace_id,
            shard,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        })
        .await;

        self.wait_until_unused().await;

        // Commit point: nothing below runs before the entry leaves the map
        let forced = self.entry.ref_count() > 0;
        self.retire();

        if let Some(interface) = self.entry.built_interface() {
            self.shared.factory.teardown(interface).await;
        }
        self.shared.metrics.record_teardown(forced);

        if forced {
            info!(
                namespace = %namespace_id,
                shard,
                refs = self.entry.ref_count(),
                "Namespace interface torn down by shutdown"
            );
        } else {
            debug!(namespace = %namespace_id, shard, "Namespace interface torn down");
        }

        self.emit(RepoEvent::EntryTornDown {
            namespace_id,
            shard,
            forced,
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Run the factory, racing shutdown and the configured timeout.
    async fn construct(&self) -> Result<F::Interface, BuildFailure> {
        let namespace_id = self.entry.namespace_id();
        let shutdown = &self.shared.shutdown;

        if shutdown.is_cancelled() {
            return Err(BuildFailure::Cancelled);
        }

        let build = self.shared.factory.build(
            namespace_id,
            self.shared.metadata.snapshot(),
            Arc::clone(&self.shared.messenger),
            shutdown.child_token(),
        );

        let bounded = async {
            match self.shared.config.construction_timeout {
                Some(limit) => tokio::time::timeout(limit, build)
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::ConstructionFailed {
                            namespace_id,
                            reason: format!("timed out after {:?}", limit),
                        })
                    }),
                None => build.await,
            }
        };

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => Err(BuildFailure::Cancelled),

            result = bounded => result.map_err(|e| match e {
                Error::Cancelled | Error::RepoShuttingDown => BuildFailure::Cancelled,
                Error::ConstructionFailed { reason, .. } => BuildFailure::Failed(reason),
                other => BuildFailure::Failed(other.to_string()),
            }),
        }
    }

    /// Suspend until the entry has no users and no revival arrived, or until
    /// shutdown.
    async fn wait_until_unused(&self) {
        let shutdown = &self.shared.shutdown;
        let grace = self.shared.config.drain_grace;

        loop {
            // Live
            if let Some(zero) = self.entry.wait_for_zero() {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        self.entry.clear_signals();
                        return;
                    }

                    _ = zero => {}
                }
            }

            // DrainPending
            self.entry.set_state(EntryState::DrainPending);
            if self.entry.ref_count() > 0 {
                self.revived().await;
                continue;
            }

            if grace.is_zero() || shutdown.is_cancelled() {
                return;
            }

            let Some(nonzero) = self.entry.wait_for_nonzero() else {
                self.revived().await;
                continue;
            };

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    self.entry.clear_signals();
                    return;
                }

                _ = nonzero => {
                    self.revived().await;
                    continue;
                }

                _ = tokio::time::sleep(grace) => {
                    self.entry.clear_signals();
                }
            }

            if self.entry.ref_count() == 0 {
                return;
            }
            self.revived().await;
        }
    }

    async fn revived(&self) {
        self.entry.set_state(EntryState::Live);
        self.shared.metrics.record_revival();
        debug!(
            namespace = %self.entry.namespace_id(),
            shard = %self.entry.shard(),
            refs = self.entry.ref_count(),
            "Cache entry revived before teardown"
        );

        self.emit(RepoEvent::EntryRevived {
            namespace_id: self.entry.namespace_id(),
            shard: self.entry.shard().index(),
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Mark torn down and leave the shard map.
    fn retire(&self) {
        self.entry.set_state(EntryState::TornDown);
        if self.cache.remove(&self.entry) {
            self.shared.metrics.record_entry_removed();
        } else {
            warn!(
                namespace = %self.entry.namespace_id(),
                shard = %self.entry.shard(),
                "Cache entry missing from its shard map at removal"
            );
        }
    }

    async fn emit(&self, event: RepoEvent) {
        if let Some(events) = &self.shared.events {
            if let Err(e) = events.publish(event).await {
                warn!("Failed to publish repository event: {}", e);
            }
        }
    }
}

impl<F: InterfaceFactory> Drop for Builder<F> {
    /// A builder whose task is dropped before `run` finishes (its `LocalSet`
    /// went away, or the spawn itself failed) must still release its waiters
    /// and take the entry out of the shard map.
    fn drop(&mut self) {
        if self.entry.state() == EntryState::TornDown {
            return;
        }

        if !self.entry.is_published() {
            self.entry.publish(Err(BuildFailure::Cancelled));
            self.shared.metrics.record_build_cancelled();
        }
        self.entry.set_state(EntryState::TornDown);
        self.entry.clear_signals();

        let removed = self.cache.remove(&self.entry);
        if removed {
            self.shared.metrics.record_entry_removed();
        }
        warn!(
            namespace = %self.entry.namespace_id(),
            shard = %self.entry.shard(),
            removed,
            "Builder dropped before the entry was retired"
        );
    }
}
