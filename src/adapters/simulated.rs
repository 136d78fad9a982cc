//! Simulated Cluster Adapters
//!
//! In-process implementations of the `InterfaceFactory` and `Messenger`
//! ports. They stand in for a real cluster in the load driver and in tests:
//!
//! - construction latency and failures are configurable per factory
//! - a semaphore gate can hold every build until the caller opens it
//! - the messenger counts what was sent and can mark peers unreachable

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::domain::{InterfaceFactory, KeyRange, Messenger, NamespaceId, PeerId};
use crate::error::{Error, Result};
use crate::metadata::TopologySnapshot;

// =============================================================================
// Simulated Interface
// =============================================================================

/// A namespace interface that knows its masters and nothing else.
#[derive(Debug)]
pub struct SimulatedInterface {
    namespace_id: NamespaceId,
    generation: u64,
    masters: Vec<(PeerId, KeyRange)>,
    closed: Cell<bool>,
}

impl SimulatedInterface {
    pub fn namespace_id(&self) -> NamespaceId {
        self.namespace_id
    }

    /// Sequence number of the build that produced this interface; a
    /// rebuilt interface always has a higher one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn masters(&self) -> &[(PeerId, KeyRange)] {
        &self.masters
    }

    /// The master serving `key`, if any.
    pub fn route(&self, key: &str) -> Option<PeerId> {
        self.masters
            .iter()
            .find(|(_, range)| range.contains(key))
            .map(|(peer, _)| *peer)
    }

    /// Whether teardown has run.
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

// =============================================================================
// Simulated Factory
// =============================================================================

/// Factory that "connects" to the masters listed in the directory.
#[derive(Debug, Default)]
pub struct SimulatedFactory {
    latency: Duration,
    gate: Option<Arc<Semaphore>>,
    require_masters: bool,
    failures: DashMap<NamespaceId, String>,

    builds_started: AtomicU64,
    builds_completed: AtomicU64,
    cancellations: AtomicU64,
    teardowns: AtomicU64,
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every build.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Hold every build until `gate` has a permit available. Permits are
    /// returned right away, so one permit opens the gate for all builds.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Fail builds for namespaces that have no master in the directory.
    pub fn require_masters(mut self) -> Self {
        self.require_masters = true;
        self
    }

    /// Make every build for `namespace_id` fail with `reason`.
    pub fn fail_namespace(&self, namespace_id: NamespaceId, reason: impl Into<String>) {
        self.failures.insert(namespace_id, reason.into());
    }

    /// Let builds for `namespace_id` succeed again.
    pub fn heal_namespace(&self, namespace_id: &NamespaceId) {
        self.failures.remove(namespace_id);
    }

    pub fn builds_started(&self) -> u64 {
        self.builds_started.load(Ordering::SeqCst)
    }

    pub fn builds_completed(&self) -> u64 {
        self.builds_completed.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> u64 {
        self.cancellations.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> u64 {
        self.teardowns.load(Ordering::SeqCst)
    }

    async fn wait_for_gate(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = gate.acquire() => permit
                .map(drop)
                .map_err(|_| Error::Internal("construction gate closed".to_string())),
        }
    }

    fn cancelled(&self) -> Error {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        Error::Cancelled
    }
}

#[async_trait(?Send)]
impl InterfaceFactory for SimulatedFactory {
    type Interface = SimulatedInterface;

    async fn build(
        &self,
        namespace_id: NamespaceId,
        topology: TopologySnapshot,
        messenger: Arc<dyn Messenger>,
        cancel: CancellationToken,
    ) -> Result<SimulatedInterface> {
        self.builds_started.fetch_add(1, Ordering::SeqCst);
        trace!(namespace = %namespace_id, "Simulated build started");

        match self.wait_for_gate(&cancel).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return Err(self.cancelled()),
            Err(e) => return Err(e),
        }

        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }

        let fail = |reason: String| Error::ConstructionFailed {
            namespace_id,
            reason,
        };

        if let Some(reason) = self.failures.get(&namespace_id) {
            return Err(fail(reason.value().clone()));
        }

        if !topology.namespaces.is_live(&namespace_id) {
            return Err(fail("namespace does not exist".to_string()));
        }

        let masters = topology.directory.masters_of(&namespace_id);
        if masters.is_empty() && self.require_masters {
            return Err(fail("no reachable masters".to_string()));
        }

        let hello = Bytes::from(format!("open {}", namespace_id));
        for (peer, _) in &masters {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            messenger
                .send(*peer, hello.clone())
                .await
                .map_err(|e| fail(e.to_string()))?;
        }

        let generation = self.builds_completed.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            namespace = %namespace_id,
            masters = masters.len(),
            generation,
            "Simulated interface ready"
        );

        Ok(SimulatedInterface {
            namespace_id,
            generation,
            masters,
            closed: Cell::new(false),
        })
    }

    async fn teardown(&self, interface: &SimulatedInterface) {
        interface.closed.set(true);
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        trace!(
            namespace = %interface.namespace_id,
            generation = interface.generation,
            "Simulated interface closed"
        );
    }
}

// =============================================================================
// Loopback Messenger
// =============================================================================

/// Messenger that delivers nothing and records every send.
#[derive(Debug)]
pub struct LoopbackMessenger {
    local: PeerId,
    sent: DashMap<PeerId, u64>,
    unreachable: RwLock<HashSet<PeerId>>,
}

impl LoopbackMessenger {
    pub fn new() -> Self {
        Self::with_peer(PeerId::new_v4())
    }

    pub fn with_peer(local: PeerId) -> Self {
        Self {
            local,
            sent: DashMap::new(),
            unreachable: RwLock::new(HashSet::new()),
        }
    }

    /// Messages sent to `peer` so far.
    pub fn sent_to(&self, peer: &PeerId) -> u64 {
        self.sent.get(peer).map_or(0, |count| *count)
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.iter().map(|count| *count.value()).sum()
    }

    /// Make sends to `peer` fail (or succeed again).
    pub fn set_unreachable(&self, peer: PeerId, unreachable: bool) {
        let mut peers = self.unreachable.write();
        if unreachable {
            peers.insert(peer);
        } else {
            peers.remove(&peer);
        }
    }
}

impl Default for LoopbackMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Messenger for LoopbackMessenger {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn send(&self, peer: PeerId, payload: Bytes) -> Result<()> {
        if self.unreachable.read().contains(&peer) {
            return Err(Error::Messaging(format!("peer {} is unreachable", peer)));
        }

        *self.sent.entry(peer).or_insert(0) += 1;
        trace!(%peer, bytes = payload.len(), "Loopback send");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
