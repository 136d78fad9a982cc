//! Cache Entry and Teardown Interlock
//!
//! A [`CacheEntry`] is the per-(shard, namespace) record shared by every
//! access handle for that namespace on that shard. It lives only on its
//! shard: every field is a `Cell`/`RefCell`/`OnceCell` and entries are only
//! reachable through `Rc`, so the type system keeps it there.
//!
//! # Interlock
//!
//! ```text
//!   acquire ──► ref_count += 1 ──(0→1)──► fire nonzero signal (if installed)
//!   release ──► ref_count -= 1 ──(1→0)──► fire zero signal    (if installed)
//! ```
//!
//! The builder installs at most one signal at a time, and only right before
//! it suspends. Neither `acquire` nor `release` suspends, so the builder
//! always observes a count that is consistent with every handle alive at its
//! wake-up.

use std::cell::{Cell, OnceCell, RefCell};

use tokio::sync::{oneshot, Notify};

use super::shard::ShardId;
use crate::domain::NamespaceId;
use crate::error::{Error, Result};

/// Lifecycle state of a cache entry, driven by its builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// The factory is building the interface
    Constructing,
    /// The interface is published and has at least one user
    Live,
    /// The count reached zero; teardown is pending
    DrainPending,
    /// Removed from the shard map; the interface is (being) torn down
    TornDown,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Constructing => write!(f, "constructing"),
            EntryState::Live => write!(f, "live"),
            EntryState::DrainPending => write!(f, "drain-pending"),
            EntryState::TornDown => write!(f, "torn-down"),
        }
    }
}

/// Why an entry never produced an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BuildFailure {
    /// The factory reported an error
    Failed(String),
    /// Construction was cancelled by repository shutdown
    Cancelled,
}

impl BuildFailure {
    fn to_error(&self, namespace_id: NamespaceId) -> Error {
        match self {
            BuildFailure::Failed(reason) => Error::ConstructionFailed {
                namespace_id,
                reason: reason.clone(),
            },
            BuildFailure::Cancelled => Error::Cancelled,
        }
    }
}

impl std::fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildFailure::Failed(reason) => write!(f, "{}", reason),
            BuildFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-(shard, namespace) cache record.
pub struct CacheEntry<I> {
    namespace_id: NamespaceId,
    shard: ShardId,

    /// Written once by the builder
    slot: OnceCell<std::result::Result<I, BuildFailure>>,
    published: Notify,

    ref_count: Cell<usize>,
    state: Cell<EntryState>,

    /// Installed only while the builder waits for the count to reach zero
    zero_signal: RefCell<Option<oneshot::Sender<()>>>,
    /// Installed only while the builder waits for the count to leave zero
    nonzero_signal: RefCell<Option<oneshot::Sender<()>>>,
}

impl<I> CacheEntry<I> {
    pub(crate) fn new(namespace_id: NamespaceId, shard: ShardId) -> Self {
        Self {
            namespace_id,
            shard,
            slot: OnceCell::new(),
            published: Notify::new(),
            ref_count: Cell::new(0),
            state: Cell::new(EntryState::Constructing),
            zero_signal: RefCell::new(None),
            nonzero_signal: RefCell::new(None),
        }
    }

    pub fn namespace_id(&self) -> NamespaceId {
        self.namespace_id
    }

    /// The shard this entry is confined to.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Number of live access handles.
    pub fn ref_count(&self) -> usize {
        self.ref_count.get()
    }

    pub fn state(&self) -> EntryState {
        self.state.get()
    }

    /// Whether construction has finished, successfully or not.
    pub fn is_published(&self) -> bool {
        self.slot.get().is_some()
    }

    // =========================================================================
    // Reference Counting
    // =========================================================================

    /// Record one more handle. Returns `true` on the 0→1 transition.
    pub(crate) fn acquire(&self) -> bool {
        let count = self.ref_count.get() + 1;
        self.ref_count.set(count);

        if count == 1 {
            if let Some(signal) = self.nonzero_signal.borrow_mut().take() {
                let _ = signal.send(());
            }
            return true;
        }
        false
    }

    /// Record one fewer handle.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero; that means a handle was released
    /// twice and the protocol is broken.
    pub(crate) fn release(&self) {
        let count = match self.ref_count.get().checked_sub(1) {
            Some(count) => count,
            None => panic!(
                "reference count underflow for namespace {} on shard {}",
                self.namespace_id, self.shard
            ),
        };
        self.ref_count.set(count);

        if count == 0 {
            if let Some(signal) = self.zero_signal.borrow_mut().take() {
                let _ = signal.send(());
            }
        }
    }

    // =========================================================================
    // Interface Slot
    // =========================================================================

    /// Publish the construction outcome and wake every waiter.
    ///
    /// # Panics
    ///
    /// Panics if the slot was already written.
    pub(crate) fn publish(&self, outcome: std::result::Result<I, BuildFailure>) {
        if self.slot.set(outcome).is_err() {
            panic!(
                "interface for namespace {} published twice on shard {}",
                self.namespace_id, self.shard
            );
        }
        self.published.notify_waiters();
    }

    /// Wait for construction to finish and borrow the interface.
    ///
    /// Every concurrent caller observes the same interface or the same
    /// failure. Cancelling the wait has no effect on construction.
    pub async fn resolve(&self) -> Result<&I> {
        loop {
            // Register before checking so a publish in between is not missed
            let notified = self.published.notified();

            if let Some(outcome) = self.slot.get() {
                return match outcome {
                    Ok(_) if self.state.get() == EntryState::TornDown => Err(Error::RepoShuttingDown),
                    Ok(interface) => Ok(interface),
                    Err(failure) => Err(failure.to_error(self.namespace_id)),
                };
            }

            notified.await;
        }
    }

    /// The built interface, regardless of state. Used for teardown.
    pub(crate) fn built_interface(&self) -> Option<&I> {
        match self.slot.get() {
            Some(Ok(interface)) => Some(interface),
            _ => None,
        }
    }

    pub(crate) fn set_state(&self, state: EntryState) {
        self.state.set(state);
    }

    // =========================================================================
    // Builder Signals
    // =========================================================================

    /// Install the zero signal, unless the count is already zero.
    pub(crate) fn wait_for_zero(&self) -> Option<oneshot::Receiver<()>> {
        if self.ref_count.get() == 0 {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *self.zero_signal.borrow_mut() = Some(tx);
        Some(rx)
    }

    /// Install the nonzero signal, unless the count is already non-zero.
    pub(crate) fn wait_for_nonzero(&self) -> Option<oneshot::Receiver<()>> {
        if self.ref_count.get() != 0 {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *self.nonzero_signal.borrow_mut() = Some(tx);
        Some(rx)
    }

    /// Drop any installed signal after the builder stopped waiting on it.
    pub(crate) fn clear_signals(&self) {
        self.zero_signal.borrow_mut().take();
        self.nonzero_signal.borrow_mut().take();
    }

    #[cfg(test)]
    pub(crate) fn has_zero_signal(&self) -> bool {
        self.zero_signal.borrow().is_some()
    }

    #[cfg(test)]
    pub(crate) fn has_nonzero_signal(&self) -> bool {
        self.nonzero_signal.borrow().is_some()
    }
}

impl<I> std::fmt::Debug for CacheEntry<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("namespace_id", &self.namespace_id)
            .field("shard", &self.shard)
            .field("ref_count", &self.ref_count.get())
            .field("state", &self.state.get())
            .field("published", &self.is_published())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::rc::Rc;
    use tokio_test::{assert_pending, assert_ready, task};

    fn entry() -> CacheEntry<&'static str> {
        CacheEntry::new(NamespaceId::new_v4(), ShardId(0))
    }

    #[test]
    fn test_new_entry_state() {
        let entry = entry();
        assert_eq!(entry.ref_count(), 0);
        assert_eq!(entry.state(), EntryState::Constructing);
        assert!(!entry.is_published());
        assert!(entry.built_interface().is_none());
    }

    #[test]
    fn test_acquire_reports_first_reference() {
        let entry = entry();
        assert!(entry.acquire());
        assert!(!entry.acquire());
        entry.release();
        entry.release();
        assert!(entry.acquire());
        assert_eq!(entry.ref_count(), 1);
    }

    #[test]
    #[should_panic(expected = "reference count underflow")]
    fn test_release_below_zero_panics() {
        entry().release();
    }

    #[test]
    #[should_panic(expected = "published twice")]
    fn test_double_publish_panics() {
        let entry = entry();
        entry.publish(Ok("a"));
        entry.publish(Ok("b"));
    }

    #[test]
    fn test_zero_signal_fires_on_last_release() {
        let entry = entry();
        entry.acquire();
        entry.acquire();

        let mut zero = entry.wait_for_zero().unwrap();
        assert!(entry.has_zero_signal());

        entry.release();
        assert_matches!(zero.try_recv(), Err(oneshot::error::TryRecvError::Empty));

        entry.release();
        assert_matches!(zero.try_recv(), Ok(()));
        assert!(!entry.has_zero_signal());
    }

    #[test]
    fn test_zero_signal_not_installed_when_already_zero() {
        let entry = entry();
        assert!(entry.wait_for_zero().is_none());
        assert!(!entry.has_zero_signal());
    }

    #[test]
    fn test_nonzero_signal_fires_on_revival() {
        let entry = entry();
        let mut nonzero = entry.wait_for_nonzero().unwrap();
        assert!(entry.has_nonzero_signal());

        entry.acquire();
        assert_matches!(nonzero.try_recv(), Ok(()));
        assert!(!entry.has_nonzero_signal());

        // Already non-zero: nothing to wait for
        assert!(entry.wait_for_nonzero().is_none());
    }

    #[test]
    fn test_clear_signals() {
        let entry = entry();
        let _nonzero = entry.wait_for_nonzero();
        entry.clear_signals();
        assert!(!entry.has_nonzero_signal());
        assert!(!entry.has_zero_signal());
    }

    #[test]
    fn test_resolve_waits_for_publish() {
        let entry = Rc::new(entry());

        let mut first = task::spawn(entry.resolve());
        let mut second = task::spawn(entry.resolve());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        entry.publish(Ok("iface"));
        assert!(first.is_woken());
        assert!(second.is_woken());

        assert_eq!(*assert_ready!(first.poll()).unwrap(), "iface");
        assert_eq!(*assert_ready!(second.poll()).unwrap(), "iface");
    }

    #[test]
    fn test_resolve_surfaces_failure_to_every_waiter() {
        let entry = entry();
        let ns = entry.namespace_id();

        let mut waiter = task::spawn(entry.resolve());
        assert_pending!(waiter.poll());

        entry.publish(Err(BuildFailure::Failed("no reachable shard owners".to_string())));

        assert_matches!(
            assert_ready!(waiter.poll()),
            Err(Error::ConstructionFailed { namespace_id, reason })
                if namespace_id == ns && reason == "no reachable shard owners"
        );
        drop(waiter);

        let mut late = task::spawn(entry.resolve());
        assert_matches!(assert_ready!(late.poll()), Err(Error::ConstructionFailed { .. }));
    }

    #[test]
    fn test_resolve_cancelled_build() {
        let entry = entry();
        entry.publish(Err(BuildFailure::Cancelled));
        let mut waiter = task::spawn(entry.resolve());
        assert_matches!(assert_ready!(waiter.poll()), Err(Error::Cancelled));
    }

    #[test]
    fn test_resolve_after_forced_teardown() {
        let entry = entry();
        entry.publish(Ok("iface"));
        entry.set_state(EntryState::TornDown);

        let mut waiter = task::spawn(entry.resolve());
        assert_matches!(assert_ready!(waiter.poll()), Err(Error::RepoShuttingDown));
        drop(waiter);
        assert_eq!(entry.built_interface(), Some(&"iface"));
    }

    proptest! {
        /// The count always equals acquires minus releases and never goes
        /// negative; releases are only issued while the count is positive.
        #[test]
        fn prop_ref_count_tracks_balance(ops in prop::collection::vec(any::<bool>(), 0..200)) {
            let entry = entry();
            let mut expected: usize = 0;

            for acquire in ops {
                if acquire {
                    let first = entry.acquire();
                    prop_assert_eq!(first, expected == 0);
                    expected += 1;
                } else if expected > 0 {
                    entry.release();
                    expected -= 1;
                }
                prop_assert_eq!(entry.ref_count(), expected);
            }
        }

        /// Exactly the releases that bring the count to zero fire the signal.
        #[test]
        fn prop_zero_signal_fires_only_at_zero(start in 1usize..20, drops in 0usize..20) {
            let entry = entry();
            for _ in 0..start {
                entry.acquire();
            }
            let mut zero = entry.wait_for_zero().unwrap();

            let drops = drops.min(start);
            for _ in 0..drops {
                entry.release();
            }

            let fired = zero.try_recv().is_ok();
            prop_assert_eq!(fired, drops == start);
        }
    }
}
