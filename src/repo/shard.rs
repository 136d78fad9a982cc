//! Execution Shards
//!
//! An execution shard is one OS thread driving a current-thread tokio runtime
//! and a `LocalSet`. Everything spawned on it runs cooperatively, so state
//! confined to a shard needs no locks: it is held in `Rc`/`Cell`/`RefCell`,
//! which also keeps it from ever leaving the shard.
//!
//! # Design
//!
//! - [`ShardPool`] starts the shard threads and ships `Send` closures to them
//! - [`ShardCache`] is the per-shard `NamespaceId → CacheEntry` map
//! - [`shard_local`] resolves per-(owner, thread) state, one instance per shard

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::entry::CacheEntry;
use crate::domain::NamespaceId;
use crate::error::{Error, Result};

/// First id handed to threads that were not started by a [`ShardPool`]
const ADHOC_SHARD_BASE: usize = 1 << 16;

static NEXT_ADHOC_SHARD: AtomicUsize = AtomicUsize::new(ADHOC_SHARD_BASE);

thread_local! {
    static CURRENT_SHARD: Cell<Option<ShardId>> = const { Cell::new(None) };
    static SHARD_LOCALS: RefCell<HashMap<Uuid, ShardLocalSlot>> = RefCell::new(HashMap::new());
}

// =============================================================================
// Shard Identity
// =============================================================================

/// Identifier of an execution shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub usize);

impl ShardId {
    /// The shard the calling thread belongs to.
    ///
    /// Pool threads report their pool index; any other thread gets a
    /// process-unique id on first call.
    pub fn current() -> ShardId {
        CURRENT_SHARD.with(|current| match current.get() {
            Some(id) => id,
            None => {
                let id = ShardId(NEXT_ADHOC_SHARD.fetch_add(1, Ordering::Relaxed));
                current.set(Some(id));
                id
            }
        })
    }

    fn enter(id: ShardId) {
        CURRENT_SHARD.with(|current| current.set(Some(id)));
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Shard-Local State
// =============================================================================

struct ShardLocalSlot {
    gate: CancellationToken,
    value: Rc<dyn Any>,
}

/// Per-thread instance of `T` owned by `owner`, created with `init` on first
/// use on each thread.
///
/// Slots whose `gate` has been cancelled are pruned on every call; values
/// still referenced elsewhere stay alive through those references. Returns
/// `None` if `owner` already registered a value of a different type here.
pub(crate) fn shard_local<T: Any>(
    owner: Uuid,
    gate: &CancellationToken,
    init: impl FnOnce() -> T,
) -> Option<Rc<T>> {
    SHARD_LOCALS.with(|locals| {
        let mut locals = locals.borrow_mut();
        locals.retain(|_, slot| !slot.gate.is_cancelled());

        let slot = locals.entry(owner).or_insert_with(|| ShardLocalSlot {
            gate: gate.clone(),
            value: Rc::new(init()),
        });
        Rc::clone(&slot.value).downcast::<T>().ok()
    })
}

// =============================================================================
// Shard Cache
// =============================================================================

/// One shard's map of cache entries.
///
/// Holds at most one entry per namespace. Only the repository inserts and
/// only an entry's own builder removes.
pub struct ShardCache<I: 'static> {
    shard: ShardId,
    entries: RefCell<HashMap<NamespaceId, Rc<CacheEntry<I>>>>,
}

impl<I: 'static> ShardCache<I> {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            entries: RefCell::new(HashMap::new()),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn get(&self, namespace_id: &NamespaceId) -> Option<Rc<CacheEntry<I>>> {
        self.entries.borrow().get(namespace_id).cloned()
    }

    pub fn contains(&self, namespace_id: &NamespaceId) -> bool {
        self.entries.borrow().contains_key(namespace_id)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Namespaces with an entry on this shard.
    pub fn namespaces(&self) -> Vec<NamespaceId> {
        self.entries.borrow().keys().copied().collect()
    }

    /// Insert a freshly created entry.
    ///
    /// # Panics
    ///
    /// Panics if an entry for the namespace already exists.
    pub(crate) fn insert(&self, entry: Rc<CacheEntry<I>>) {
        let namespace_id = entry.namespace_id();
        if self.entries.borrow_mut().insert(namespace_id, entry).is_some() {
            panic!(
                "duplicate cache entry for namespace {} on shard {}",
                namespace_id, self.shard
            );
        }
    }

    /// Remove `entry` if it is the one mapped for its namespace.
    pub(crate) fn remove(&self, entry: &Rc<CacheEntry<I>>) -> bool {
        let mut entries = self.entries.borrow_mut();
        match entries.get(&entry.namespace_id()) {
            Some(current) if Rc::ptr_eq(current, entry) => {
                entries.remove(&entry.namespace_id());
                true
            }
            _ => false,
        }
    }
}

impl<I: 'static> std::fmt::Debug for ShardCache<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCache")
            .field("shard", &self.shard)
            .field("entries", &self.len())
            .finish()
    }
}

// =============================================================================
// Shard Pool
// =============================================================================

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()>>> + Send>;

/// A fixed set of execution shards.
pub struct ShardPool {
    senders: Vec<mpsc::UnboundedSender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl ShardPool {
    /// Start `count` shard threads.
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(Error::Config("shard count must be at least 1".to_string()));
        }

        let mut senders = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);

        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel::<Job>();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            let handle = std::thread::Builder::new()
                .name(format!("shard-{}", index))
                .spawn(move || run_shard(ShardId(index), runtime, rx))?;

            senders.push(tx);
            threads.push(handle);
        }

        info!("Started {} execution shards", count);
        Ok(Self { senders, threads })
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.senders.len()).map(ShardId)
    }

    /// Run `f` on `shard` and return its output.
    ///
    /// `f` itself must be `Send`; the future it builds runs on the shard and
    /// may hold shard-confined state.
    pub async fn run_on<F, Fut, T>(&self, shard: ShardId, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let sender = self
            .senders
            .get(shard.index())
            .ok_or(Error::ShardUnavailable(shard.index()))?;

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = tx.send(f().await);
            })
        });

        sender
            .send(job)
            .map_err(|_| Error::ShardUnavailable(shard.index()))?;
        rx.await.map_err(|_| Error::ShardUnavailable(shard.index()))
    }

    /// Stop accepting work, let every shard finish its tasks, and join the
    /// threads.
    pub async fn shutdown(mut self) -> Result<()> {
        self.senders.clear();
        let threads = std::mem::take(&mut self.threads);

        tokio::task::spawn_blocking(move || {
            for handle in threads {
                if handle.join().is_err() {
                    error!("Execution shard panicked");
                }
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("Failed to join execution shards: {}", e)))?;

        info!("Execution shards stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ShardPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardPool")
            .field("shards", &self.senders.len())
            .finish()
    }
}

fn run_shard(id: ShardId, runtime: tokio::runtime::Runtime, mut jobs: mpsc::UnboundedReceiver<Job>) {
    ShardId::enter(id);
    debug!(shard = %id, "Execution shard started");

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        while let Some(job) = jobs.recv().await {
            tokio::task::spawn_local(job());
        }
    });

    // Drain whatever is still running once the pool stops sending work
    runtime.block_on(local);
    debug!(shard = %id, "Execution shard stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adhoc_shard_id_is_stable_per_thread() {
        let here = ShardId::current();
        assert_eq!(here, ShardId::current());
        assert!(here.index() >= ADHOC_SHARD_BASE);

        let other = std::thread::spawn(ShardId::current).join().unwrap();
        assert_ne!(here, other);
    }

    #[test]
    fn test_shard_local_one_instance_per_owner() {
        let gate = CancellationToken::new();
        let owner = Uuid::new_v4();

        let first = shard_local(owner, &gate, || Cell::new(1u32)).unwrap();
        first.set(7);
        let second = shard_local(owner, &gate, || Cell::new(1u32)).unwrap();
        assert_eq!(second.get(), 7);
        assert!(Rc::ptr_eq(&first, &second));

        // Same owner, different type
        assert!(shard_local(owner, &gate, || String::new()).is_none());
    }

    #[test]
    fn test_shard_local_pruned_after_gate_cancelled() {
        let gate = CancellationToken::new();
        let owner = Uuid::new_v4();

        let first = shard_local(owner, &gate, || Cell::new(1u32)).unwrap();
        first.set(7);
        gate.cancel();

        let fresh_gate = CancellationToken::new();
        let second = shard_local(owner, &fresh_gate, || Cell::new(1u32)).unwrap();
        assert_eq!(second.get(), 1);
        assert_eq!(first.get(), 7);
    }

    #[test]
    fn test_shard_cache_remove_only_matching_entry() {
        let cache: ShardCache<u32> = ShardCache::new(ShardId(0));
        let ns = NamespaceId::new_v4();
        let entry = Rc::new(CacheEntry::new(ns, ShardId(0)));
        let stranger = Rc::new(CacheEntry::new(ns, ShardId(0)));

        cache.insert(Rc::clone(&entry));
        assert!(cache.contains(&ns));
        assert!(!cache.remove(&stranger));
        assert_eq!(cache.len(), 1);
        assert!(cache.remove(&entry));
        assert!(cache.is_empty());
        assert!(!cache.remove(&entry));
    }

    #[tokio::test]
    async fn test_pool_runs_on_requested_shard() {
        let pool = ShardPool::new(3).unwrap();
        assert_eq!(pool.shard_count(), 3);

        for shard in pool.shards().collect::<Vec<_>>() {
            let seen = pool.run_on(shard, || async { ShardId::current() }).await.unwrap();
            assert_eq!(seen, shard);
        }

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_runs_non_send_futures() {
        let pool = ShardPool::new(1).unwrap();

        let total = pool
            .run_on(ShardId(0), || async {
                let counter = Rc::new(Cell::new(0));
                let inner = Rc::clone(&counter);
                tokio::task::spawn_local(async move { inner.set(inner.get() + 41) })
                    .await
                    .unwrap();
                counter.get() + 1
            })
            .await
            .unwrap();
        assert_eq!(total, 42);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_rejects_unknown_shard() {
        let pool = ShardPool::new(1).unwrap();
        let result = pool.run_on(ShardId(5), || async {}).await;
        assert!(matches!(result, Err(Error::ShardUnavailable(5))));
        pool.shutdown().await.unwrap();
    }

    #[test]
    fn test_pool_rejects_zero_shards() {
        assert!(matches!(ShardPool::new(0), Err(Error::Config(_))));
    }
}
