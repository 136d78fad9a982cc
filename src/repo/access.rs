//! Namespace Access Handles
//!
//! [`NamespaceAccess`] is what query code holds while it talks to a
//! namespace. Each live handle is exactly one reference on its cache entry:
//! construction and `clone` acquire, `drop` releases, on every exit path
//! including cancellation and dropped futures.

use std::rc::Rc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::entry::CacheEntry;
use super::shard::ShardId;
use crate::domain::NamespaceId;
use crate::error::{Error, Result};

/// The capability to hand out cache entries for namespaces.
///
/// Access handles only depend on this trait, so caching strategies can vary
/// while the reference counting and teardown protocol stays the same.
pub trait EntryProvider {
    /// Interface type stored in the entries.
    type Interface: 'static;

    /// Return the entry for `namespace_id` on the calling shard, creating it
    /// (and starting its construction) if there is none.
    fn cache_entry(&self, namespace_id: NamespaceId) -> Result<Rc<CacheEntry<Self::Interface>>>;
}

impl<P: EntryProvider + ?Sized> EntryProvider for std::sync::Arc<P> {
    type Interface = P::Interface;

    fn cache_entry(&self, namespace_id: NamespaceId) -> Result<Rc<CacheEntry<Self::Interface>>> {
        (**self).cache_entry(namespace_id)
    }
}

// =============================================================================
// Reference Guard
// =============================================================================

/// One counted reference on a cache entry.
struct EntryRef<I: 'static> {
    entry: Rc<CacheEntry<I>>,
}

impl<I: 'static> EntryRef<I> {
    fn acquire(entry: Rc<CacheEntry<I>>) -> Self {
        entry.acquire();
        Self { entry }
    }
}

impl<I: 'static> Clone for EntryRef<I> {
    fn clone(&self) -> Self {
        Self::acquire(Rc::clone(&self.entry))
    }
}

impl<I: 'static> Drop for EntryRef<I> {
    fn drop(&mut self) {
        self.entry.release();
    }
}

// =============================================================================
// Access Handle
// =============================================================================

/// A counted handle on a namespace's cached interface.
///
/// The default value is an empty handle that refers to nothing. Handles are
/// `!Send`: they stay on the shard that resolved them.
pub struct NamespaceAccess<I: 'static> {
    entry: Option<EntryRef<I>>,
}

impl<I: 'static> NamespaceAccess<I> {
    /// Resolve the interface for `namespace_id` on the calling shard.
    ///
    /// Waits for construction if it is still in flight. If `cancel` fires
    /// first, or construction fails, the reference taken here is released
    /// before the error is returned.
    pub async fn new<P>(provider: &P, namespace_id: NamespaceId, cancel: &CancellationToken) -> Result<Self>
    where
        P: EntryProvider<Interface = I> + ?Sized,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let entry = EntryRef::acquire(provider.cache_entry(namespace_id)?);
        trace!(
            namespace = %namespace_id,
            refs = entry.entry.ref_count(),
            "Acquired namespace access"
        );

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = entry.entry.resolve() => outcome.map(|_| ()),
        };
        resolved?;

        Ok(Self { entry: Some(entry) })
    }

    /// Borrow the interface.
    ///
    /// Fails for an empty handle, and once shutdown has forcibly torn the
    /// interface down.
    pub async fn namespace_if(&self) -> Result<&I> {
        match &self.entry {
            Some(entry) => entry.entry.resolve().await,
            None => Err(Error::EmptyAccess),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    pub fn namespace_id(&self) -> Option<NamespaceId> {
        self.entry.as_ref().map(|e| e.entry.namespace_id())
    }

    /// The shard this handle was resolved on.
    pub fn shard(&self) -> Option<ShardId> {
        self.entry.as_ref().map(|e| e.entry.shard())
    }

    /// The underlying entry, for inspection.
    pub fn entry(&self) -> Option<&Rc<CacheEntry<I>>> {
        self.entry.as_ref().map(|e| &e.entry)
    }

    /// Release the reference now, leaving an empty handle.
    pub fn reset(&mut self) {
        self.entry = None;
    }
}

impl<I: 'static> Default for NamespaceAccess<I> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<I: 'static> Clone for NamespaceAccess<I> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl<I: 'static> std::fmt::Debug for NamespaceAccess<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceAccess")
            .field("entry", &self.entry.as_ref().map(|e| &e.entry))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
