//! Namespace Repository
//!
//! Per-shard, reference-counted cache of namespace interfaces.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        NamespaceRepo                            │
//! │   factory │ metadata view │ messenger │ shutdown gate │ metrics │
//! └────────────────────────────────────────────────────────────────┘
//!          │                    │                    │
//!          ▼                    ▼                    ▼
//! ┌────────────────┐   ┌────────────────┐   ┌────────────────┐
//! │  ShardCache 0  │   │  ShardCache 1  │   │  ShardCache N  │
//! │  ns → entry    │   │  ns → entry    │   │  ns → entry    │
//! └────────────────┘   └────────────────┘   └────────────────┘
//!          │
//!          ▼
//! ┌──────────────────────────────────────────────┐
//! │ CacheEntry ◄── NamespaceAccess (one ref each) │
//! │     ▲                                         │
//! │     └── builder task: build, wait, teardown   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let repo = Arc::new(NamespaceRepo::new(factory, metadata, messenger));
//!
//! pool.run_on(shard, move || async move {
//!     let access = NamespaceAccess::new(&repo, namespace_id, &cancel).await?;
//!     let interface = access.namespace_if().await?;
//!     interface.read(key).await
//! }).await??;
//! ```

mod access;
mod builder;
mod entry;
mod metrics;
mod repository;
mod shard;

pub use access::{EntryProvider, NamespaceAccess};
pub use entry::{CacheEntry, EntryState};
pub use metrics::{MetricsSnapshot, RepoMetrics};
pub use repository::{NamespaceRepo, RepoBuilder, RepoConfig};
pub use shard::{ShardCache, ShardId, ShardPool};
