//! nsrepo - Namespace Interface Repository
//!
//! Per-shard, reference-counted caching of namespace (table) interfaces for a
//! clustered database node. Query code asks for a namespace's interface; the
//! repository builds it at most once per shard, shares it between every
//! concurrent user on that shard, and tears it down once nobody uses it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Namespace Repository                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Metadata   │───▶│  Shard Cache │───▶│   Builder    │       │
//! │  │    Views     │    │  (per shard) │    │  (per entry) │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Simulated factory/messenger and event publishers
//! - [`domain`] - Identifiers, ports and events
//! - [`error`] - Error types
//! - [`metadata`] - Namespaces and directory views, routing table
//! - [`repo`] - The cache itself: shards, entries, access handles

pub mod adapters;
pub mod domain;
pub mod error;
pub mod metadata;
pub mod repo;

// Re-export commonly used types
pub use domain::{EventPublisher, InterfaceFactory, KeyRange, Messenger, NamespaceId, PeerId, RepoEvent};
pub use error::{Error, Result};
pub use metadata::{MetadataPublisher, MetadataView, TopologySnapshot};
pub use repo::{NamespaceAccess, NamespaceRepo, RepoConfig, ShardId, ShardPool};
