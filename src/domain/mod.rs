//! Domain Layer
//!
//! Value objects the repository is keyed by, the ports for its external
//! collaborators, and the events it emits.
//!
//! # Usage
//!
//! ```ignore
//! use nsrepo::domain::{InterfaceFactory, Messenger, NamespaceId};
//!
//! // Factories are injected into the repository as trait implementations
//! let repo = NamespaceRepo::new(factory, metadata, messenger);
//! ```

pub mod events;
pub mod ports;

pub use events::RepoEvent;
pub use ports::{EventPublisher, InterfaceFactory, KeyRange, Messenger, NamespaceId, PeerId};
