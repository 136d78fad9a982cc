//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  InterfaceFactory │ Messenger │ EventPublisher              │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ SimulatedFactory │ LoopbackMessenger                        │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector              │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nsrepo::adapters::{LoopbackMessenger, SimulatedFactory};
//! use nsrepo::repo::NamespaceRepo;
//!
//! let factory = SimulatedFactory::new().with_latency(Duration::from_millis(5));
//! let repo = NamespaceRepo::new(factory, metadata, Arc::new(LoopbackMessenger::new()));
//! ```

mod event_publisher;
mod simulated;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use simulated::{LoopbackMessenger, SimulatedFactory, SimulatedInterface};
