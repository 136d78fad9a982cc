//! Event Publisher Adapter
//!
//! Implements the `EventPublisher` port with various backends.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::events::RepoEvent;
use crate::domain::ports::{EventPublisher, NamespaceId};
use crate::error::Result;

/// Logging-based event publisher.
///
/// Publishes repository events to the tracing system, as one JSON line each.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a publisher that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a publisher that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: RepoEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event)?;

        if self.info_level {
            info!(event_type = %event_type, event = %json, "Repository event");
        } else {
            debug!(event_type = %event_type, event = %json, "Repository event");
        }

        Ok(())
    }
}

/// In-memory event collector for testing.
///
/// Collects events in memory for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<RepoEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events, in publication order.
    pub fn events(&self) -> Vec<RepoEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<RepoEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Get events concerning one namespace.
    pub fn events_for(&self, namespace_id: NamespaceId) -> Vec<RepoEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.namespace_id() == Some(namespace_id))
            .cloned()
            .collect()
    }

    /// Number of events of a specific type.
    pub fn count_of_type(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: RepoEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<RepoEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}
