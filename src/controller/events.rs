//! Status/event sink
//!
//! Reconcilers report progress as [`Event`]s. Emission is fire-and-forget: a
//! sink must never block or fail the pass.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::tags::ResourceKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventLevel {
    Progress,
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventLevel::Progress => "progress",
            EventLevel::Info => "info",
            EventLevel::Success => "success",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub level: EventLevel,
    pub resource: ResourceKind,
    /// Verb such as "create", "update", "wait", "delete"
    pub action: String,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        level: EventLevel,
        resource: ResourceKind,
        action: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            resource,
            action: action.into(),
            message: message.into(),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Logs every event through `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let resource = event.resource.as_str();
        let action = event.action.as_str();
        let metadata = if event.metadata.is_empty() {
            String::new()
        } else {
            format!("{:?}", event.metadata)
        };
        match event.level {
            EventLevel::Progress => debug!(resource, action, %metadata, "{}", event.message),
            EventLevel::Info | EventLevel::Success => {
                info!(resource, action, level = %event.level, %metadata, "{}", event.message)
            }
            EventLevel::Warning => warn!(resource, action, %metadata, "{}", event.message),
            EventLevel::Error => error!(resource, action, %metadata, "{}", event.message),
        }
    }
}

/// Drops everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, level: EventLevel) -> usize {
        self.events().iter().filter(|e| e.level == level).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(Event::new(EventLevel::Progress, ResourceKind::Vpc, "create", "Creating network"));
        sink.emit(
            Event::new(EventLevel::Success, ResourceKind::Vpc, "create", "Network created")
                .with("id", "vpc-1"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].metadata.get("id").unwrap(), "vpc-1");
        assert_eq!(sink.count(EventLevel::Success), 1);
        assert_eq!(sink.count(EventLevel::Error), 0);
    }
}
