//! Per-pass reconcile context
//!
//! Carries everything a reconciler needs besides the cloud handle: engine
//! settings, the event sink, the change summary and (optionally) metrics.
//! A fresh context is built for every pass.

use std::sync::Arc;

use super::events::{Event, EventLevel, EventSink, NullSink};
#[cfg(feature = "metrics")]
use super::metrics::Metrics;
use super::summary::{Change, Summary};
use crate::config::{EngineSettings, Timeouts};
use crate::tags::ResourceKind;

pub struct ReconcileContext {
    pub settings: EngineSettings,
    events: Arc<dyn EventSink>,
    summary: Summary,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl ReconcileContext {
    pub fn new(settings: EngineSettings, events: Arc<dyn EventSink>) -> Self {
        Self {
            settings,
            events,
            summary: Summary::default(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.settings.timeouts
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_deref()
    }

    pub fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    pub fn progress(&self, resource: ResourceKind, action: &str, message: impl Into<String>) {
        self.emit(Event::new(EventLevel::Progress, resource, action, message));
    }

    pub fn warning(&self, resource: ResourceKind, action: &str, message: impl Into<String>) {
        self.emit(Event::new(EventLevel::Warning, resource, action, message));
    }

    /// Record the outcome for one resource: summary, mutation counter and event
    pub fn record(&self, resource: ResourceKind, name: &str, change: Change) {
        self.summary.record(resource, name, change);

        if change.is_mutation() {
            self.count_mutation(resource, change);
        }

        let level = match change {
            Change::Failed => EventLevel::Error,
            Change::Unchanged => EventLevel::Info,
            _ => EventLevel::Success,
        };
        self.emit(
            Event::new(level, resource, change.as_str(), format!("{resource} {name} {change}"))
                .with("name", name),
        );
    }

    #[cfg(feature = "metrics")]
    fn count_mutation(&self, resource: ResourceKind, change: Change) {
        if let Some(metrics) = self.metrics() {
            metrics.inc_mutation(resource.as_str(), change.as_str());
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn count_mutation(&self, _resource: ResourceKind, _change: Change) {}
}

impl Default for ReconcileContext {
    fn default() -> Self {
        Self::new(EngineSettings::default(), Arc::new(NullSink))
    }
}
