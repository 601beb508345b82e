//! Reconcilers for the managed cluster stack
//!
//! Every reconciler follows the same shape: take the desired spec and the
//! discovered actual state, issue the minimal mutations, wait for the
//! provider to settle, and let the caller re-discover.

pub mod cidr;
pub mod cluster;
mod context;
pub mod events;
pub mod iam;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod nodepool;
#[cfg(test)]
mod nodepool_test;
mod reconciler;
pub mod summary;
pub mod topology;
#[cfg(test)]
mod topology_test;
pub mod upgrade;
pub mod waiter;

pub use context::ReconcileContext;
pub use events::{Event, EventLevel, EventSink, MemorySink, NullSink, TracingSink};
pub use nodepool::{PoolAction, PoolOutcome};
pub use reconciler::{Operation, ReconcileReport, Reconciler};
pub use summary::{Change, Summary, SummaryEntry};
pub use upgrade::{validate_upgrade, UpgradeRejection};
