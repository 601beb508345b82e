//! eksforge: stateless reconciliation engine for managed Kubernetes infrastructure
//!
//! Given a desired cluster spec, eksforge discovers what already exists in the
//! provider through ownership tags, computes the difference and issues the
//! minimal set of mutations: network topology, identity roles, the control
//! plane and its node pools. Nothing is cached between passes; the provider
//! is the only source of truth.

pub mod cloud;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod state;
pub mod tags;
pub mod telemetry;

pub use crate::config::{ClusterConfig, EngineSettings, NodePoolSpec};
pub use crate::controller::{ReconcileReport, Reconciler};
pub use crate::error::{Error, Result};
