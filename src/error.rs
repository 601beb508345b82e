//! Error types for eksforge
//!
//! Every failure the reconciliation engine can surface is a variant of [`Error`].
//! Variants carry enough context (resource, field, pool name) for an operator to
//! act on the message without reading logs.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::cloud::{CloudError, CloudErrorKind};
use crate::controller::upgrade::UpgradeRejection;

/// A single node pool that failed during a multi-pool reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolFailure {
    /// Logical pool name (the key in the desired node-pool map)
    pub pool: String,
    /// What was being attempted: "create", "update" or "delete"
    pub action: String,
    /// Rendered cause
    pub cause: String,
}

impl fmt::Display for PoolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.pool, self.action, self.cause)
    }
}

fn render_failures(failures: &[PoolFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("  - {failure}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Error, Debug)]
pub enum Error {
    /// The desired configuration is invalid. Detected before any API call.
    #[error("configuration error in {field}: {message}")]
    Configuration { field: String, message: String },

    /// Configuration file could not be read or parsed
    #[error("config error: {0}")]
    ConfigError(String),

    /// A live resource differs from the desired state on a field that cannot change in place
    #[error(
        "immutable field {field} on {resource} cannot change from {current:?} to {desired:?}: \
         manual recreation required (destroy and recreate the {resource})"
    )]
    ImmutableField {
        resource: String,
        field: String,
        current: String,
        desired: String,
    },

    /// Requested version change does not follow the one-minor-at-a-time rule
    #[error("cannot upgrade from {current} to {desired}: {reason}")]
    UpgradePath {
        current: String,
        desired: String,
        reason: UpgradeRejection,
    },

    /// A blocking wait exceeded its bound
    #[error("timed out after {timeout:?} waiting for {resource}")]
    ProvisioningTimeout { resource: String, timeout: Duration },

    /// The provider reports the resource in a terminal failure state
    #[error("{resource} entered failed state {status}: {reason}")]
    ResourceFailed {
        resource: String,
        status: String,
        reason: String,
    },

    /// Discovery found something that violates the ownership invariants
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Error surfaced from the cloud API boundary
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// One or more node pools failed; the others were applied
    #[error("{} node pool(s) failed:\n{}", .0.len(), render_failures(.0))]
    PartialFailure(Vec<PoolFailure>),

    /// The whole reconcile pass exceeded its deadline
    #[error("reconcile deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn immutable(
        resource: impl Into<String>,
        field: impl Into<String>,
        current: impl fmt::Display,
        desired: impl fmt::Display,
    ) -> Self {
        Error::ImmutableField {
            resource: resource.into(),
            field: field.into(),
            current: current.to_string(),
            desired: desired.to_string(),
        }
    }

    /// Whether re-running the reconcile later can plausibly succeed without a config change
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::ProvisioningTimeout { .. }
            | Error::DeadlineExceeded(_)
            | Error::PartialFailure(_) => true,
            Error::Cloud(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Short label for metrics and event metadata
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration { .. } | Error::ConfigError(_) => "configuration",
            Error::ImmutableField { .. } => "immutable_field",
            Error::UpgradePath { .. } => "upgrade_path",
            Error::ProvisioningTimeout { .. } => "timeout",
            Error::ResourceFailed { .. } => "resource_failed",
            Error::Discovery(_) => "discovery",
            Error::Cloud(e) if e.kind == CloudErrorKind::Throttled => "throttled",
            Error::Cloud(_) => "cloud",
            Error::PartialFailure(_) => "partial_failure",
            Error::DeadlineExceeded(_) => "deadline",
            Error::Io(_) | Error::Yaml(_) | Error::Toml(_) | Error::Json(_) => "io",
        }
    }

    /// Failed pools when this is a partial failure
    pub fn failed_pools(&self) -> Vec<&str> {
        match self {
            Error::PartialFailure(failures) => failures.iter().map(|f| f.pool.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_error_carries_remediation() {
        let err = Error::immutable("node pool general", "instance type", "m5.large", "m5.xlarge");
        let msg = err.to_string();
        assert!(msg.contains("manual recreation required"));
        assert!(msg.contains("destroy and recreate"));
        assert!(!err.is_retriable());
    }

    #[test]
    fn partial_failure_lists_every_pool() {
        let err = Error::PartialFailure(vec![
            PoolFailure {
                pool: "gpu".to_string(),
                action: "create".to_string(),
                cause: "quota exceeded".to_string(),
            },
            PoolFailure {
                pool: "old".to_string(),
                action: "delete".to_string(),
                cause: "timed out".to_string(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 node pool(s) failed"));
        assert!(msg.contains("gpu (create): quota exceeded"));
        assert!(msg.contains("old (delete): timed out"));
        assert_eq!(err.failed_pools(), vec!["gpu", "old"]);
        assert!(err.is_retriable());
    }

    #[test]
    fn throttling_is_retriable() {
        let err = Error::from(CloudError::new(
            CloudErrorKind::Throttled,
            "CreateNodegroup",
            "rate exceeded",
        ));
        assert!(err.is_retriable());
        assert_eq!(err.kind(), "throttled");
    }
}
