//! Engine settings: deadlines, wait bounds and fan-out
//!
//! The defaults encode the provider's operational SLAs. Config files may
//! override any of them (in seconds), which is how tests and simulations get
//! fast waits.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Overall bound on a single reconcile or destroy pass
pub const RECONCILE_DEADLINE: Duration = Duration::from_secs(90 * 60);
/// NAT gateways usually become available in 1-3 minutes
pub const NAT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const VPC_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const CLUSTER_CREATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const CLUSTER_UPDATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const CLUSTER_DELETE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const NODE_POOL_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const NODE_POOL_DELETE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_PARALLEL_POOLS: usize = 4;
pub const DEFAULT_ZONE_COUNT: usize = 3;
/// The control plane needs subnets in at least two zones
pub const MIN_ZONE_COUNT: usize = 2;

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Per-wait bounds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub nat_gateway: Duration,
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub vpc_endpoint: Duration,
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub cluster_create: Duration,
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub cluster_update: Duration,
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub cluster_delete: Duration,
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub node_pool: Duration,
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub node_pool_delete: Duration,
    /// Interval between status polls
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            nat_gateway: NAT_GATEWAY_TIMEOUT,
            vpc_endpoint: VPC_ENDPOINT_TIMEOUT,
            cluster_create: CLUSTER_CREATE_TIMEOUT,
            cluster_update: CLUSTER_UPDATE_TIMEOUT,
            cluster_delete: CLUSTER_DELETE_TIMEOUT,
            node_pool: NODE_POOL_TIMEOUT,
            node_pool_delete: NODE_POOL_DELETE_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl Timeouts {
    /// Every bound set to `bound`, polling every `poll` (used by simulations)
    pub fn uniform(bound: Duration, poll: Duration) -> Self {
        Self {
            nat_gateway: bound,
            vpc_endpoint: bound,
            cluster_create: bound,
            cluster_update: bound,
            cluster_delete: bound,
            node_pool: bound,
            node_pool_delete: bound,
            poll_interval: poll,
        }
    }
}

/// Tunables for the reconciliation engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Overall bound on a reconcile pass, in seconds
    #[serde(with = "duration_secs")]
    #[schemars(with = "u64")]
    pub deadline: Duration,
    pub timeouts: Timeouts,
    /// Maximum node-pool operations in flight at once
    pub max_parallel_pools: usize,
    /// Zones used when `availabilityZones` is `auto`
    pub default_zone_count: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            deadline: RECONCILE_DEADLINE,
            timeouts: Timeouts::default(),
            max_parallel_pools: DEFAULT_MAX_PARALLEL_POOLS,
            default_zone_count: DEFAULT_ZONE_COUNT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operational_slas() {
        let t = Timeouts::default();
        assert_eq!(t.nat_gateway, Duration::from_secs(600));
        assert_eq!(t.node_pool, Duration::from_secs(900));
        assert_eq!(t.cluster_create, Duration::from_secs(1200));
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let settings: EngineSettings = serde_yaml::from_str(
            r#"
timeouts:
  nodePool: 30
  pollInterval: 1
maxParallelPools: 8
"#,
        )
        .unwrap();
        assert_eq!(settings.timeouts.node_pool, Duration::from_secs(30));
        assert_eq!(settings.timeouts.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.timeouts.cluster_create, CLUSTER_CREATE_TIMEOUT);
        assert_eq!(settings.max_parallel_pools, 8);
        assert_eq!(settings.deadline, RECONCILE_DEADLINE);
    }
}
