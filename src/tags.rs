//! Ownership tags
//!
//! Every resource eksforge creates carries two identity tags: the tool marker
//! and the cluster name. Discovery only ever considers resources carrying both
//! with exact values, so anything created by hand or by another tool is
//! invisible: never adopted, never mutated, never deleted.

use std::fmt;

use crate::cloud::{TagFilter, TagSet};

/// Identity marker key
pub const MANAGED_BY_KEY: &str = "eksforge.io/managed-by";
/// Identity marker value
pub const MANAGED_BY_VALUE: &str = "eksforge";
/// Project/cluster name key
pub const CLUSTER_KEY: &str = "eksforge.io/cluster";
/// Resource kind key
pub const RESOURCE_KEY: &str = "eksforge.io/resource";
/// Logical node-pool name key (node pools only)
pub const NODE_POOL_KEY: &str = "eksforge.io/node-pool";
/// Subnet tier key ("public" or "private")
pub const SUBNET_TIER_KEY: &str = "eksforge.io/subnet-tier";
/// Availability zone a per-zone resource serves (private route tables)
pub const ZONE_KEY: &str = "eksforge.io/zone";
/// Human-readable name tag shown in the provider console
pub const NAME_KEY: &str = "Name";

const RESERVED_KEYS: [&str; 4] = [MANAGED_BY_KEY, CLUSTER_KEY, RESOURCE_KEY, NODE_POOL_KEY];

/// Kinds of resources eksforge manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Vpc,
    Subnet,
    InternetGateway,
    ElasticIp,
    NatGateway,
    RouteTable,
    SecurityGroup,
    VpcEndpoint,
    Cluster,
    NodePool,
    Role,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::InternetGateway => "internet-gateway",
            ResourceKind::ElasticIp => "elastic-ip",
            ResourceKind::NatGateway => "nat-gateway",
            ResourceKind::RouteTable => "route-table",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::VpcEndpoint => "vpc-endpoint",
            ResourceKind::Cluster => "cluster",
            ResourceKind::NodePool => "node-pool",
            ResourceKind::Role => "role",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the tag set for a new resource
///
/// `extra` is applied first so the reserved keys always win. A `Name` tag of
/// `<cluster>-<kind>` is added unless `extra` already supplies one.
pub fn tags_for(kind: ResourceKind, cluster_name: &str, extra: &TagSet) -> TagSet {
    let mut tags: TagSet = extra
        .iter()
        .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()) || k.as_str() == NODE_POOL_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    tags.entry(NAME_KEY.to_string())
        .or_insert_with(|| format!("{cluster_name}-{kind}"));
    tags.insert(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string());
    tags.insert(CLUSTER_KEY.to_string(), cluster_name.to_string());
    tags.insert(RESOURCE_KEY.to_string(), kind.as_str().to_string());
    tags
}

/// Tags for a node pool, carrying its logical name
pub fn node_pool_tags(cluster_name: &str, pool: &str, extra: &TagSet) -> TagSet {
    let mut extra = extra.clone();
    extra.insert(NODE_POOL_KEY.to_string(), pool.to_string());
    extra.insert(NAME_KEY.to_string(), format!("{cluster_name}-{pool}"));
    tags_for(ResourceKind::NodePool, cluster_name, &extra)
}

/// True iff the identity marker matches exactly and the cluster tag equals `cluster_name`
pub fn is_owned(tags: &TagSet, cluster_name: &str) -> bool {
    tags.get(MANAGED_BY_KEY).map(String::as_str) == Some(MANAGED_BY_VALUE)
        && tags.get(CLUSTER_KEY).map(String::as_str) == Some(cluster_name)
}

/// Provider-side filters selecting owned resources of one kind
pub fn ownership_filters(kind: ResourceKind, cluster_name: &str) -> Vec<TagFilter> {
    vec![
        TagFilter::new(MANAGED_BY_KEY, MANAGED_BY_VALUE),
        TagFilter::new(CLUSTER_KEY, cluster_name),
        TagFilter::new(RESOURCE_KEY, kind.as_str()),
    ]
}

/// Logical node-pool name, if tagged
pub fn pool_name(tags: &TagSet) -> Option<&str> {
    tags.get(NODE_POOL_KEY).map(String::as_str)
}
