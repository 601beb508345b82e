//! Provider-native resource representations
//!
//! These mirror what the managed-Kubernetes provider's APIs return. Discoverers
//! convert them into the records in [`crate::state`]; reconcilers build the
//! request types here when mutating.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Key/value tags attached to a cloud resource
pub type TagSet = BTreeMap<String, String>;

/// Filter on a tag key, matching any of the listed values
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub values: Vec<String>,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: vec![value.into()],
        }
    }

    pub fn matches(&self, tags: &TagSet) -> bool {
        tags.get(&self.key)
            .map(|v| self.values.iter().any(|want| want == v))
            .unwrap_or(false)
    }
}

/// True when every filter matches
pub fn matches_all(filters: &[TagFilter], tags: &TagSet) -> bool {
    filters.iter().all(|f| f.matches(tags))
}

// ============================================================================
// Network primitives
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vpc {
    pub id: String,
    pub cidr_block: String,
    pub dns_enabled: bool,
    pub tags: TagSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub vpc_id: String,
    pub cidr_block: String,
    pub availability_zone: String,
    pub map_public_ip_on_launch: bool,
    pub tags: TagSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateSubnetRequest {
    pub vpc_id: String,
    pub cidr_block: String,
    pub availability_zone: String,
    pub map_public_ip_on_launch: bool,
    pub tags: TagSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternetGateway {
    pub id: String,
    pub attached_vpc_ids: Vec<String>,
    pub tags: TagSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElasticIp {
    pub allocation_id: String,
    pub public_ip: String,
    /// NAT gateway currently holding the address
    pub associated_with: Option<String>,
    pub tags: TagSet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatGatewayState {
    Pending,
    Available,
    Deleting,
    Deleted,
    Failed,
}

impl NatGatewayState {
    pub fn is_gone(&self) -> bool {
        matches!(self, NatGatewayState::Deleting | NatGatewayState::Deleted)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatGateway {
    pub id: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub allocation_id: String,
    pub state: NatGatewayState,
    pub failure_message: Option<String>,
    pub tags: TagSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    InternetGateway(String),
    NatGateway(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub destination_cidr: String,
    pub target: RouteTarget,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTableAssociation {
    pub id: String,
    pub subnet_id: Option<String>,
    pub main: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTable {
    pub id: String,
    pub vpc_id: String,
    pub routes: Vec<Route>,
    pub associations: Vec<RouteTableAssociation>,
    pub tags: TagSet,
}

impl RouteTable {
    pub fn has_default_route_to(&self, target: &RouteTarget) -> bool {
        self.routes
            .iter()
            .any(|r| r.destination_cidr == "0.0.0.0/0" && &r.target == target)
    }

    pub fn is_associated_with(&self, subnet_id: &str) -> bool {
        self.associations
            .iter()
            .any(|a| a.subnet_id.as_deref() == Some(subnet_id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Tcp,
    Udp,
    All,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuleSource {
    Cidr(String),
    Group(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SecurityGroupRule {
    pub protocol: IpProtocol,
    pub from_port: i32,
    pub to_port: i32,
    pub source: RuleSource,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: String,
    pub vpc_id: String,
    pub name: String,
    pub description: String,
    pub ingress: Vec<SecurityGroupRule>,
    pub egress: Vec<SecurityGroupRule>,
    pub tags: TagSet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VpcEndpointType {
    Interface,
    Gateway,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VpcEndpointState {
    Pending,
    Available,
    Deleting,
    Deleted,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpcEndpoint {
    pub id: String,
    pub vpc_id: String,
    pub service_name: String,
    pub endpoint_type: VpcEndpointType,
    pub state: VpcEndpointState,
    pub tags: TagSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateVpcEndpointRequest {
    pub vpc_id: String,
    pub service_name: String,
    pub endpoint_type: VpcEndpointType,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub route_table_ids: Vec<String>,
    pub private_dns_enabled: bool,
    pub tags: TagSet,
}

// ============================================================================
// Control plane
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    Failed,
    Pending,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Creating => "CREATING",
            ClusterStatus::Active => "ACTIVE",
            ClusterStatus::Updating => "UPDATING",
            ClusterStatus::Deleting => "DELETING",
            ClusterStatus::Failed => "FAILED",
            ClusterStatus::Pending => "PENDING",
        };
        f.write_str(s)
    }
}

/// Control-plane log categories
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogType {
    Api,
    Audit,
    Authenticator,
    ControllerManager,
    Scheduler,
}

impl LogType {
    pub const ALL: [LogType; 5] = [
        LogType::Api,
        LogType::Audit,
        LogType::Authenticator,
        LogType::ControllerManager,
        LogType::Scheduler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Api => "api",
            LogType::Audit => "audit",
            LogType::Authenticator => "authenticator",
            LogType::ControllerManager => "controllerManager",
            LogType::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterVpcConfig {
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub endpoint_public_access: bool,
    pub endpoint_private_access: bool,
    pub public_access_cidrs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EksCluster {
    pub name: String,
    pub arn: String,
    pub endpoint: Option<String>,
    pub certificate_authority: Option<String>,
    pub version: String,
    pub status: ClusterStatus,
    pub role_arn: String,
    pub vpc_config: ClusterVpcConfig,
    pub oidc_issuer: Option<String>,
    pub encryption_key_arn: Option<String>,
    pub enabled_logs: Vec<LogType>,
    pub tags: TagSet,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateClusterRequest {
    pub name: String,
    pub version: String,
    pub role_arn: String,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub endpoint_public_access: bool,
    pub endpoint_private_access: bool,
    pub public_access_cidrs: Vec<String>,
    pub encryption_key_arn: Option<String>,
    pub enabled_logs: Vec<LogType>,
    pub tags: TagSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAccessUpdate {
    pub endpoint_public_access: bool,
    pub endpoint_private_access: bool,
    pub public_access_cidrs: Vec<String>,
}

/// Combined endpoint + logging update; fields left empty are not touched
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterConfigUpdate {
    pub endpoint_access: Option<EndpointAccessUpdate>,
    pub enable_logs: Vec<LogType>,
}

impl ClusterConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.endpoint_access.is_none() && self.enable_logs.is_empty()
    }
}

// ============================================================================
// Node groups
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodegroupStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    CreateFailed,
    DeleteFailed,
    Degraded,
}

impl NodegroupStatus {
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            NodegroupStatus::CreateFailed | NodegroupStatus::DeleteFailed | NodegroupStatus::Degraded
        )
    }
}

impl fmt::Display for NodegroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodegroupStatus::Creating => "CREATING",
            NodegroupStatus::Active => "ACTIVE",
            NodegroupStatus::Updating => "UPDATING",
            NodegroupStatus::Deleting => "DELETING",
            NodegroupStatus::CreateFailed => "CREATE_FAILED",
            NodegroupStatus::DeleteFailed => "DELETE_FAILED",
            NodegroupStatus::Degraded => "DEGRADED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CapacityType {
    #[default]
    OnDemand,
    Spot,
}

impl fmt::Display for CapacityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityType::OnDemand => f.write_str("ON_DEMAND"),
            CapacityType::Spot => f.write_str("SPOT"),
        }
    }
}

/// Kubernetes taint effect
///
/// Serialized in the configuration file with the Kubernetes spelling
/// (`NoSchedule`); the provider uses the upper-snake spelling (`NO_SCHEDULE`).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum TaintEffect {
    #[default]
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn provider_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NO_SCHEDULE",
            TaintEffect::PreferNoSchedule => "PREFER_NO_SCHEDULE",
            TaintEffect::NoExecute => "NO_EXECUTE",
        }
    }

    /// Parse either spelling. Anything unrecognised maps to `NoSchedule`.
    pub fn from_provider(value: &str) -> Self {
        match value {
            "PREFER_NO_SCHEDULE" | "PreferNoSchedule" => TaintEffect::PreferNoSchedule,
            "NO_EXECUTE" | "NoExecute" => TaintEffect::NoExecute,
            _ => TaintEffect::NoSchedule,
        }
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.key, self.value, self.effect)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScalingConfig {
    pub min_size: u32,
    pub max_size: u32,
    pub desired_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nodegroup {
    pub name: String,
    pub arn: String,
    pub cluster_name: String,
    pub status: NodegroupStatus,
    pub instance_types: Vec<String>,
    pub scaling: ScalingConfig,
    pub current_size: Option<u32>,
    pub subnets: Vec<String>,
    pub node_role_arn: String,
    pub ami_type: String,
    pub disk_size: Option<u32>,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub capacity_type: CapacityType,
    pub health_issues: Vec<String>,
    pub tags: TagSet,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateNodegroupRequest {
    pub cluster_name: String,
    pub nodegroup_name: String,
    pub scaling: ScalingConfig,
    pub subnets: Vec<String>,
    pub instance_types: Vec<String>,
    pub ami_type: String,
    pub capacity_type: CapacityType,
    pub disk_size: u32,
    pub node_role_arn: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub tags: TagSet,
}

/// Combined node group config update; empty fields are not touched
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodegroupConfigUpdate {
    pub cluster_name: String,
    pub nodegroup_name: String,
    pub scaling: Option<ScalingConfig>,
    pub add_or_update_labels: BTreeMap<String, String>,
    pub remove_labels: Vec<String>,
    pub add_or_update_taints: Vec<Taint>,
    pub remove_taints: Vec<Taint>,
}

impl NodegroupConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.scaling.is_none()
            && self.add_or_update_labels.is_empty()
            && self.remove_labels.is_empty()
            && self.add_or_update_taints.is_empty()
            && self.remove_taints.is_empty()
    }
}

// ============================================================================
// Identity
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub arn: String,
    pub assume_role_policy: String,
    pub tags: TagSet,
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taint_effect_accepts_both_spellings() {
        assert_eq!(TaintEffect::from_provider("NO_EXECUTE"), TaintEffect::NoExecute);
        assert_eq!(TaintEffect::from_provider("NoExecute"), TaintEffect::NoExecute);
        assert_eq!(
            TaintEffect::from_provider("PREFER_NO_SCHEDULE"),
            TaintEffect::PreferNoSchedule
        );
        assert_eq!(TaintEffect::from_provider("bogus"), TaintEffect::NoSchedule);
    }

    #[test]
    fn tag_filter_requires_exact_value() {
        let mut tags = TagSet::new();
        tags.insert("team".to_string(), "platform".to_string());
        assert!(TagFilter::new("team", "platform").matches(&tags));
        assert!(!TagFilter::new("team", "Platform").matches(&tags));
        assert!(!TagFilter::new("owner", "platform").matches(&tags));
    }
}
