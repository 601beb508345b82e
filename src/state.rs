//! Actual-state records
//!
//! Rebuilt from the provider on every call and never cached. Discoverers
//! produce these from the raw provider types in [`crate::cloud`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cloud::{
    CapacityType, ClusterStatus, EksCluster, ElasticIp, InternetGateway, LogType, NatGateway,
    NatGatewayState, Nodegroup, NodegroupStatus, Role, RouteTable, SecurityGroup, Subnet, TagSet,
    Taint, Vpc, VpcEndpoint,
};
use crate::tags::{pool_name, SUBNET_TIER_KEY};

pub const PUBLIC_TIER: &str = "public";
pub const PRIVATE_TIER: &str = "private";

/// Every owned resource inside one owned VPC, as the provider reports it
///
/// This is what the topology builder resumes from and what teardown walks.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkInventory {
    pub vpc: Vpc,
    /// Sorted by CIDR, which is zone order
    pub subnets: Vec<Subnet>,
    pub internet_gateways: Vec<InternetGateway>,
    pub addresses: Vec<ElasticIp>,
    /// NAT gateways not deleting or deleted
    pub nat_gateways: Vec<NatGateway>,
    pub route_tables: Vec<RouteTable>,
    pub security_groups: Vec<SecurityGroup>,
    pub endpoints: Vec<VpcEndpoint>,
}

fn tier(tags: &TagSet) -> Option<&str> {
    tags.get(SUBNET_TIER_KEY).map(String::as_str)
}

impl NetworkInventory {
    /// A freshly created VPC with nothing in it yet
    pub fn empty(vpc: Vpc) -> Self {
        Self {
            vpc,
            subnets: Vec::new(),
            internet_gateways: Vec::new(),
            addresses: Vec::new(),
            nat_gateways: Vec::new(),
            route_tables: Vec::new(),
            security_groups: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn subnets_in_tier<'a>(&'a self, wanted: &'a str) -> impl Iterator<Item = &'a Subnet> + 'a {
        self.subnets.iter().filter(move |s| tier(&s.tags) == Some(wanted))
    }

    pub fn route_tables_in_tier<'a>(
        &'a self,
        wanted: &'a str,
    ) -> impl Iterator<Item = &'a RouteTable> + 'a {
        self.route_tables
            .iter()
            .filter(move |rt| tier(&rt.tags) == Some(wanted))
    }

    /// Collapse into the summary record the reconcilers consume
    pub fn to_state(&self) -> NetworkState {
        let private: Vec<&Subnet> = self.subnets_in_tier(PRIVATE_TIER).collect();

        NetworkState {
            vpc_id: self.vpc.id.clone(),
            cidr_block: self.vpc.cidr_block.clone(),
            availability_zones: private.iter().map(|s| s.availability_zone.clone()).collect(),
            public_subnet_ids: self
                .subnets_in_tier(PUBLIC_TIER)
                .map(|s| s.id.clone())
                .collect(),
            private_subnet_ids: private.iter().map(|s| s.id.clone()).collect(),
            internet_gateway_id: self.internet_gateways.first().map(|igw| igw.id.clone()),
            nat_gateway_ids: self
                .nat_gateways
                .iter()
                .filter(|n| n.state != NatGatewayState::Failed)
                .map(|n| n.id.clone())
                .collect(),
            public_route_table_ids: self
                .route_tables_in_tier(PUBLIC_TIER)
                .map(|rt| rt.id.clone())
                .collect(),
            private_route_table_ids: self
                .route_tables_in_tier(PRIVATE_TIER)
                .map(|rt| rt.id.clone())
                .collect(),
            security_group_ids: self.security_groups.iter().map(|sg| sg.id.clone()).collect(),
            endpoint_ids: self.endpoints.iter().map(|e| e.id.clone()).collect(),
            tags: self.vpc.tags.clone(),
        }
    }
}

/// Owned virtual network
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub vpc_id: String,
    pub cidr_block: String,
    /// Zones in carving order
    pub availability_zones: Vec<String>,
    pub public_subnet_ids: Vec<String>,
    pub private_subnet_ids: Vec<String>,
    pub internet_gateway_id: Option<String>,
    pub nat_gateway_ids: Vec<String>,
    pub public_route_table_ids: Vec<String>,
    pub private_route_table_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub endpoint_ids: Vec<String>,
    #[serde(skip)]
    pub tags: TagSet,
}

impl NetworkState {
    /// The cluster security group (one per network)
    pub fn cluster_security_group_id(&self) -> Option<&str> {
        self.security_group_ids.first().map(String::as_str)
    }
}

/// Owned control plane
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    pub name: String,
    pub arn: String,
    pub endpoint: Option<String>,
    #[serde(skip)]
    pub certificate_authority: Option<String>,
    pub version: String,
    #[serde(serialize_with = "display")]
    pub status: ClusterStatus,
    pub role_arn: String,
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub endpoint_public_access: bool,
    pub endpoint_private_access: bool,
    pub public_access_cidrs: Vec<String>,
    pub oidc_issuer: Option<String>,
    pub encryption_key_arn: Option<String>,
    #[serde(skip)]
    pub enabled_logs: BTreeSet<LogType>,
    #[serde(skip)]
    pub tags: TagSet,
    pub created_at: Option<DateTime<Utc>>,
}

fn display<T: std::fmt::Display, S: serde::Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

impl From<EksCluster> for ClusterState {
    fn from(c: EksCluster) -> Self {
        Self {
            name: c.name,
            arn: c.arn,
            endpoint: c.endpoint,
            certificate_authority: c.certificate_authority,
            version: c.version,
            status: c.status,
            role_arn: c.role_arn,
            vpc_id: c.vpc_config.vpc_id,
            subnet_ids: c.vpc_config.subnet_ids,
            security_group_ids: c.vpc_config.security_group_ids,
            endpoint_public_access: c.vpc_config.endpoint_public_access,
            endpoint_private_access: c.vpc_config.endpoint_private_access,
            public_access_cidrs: c.vpc_config.public_access_cidrs,
            oidc_issuer: c.oidc_issuer,
            encryption_key_arn: c.encryption_key_arn,
            enabled_logs: c.enabled_logs.into_iter().collect(),
            tags: c.tags,
            created_at: c.created_at,
        }
    }
}

/// Owned worker node pool, keyed by its logical name
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolState {
    /// Generated physical name
    pub name: String,
    /// Logical name from the node-pool tag
    pub pool: String,
    pub arn: String,
    pub cluster_name: String,
    #[serde(serialize_with = "display")]
    pub status: NodegroupStatus,
    pub instance_types: Vec<String>,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_size: u32,
    pub current_size: Option<u32>,
    pub subnets: Vec<String>,
    pub node_role_arn: String,
    pub ami_type: String,
    pub disk_size: Option<u32>,
    pub labels: BTreeMap<String, String>,
    #[serde(skip)]
    pub taints: Vec<Taint>,
    #[serde(serialize_with = "display")]
    pub capacity_type: CapacityType,
    pub health_issues: Vec<String>,
    #[serde(skip)]
    pub tags: TagSet,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl NodePoolState {
    /// Build from a provider node group; `None` when it carries no logical pool name
    pub fn from_nodegroup(ng: Nodegroup) -> Option<Self> {
        let pool = pool_name(&ng.tags)?.to_string();
        Some(Self {
            name: ng.name,
            pool,
            arn: ng.arn,
            cluster_name: ng.cluster_name,
            status: ng.status,
            instance_types: ng.instance_types,
            min_size: ng.scaling.min_size,
            max_size: ng.scaling.max_size,
            desired_size: ng.scaling.desired_size,
            current_size: ng.current_size,
            subnets: ng.subnets,
            node_role_arn: ng.node_role_arn,
            ami_type: ng.ami_type,
            disk_size: ng.disk_size,
            labels: ng.labels,
            taints: ng.taints,
            capacity_type: ng.capacity_type,
            health_issues: ng.health_issues,
            tags: ng.tags,
            created_at: ng.created_at,
            modified_at: ng.modified_at,
        })
    }

    /// The single instance type managed pools are created with
    pub fn instance_type(&self) -> &str {
        self.instance_types.first().map(String::as_str).unwrap_or_default()
    }
}

/// Role name and ARN
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoleRef {
    pub name: String,
    pub arn: String,
}

impl From<&Role> for RoleRef {
    fn from(role: &Role) -> Self {
        Self {
            name: role.name.clone(),
            arn: role.arn.clone(),
        }
    }
}

/// Control-plane and node roles
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRoles {
    pub cluster_role: RoleRef,
    pub node_role: RoleRef,
}
