//! Cloud API boundary
//!
//! The reconciliation engine talks to the provider only through the traits in
//! this module. Transport concerns (request signing, connection pooling,
//! retry/backoff for throttling) belong to the implementations, never to the
//! reconcilers.
//!
//! The traits are split per resource family so that each reconciler only asks
//! for what it touches. [`CloudApi`] bundles all four and is implemented
//! automatically for any type providing them.

pub mod memory;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub use types::*;

/// Coarse classification of provider failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudErrorKind {
    NotFound,
    AlreadyExists,
    /// Security group rule already present
    DuplicateRule,
    /// Resource still has dependents (e.g. a subnet with live interfaces)
    DependencyViolation,
    Throttled,
    InvalidRequest,
    Other,
}

/// Error returned by the cloud API boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed ({kind:?}): {message}")]
pub struct CloudError {
    pub kind: CloudErrorKind,
    pub operation: String,
    pub message: String,
}

impl CloudError {
    pub fn new(kind: CloudErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, operation, message)
    }

    pub fn already_exists(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::AlreadyExists, operation, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == CloudErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == CloudErrorKind::AlreadyExists
    }

    pub fn is_duplicate_rule(&self) -> bool {
        self.kind == CloudErrorKind::DuplicateRule
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            CloudErrorKind::Throttled | CloudErrorKind::DependencyViolation
        )
    }
}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Virtual network primitives
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Availability zones currently available in the region, in provider order
    async fn describe_availability_zones(&self) -> CloudResult<Vec<String>>;

    async fn describe_vpcs(&self, filters: &[TagFilter]) -> CloudResult<Vec<Vpc>>;
    async fn create_vpc(&self, cidr_block: &str, tags: &TagSet) -> CloudResult<Vpc>;
    /// Enable DNS support and DNS hostnames on the VPC
    async fn enable_vpc_dns(&self, vpc_id: &str) -> CloudResult<()>;
    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()>;

    async fn describe_subnets(&self, vpc_id: &str) -> CloudResult<Vec<Subnet>>;
    async fn create_subnet(&self, request: &CreateSubnetRequest) -> CloudResult<Subnet>;
    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()>;

    async fn describe_internet_gateways(&self, vpc_id: &str) -> CloudResult<Vec<InternetGateway>>;
    async fn create_internet_gateway(&self, tags: &TagSet) -> CloudResult<InternetGateway>;
    async fn attach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()>;
    async fn detach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()>;
    async fn delete_internet_gateway(&self, igw_id: &str) -> CloudResult<()>;

    async fn describe_addresses(&self, filters: &[TagFilter]) -> CloudResult<Vec<ElasticIp>>;
    /// Allocate an elastic address, returning its allocation id
    async fn allocate_address(&self, tags: &TagSet) -> CloudResult<String>;
    async fn release_address(&self, allocation_id: &str) -> CloudResult<()>;

    async fn describe_nat_gateways(&self, vpc_id: &str) -> CloudResult<Vec<NatGateway>>;
    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        allocation_id: &str,
        tags: &TagSet,
    ) -> CloudResult<NatGateway>;
    async fn delete_nat_gateway(&self, nat_gateway_id: &str) -> CloudResult<()>;

    async fn describe_route_tables(&self, vpc_id: &str) -> CloudResult<Vec<RouteTable>>;
    async fn create_route_table(&self, vpc_id: &str, tags: &TagSet) -> CloudResult<RouteTable>;
    /// Create the route, replacing any existing route for the same destination
    async fn create_route(&self, route_table_id: &str, route: &Route) -> CloudResult<()>;
    /// Associate a subnet, returning the association id
    async fn associate_route_table(&self, route_table_id: &str, subnet_id: &str)
        -> CloudResult<String>;
    async fn disassociate_route_table(&self, association_id: &str) -> CloudResult<()>;
    async fn delete_route_table(&self, route_table_id: &str) -> CloudResult<()>;

    async fn describe_security_groups(&self, vpc_id: &str) -> CloudResult<Vec<SecurityGroup>>;
    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &TagSet,
    ) -> CloudResult<SecurityGroup>;
    async fn authorize_ingress(&self, group_id: &str, rules: &[SecurityGroupRule]) -> CloudResult<()>;
    async fn authorize_egress(&self, group_id: &str, rules: &[SecurityGroupRule]) -> CloudResult<()>;
    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()>;

    async fn describe_vpc_endpoints(&self, vpc_id: &str) -> CloudResult<Vec<VpcEndpoint>>;
    async fn create_vpc_endpoint(&self, request: &CreateVpcEndpointRequest)
        -> CloudResult<VpcEndpoint>;
    async fn delete_vpc_endpoints(&self, endpoint_ids: &[String]) -> CloudResult<()>;
}

/// Managed control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_clusters(&self) -> CloudResult<Vec<String>>;
    /// `Ok(None)` when no cluster has this name
    async fn describe_cluster(&self, name: &str) -> CloudResult<Option<EksCluster>>;
    async fn create_cluster(&self, request: &CreateClusterRequest) -> CloudResult<EksCluster>;
    /// Start a version upgrade, returning the update id
    async fn update_cluster_version(&self, name: &str, version: &str) -> CloudResult<String>;
    /// Apply an endpoint/logging update, returning the update id
    async fn update_cluster_config(
        &self,
        name: &str,
        update: &ClusterConfigUpdate,
    ) -> CloudResult<String>;
    async fn delete_cluster(&self, name: &str) -> CloudResult<()>;
}

/// Managed worker node groups
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeGroupApi: Send + Sync {
    async fn list_nodegroups(&self, cluster: &str) -> CloudResult<Vec<String>>;
    /// `Ok(None)` when the node group does not exist
    async fn describe_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<Option<Nodegroup>>;
    async fn create_nodegroup(&self, request: &CreateNodegroupRequest) -> CloudResult<Nodegroup>;
    /// Apply a scaling/label/taint update, returning the update id
    async fn update_nodegroup_config(&self, update: &NodegroupConfigUpdate) -> CloudResult<String>;
    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<()>;
}

/// Identity roles and their policies
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IamApi: Send + Sync {
    /// `Ok(None)` when no role has this name
    async fn get_role(&self, name: &str) -> CloudResult<Option<Role>>;
    async fn create_role(
        &self,
        name: &str,
        assume_role_policy: &str,
        tags: &TagSet,
    ) -> CloudResult<Role>;
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> CloudResult<()>;
    async fn list_attached_role_policies(&self, role_name: &str) -> CloudResult<Vec<String>>;
    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> CloudResult<()>;
    /// Names of inline policies embedded in the role
    async fn list_role_policies(&self, role_name: &str) -> CloudResult<Vec<String>>;
    async fn delete_role_policy(&self, role_name: &str, policy_name: &str) -> CloudResult<()>;
    async fn delete_role(&self, role_name: &str) -> CloudResult<()>;
}

/// Everything the orchestrator needs from the provider
pub trait CloudApi: NetworkApi + ClusterApi + NodeGroupApi + IamApi {}

impl<T> CloudApi for T where T: NetworkApi + ClusterApi + NodeGroupApi + IamApi + ?Sized {}

/// Treat `NotFound` on a delete as success
pub fn ignore_not_found(result: CloudResult<()>) -> CloudResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
