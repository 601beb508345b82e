//! In-memory provider
//!
//! A faithful-enough simulation of the provider for tests and for the CLI
//! `simulate` command. Asynchronous operations (NAT gateways, endpoints,
//! clusters, node groups) report a transitional status and settle after a
//! configurable number of describe calls. Every mutating call is counted so
//! idempotence can be asserted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::*;

const ACCOUNT_ID: &str = "123456789012";

#[derive(Clone, Debug)]
struct InjectedError {
    operation: String,
    needle: String,
    kind: CloudErrorKind,
}

#[derive(Clone, Debug)]
struct RoleRecord {
    role: Role,
    attached: BTreeSet<String>,
    inline: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct World {
    next_id: u64,
    zones: Vec<String>,
    vpcs: BTreeMap<String, Vpc>,
    subnets: BTreeMap<String, Subnet>,
    internet_gateways: BTreeMap<String, InternetGateway>,
    addresses: BTreeMap<String, ElasticIp>,
    nat_gateways: BTreeMap<String, NatGateway>,
    route_tables: BTreeMap<String, RouteTable>,
    security_groups: BTreeMap<String, SecurityGroup>,
    endpoints: BTreeMap<String, VpcEndpoint>,
    clusters: BTreeMap<String, EksCluster>,
    /// Keyed by (cluster, node group)
    nodegroups: BTreeMap<(String, String), Nodegroup>,
    roles: BTreeMap<String, RoleRecord>,
    /// Resource key -> describe calls left before it settles
    settling: BTreeMap<String, u32>,
    settle_polls: u32,
    /// Resources whose key contains one of these settle into a failed state
    fail_settle: Vec<String>,
    injected: Vec<InjectedError>,
    mutations: BTreeMap<String, usize>,
}

impl World {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }

    /// Count a mutating call and apply any injected failure
    fn mutate(&mut self, operation: &str, key: &str) -> CloudResult<()> {
        *self.mutations.entry(operation.to_string()).or_default() += 1;
        if let Some(injected) = self
            .injected
            .iter()
            .find(|i| i.operation == operation && key.contains(&i.needle))
        {
            return Err(CloudError::new(
                injected.kind,
                operation,
                format!("injected failure for {key}"),
            ));
        }
        Ok(())
    }

    fn start_settling(&mut self, key: &str) {
        self.settling.insert(key.to_string(), self.settle_polls);
    }

    /// Observe a transitional resource; true once it has settled
    fn tick(&mut self, key: &str) -> bool {
        match self.settling.get_mut(key) {
            None | Some(0) => {
                self.settling.remove(key);
                true
            }
            Some(left) => {
                *left -= 1;
                false
            }
        }
    }

    fn settles_failed(&self, key: &str) -> bool {
        self.fail_settle.iter().any(|needle| key.contains(needle.as_str()))
    }
}

fn not_found(operation: &str, what: &str) -> CloudError {
    CloudError::not_found(operation, format!("{what} does not exist"))
}

fn nodegroup_key(cluster: &str, name: &str) -> String {
    format!("{cluster}/{name}")
}

/// Simulated provider backed by in-process maps
#[derive(Debug)]
pub struct InMemoryCloud {
    region: String,
    world: Mutex<World>,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new("us-west-2")
    }
}

impl InMemoryCloud {
    /// Empty provider with four available zones
    pub fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        let world = World {
            zones: ["a", "b", "c", "d"]
                .iter()
                .map(|suffix| format!("{region}{suffix}"))
                .collect(),
            ..World::default()
        };
        Self {
            region,
            world: Mutex::new(world),
        }
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Replace the list of available zones
    pub fn set_zones(&self, zones: Vec<String>) {
        self.world().zones = zones;
    }

    /// Describe calls an asynchronous resource stays transitional for
    pub fn set_settle_polls(&self, polls: u32) {
        self.world().settle_polls = polls;
    }

    /// Fail the next calls of `operation` whose target contains `needle`
    pub fn inject_error(&self, operation: &str, needle: &str, kind: CloudErrorKind) {
        self.world().injected.push(InjectedError {
            operation: operation.to_string(),
            needle: needle.to_string(),
            kind,
        });
    }

    pub fn clear_injected_errors(&self) {
        self.world().injected.clear();
    }

    /// Resources whose name contains `needle` settle into a failed state
    pub fn fail_settling(&self, needle: &str) {
        self.world().fail_settle.push(needle.to_string());
    }

    pub fn clear_failed_settling(&self) {
        self.world().fail_settle.clear();
    }

    /// Total mutating calls so far
    pub fn mutation_count(&self) -> usize {
        self.world().mutations.values().sum()
    }

    /// Mutating calls of one operation so far
    pub fn calls(&self, operation: &str) -> usize {
        self.world().mutations.get(operation).copied().unwrap_or(0)
    }

    pub fn reset_counters(&self) {
        self.world().mutations.clear();
    }

    /// Number of live resources of every kind, for assertions and reports
    pub fn inventory_counts(&self) -> BTreeMap<&'static str, usize> {
        let w = self.world();
        BTreeMap::from([
            ("vpcs", w.vpcs.len()),
            ("subnets", w.subnets.len()),
            ("internet_gateways", w.internet_gateways.len()),
            ("elastic_ips", w.addresses.len()),
            (
                "nat_gateways",
                w.nat_gateways
                    .values()
                    .filter(|n| n.state != NatGatewayState::Deleted)
                    .count(),
            ),
            ("route_tables", w.route_tables.len()),
            ("security_groups", w.security_groups.len()),
            ("vpc_endpoints", w.endpoints.len()),
            ("clusters", w.clusters.len()),
            ("nodegroups", w.nodegroups.len()),
            ("roles", w.roles.len()),
        ])
    }

    /// Seed a VPC created outside the engine
    pub fn insert_vpc(&self, cidr_block: &str, tags: TagSet) -> String {
        let mut w = self.world();
        let id = w.id("vpc");
        w.vpcs.insert(
            id.clone(),
            Vpc {
                id: id.clone(),
                cidr_block: cidr_block.to_string(),
                dns_enabled: false,
                tags,
            },
        );
        id
    }

    /// Seed a role created outside the engine
    pub fn insert_role(&self, name: &str, tags: TagSet) {
        let role = Role {
            name: name.to_string(),
            arn: format!("arn:aws:iam::{ACCOUNT_ID}:role/{name}"),
            assume_role_policy: "{}".to_string(),
            tags,
            created_at: Some(Utc::now()),
        };
        self.world().roles.insert(
            name.to_string(),
            RoleRecord {
                role,
                attached: BTreeSet::new(),
                inline: BTreeSet::new(),
            },
        );
    }

    /// Seed an inline policy on an existing role
    pub fn insert_inline_policy(&self, role: &str, policy: &str) {
        if let Some(record) = self.world().roles.get_mut(role) {
            record.inline.insert(policy.to_string());
        }
    }

    /// Managed policies attached to a role
    pub fn attached_policies(&self, role: &str) -> Vec<String> {
        self.world()
            .roles
            .get(role)
            .map(|r| r.attached.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Seed a cluster created outside the engine (already active)
    pub fn insert_cluster(&self, cluster: EksCluster) {
        self.world().clusters.insert(cluster.name.clone(), cluster);
    }

    /// Seed a node group created outside the engine (already active)
    pub fn insert_nodegroup(&self, nodegroup: Nodegroup) {
        self.world().nodegroups.insert(
            (nodegroup.cluster_name.clone(), nodegroup.name.clone()),
            nodegroup,
        );
    }

    /// Live node groups of a cluster, as stored
    pub fn nodegroups(&self, cluster: &str) -> Vec<Nodegroup> {
        self.world()
            .nodegroups
            .values()
            .filter(|ng| ng.cluster_name == cluster)
            .cloned()
            .collect()
    }

    /// Current stored cluster, bypassing settling
    pub fn cluster(&self, name: &str) -> Option<EksCluster> {
        self.world().clusters.get(name).cloned()
    }

    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        self.world().security_groups.values().cloned().collect()
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        self.world().subnets.values().cloned().collect()
    }

    pub fn route_tables(&self) -> Vec<RouteTable> {
        self.world().route_tables.values().cloned().collect()
    }

    pub fn endpoints(&self) -> Vec<VpcEndpoint> {
        self.world().endpoints.values().cloned().collect()
    }

    /// Remove a resource behind the engine's back (simulates manual deletion)
    pub fn remove_subnet(&self, subnet_id: &str) {
        self.world().subnets.remove(subnet_id);
    }
}

#[async_trait]
impl NetworkApi for InMemoryCloud {
    async fn describe_availability_zones(&self) -> CloudResult<Vec<String>> {
        Ok(self.world().zones.clone())
    }

    async fn describe_vpcs(&self, filters: &[TagFilter]) -> CloudResult<Vec<Vpc>> {
        Ok(self
            .world()
            .vpcs
            .values()
            .filter(|vpc| matches_all(filters, &vpc.tags))
            .cloned()
            .collect())
    }

    async fn create_vpc(&self, cidr_block: &str, tags: &TagSet) -> CloudResult<Vpc> {
        let mut w = self.world();
        w.mutate("CreateVpc", cidr_block)?;
        let id = w.id("vpc");
        let vpc = Vpc {
            id: id.clone(),
            cidr_block: cidr_block.to_string(),
            dns_enabled: false,
            tags: tags.clone(),
        };
        w.vpcs.insert(id, vpc.clone());
        Ok(vpc)
    }

    async fn enable_vpc_dns(&self, vpc_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("ModifyVpcAttribute", vpc_id)?;
        let vpc = w
            .vpcs
            .get_mut(vpc_id)
            .ok_or_else(|| not_found("ModifyVpcAttribute", vpc_id))?;
        vpc.dns_enabled = true;
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteVpc", vpc_id)?;
        if !w.vpcs.contains_key(vpc_id) {
            return Err(not_found("DeleteVpc", vpc_id));
        }
        let has_dependents = w.subnets.values().any(|s| s.vpc_id == vpc_id)
            || w.security_groups.values().any(|sg| sg.vpc_id == vpc_id)
            || w.route_tables.values().any(|rt| rt.vpc_id == vpc_id)
            || w
                .internet_gateways
                .values()
                .any(|igw| igw.attached_vpc_ids.iter().any(|v| v == vpc_id));
        if has_dependents {
            return Err(CloudError::new(
                CloudErrorKind::DependencyViolation,
                "DeleteVpc",
                format!("{vpc_id} has dependencies and cannot be deleted"),
            ));
        }
        w.vpcs.remove(vpc_id);
        Ok(())
    }

    async fn describe_subnets(&self, vpc_id: &str) -> CloudResult<Vec<Subnet>> {
        Ok(self
            .world()
            .subnets
            .values()
            .filter(|s| s.vpc_id == vpc_id)
            .cloned()
            .collect())
    }

    async fn create_subnet(&self, request: &CreateSubnetRequest) -> CloudResult<Subnet> {
        let mut w = self.world();
        w.mutate("CreateSubnet", &request.cidr_block)?;
        if !w.vpcs.contains_key(&request.vpc_id) {
            return Err(not_found("CreateSubnet", &request.vpc_id));
        }
        if w
            .subnets
            .values()
            .any(|s| s.vpc_id == request.vpc_id && s.cidr_block == request.cidr_block)
        {
            return Err(CloudError::new(
                CloudErrorKind::InvalidRequest,
                "CreateSubnet",
                format!("{} conflicts with another subnet", request.cidr_block),
            ));
        }
        let id = w.id("subnet");
        let subnet = Subnet {
            id: id.clone(),
            vpc_id: request.vpc_id.clone(),
            cidr_block: request.cidr_block.clone(),
            availability_zone: request.availability_zone.clone(),
            map_public_ip_on_launch: request.map_public_ip_on_launch,
            tags: request.tags.clone(),
        };
        w.subnets.insert(id, subnet.clone());
        Ok(subnet)
    }

    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteSubnet", subnet_id)?;
        let in_use = w
            .nat_gateways
            .values()
            .any(|n| n.subnet_id == subnet_id && n.state != NatGatewayState::Deleted);
        if in_use {
            return Err(CloudError::new(
                CloudErrorKind::DependencyViolation,
                "DeleteSubnet",
                format!("{subnet_id} has dependencies and cannot be deleted"),
            ));
        }
        w.subnets
            .remove(subnet_id)
            .map(|_| ())
            .ok_or_else(|| not_found("DeleteSubnet", subnet_id))
    }

    async fn describe_internet_gateways(&self, vpc_id: &str) -> CloudResult<Vec<InternetGateway>> {
        // Unattached gateways are still reported so a half-finished attach can resume
        Ok(self
            .world()
            .internet_gateways
            .values()
            .filter(|igw| {
                igw.attached_vpc_ids.is_empty() || igw.attached_vpc_ids.iter().any(|v| v == vpc_id)
            })
            .cloned()
            .collect())
    }

    async fn create_internet_gateway(&self, tags: &TagSet) -> CloudResult<InternetGateway> {
        let mut w = self.world();
        w.mutate("CreateInternetGateway", "")?;
        let id = w.id("igw");
        let igw = InternetGateway {
            id: id.clone(),
            attached_vpc_ids: Vec::new(),
            tags: tags.clone(),
        };
        w.internet_gateways.insert(id, igw.clone());
        Ok(igw)
    }

    async fn attach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("AttachInternetGateway", igw_id)?;
        let igw = w
            .internet_gateways
            .get_mut(igw_id)
            .ok_or_else(|| not_found("AttachInternetGateway", igw_id))?;
        if !igw.attached_vpc_ids.iter().any(|v| v == vpc_id) {
            igw.attached_vpc_ids.push(vpc_id.to_string());
        }
        Ok(())
    }

    async fn detach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DetachInternetGateway", igw_id)?;
        let igw = w
            .internet_gateways
            .get_mut(igw_id)
            .ok_or_else(|| not_found("DetachInternetGateway", igw_id))?;
        igw.attached_vpc_ids.retain(|v| v != vpc_id);
        Ok(())
    }

    async fn delete_internet_gateway(&self, igw_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteInternetGateway", igw_id)?;
        match w.internet_gateways.get(igw_id) {
            None => Err(not_found("DeleteInternetGateway", igw_id)),
            Some(igw) if !igw.attached_vpc_ids.is_empty() => Err(CloudError::new(
                CloudErrorKind::DependencyViolation,
                "DeleteInternetGateway",
                format!("{igw_id} is still attached"),
            )),
            Some(_) => {
                w.internet_gateways.remove(igw_id);
                Ok(())
            }
        }
    }

    async fn describe_addresses(&self, filters: &[TagFilter]) -> CloudResult<Vec<ElasticIp>> {
        Ok(self
            .world()
            .addresses
            .values()
            .filter(|eip| matches_all(filters, &eip.tags))
            .cloned()
            .collect())
    }

    async fn allocate_address(&self, tags: &TagSet) -> CloudResult<String> {
        let mut w = self.world();
        w.mutate("AllocateAddress", "")?;
        let id = w.id("eipalloc");
        let octet = w.next_id % 250 + 1;
        w.addresses.insert(
            id.clone(),
            ElasticIp {
                allocation_id: id.clone(),
                public_ip: format!("198.51.100.{octet}"),
                associated_with: None,
                tags: tags.clone(),
            },
        );
        Ok(id)
    }

    async fn release_address(&self, allocation_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("ReleaseAddress", allocation_id)?;
        match w.addresses.get(allocation_id) {
            None => Err(not_found("ReleaseAddress", allocation_id)),
            Some(eip) if eip.associated_with.is_some() => Err(CloudError::new(
                CloudErrorKind::DependencyViolation,
                "ReleaseAddress",
                format!("{allocation_id} is still associated"),
            )),
            Some(_) => {
                w.addresses.remove(allocation_id);
                Ok(())
            }
        }
    }

    async fn describe_nat_gateways(&self, vpc_id: &str) -> CloudResult<Vec<NatGateway>> {
        let mut w = self.world();
        let ids: Vec<String> = w
            .nat_gateways
            .values()
            .filter(|n| n.vpc_id == vpc_id)
            .map(|n| n.id.clone())
            .collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let settled = w.tick(&id);
            let failed = w.settles_failed(&id);
            let Some(nat) = w.nat_gateways.get_mut(&id) else {
                continue;
            };
            if settled {
                match nat.state {
                    NatGatewayState::Pending if failed => {
                        nat.state = NatGatewayState::Failed;
                        nat.failure_message = Some("Insufficient capacity".to_string());
                    }
                    NatGatewayState::Pending => nat.state = NatGatewayState::Available,
                    NatGatewayState::Deleting => nat.state = NatGatewayState::Deleted,
                    _ => {}
                }
            }
            let nat = nat.clone();
            if matches!(nat.state, NatGatewayState::Deleted | NatGatewayState::Failed) {
                if let Some(eip) = w.addresses.get_mut(&nat.allocation_id) {
                    if eip.associated_with.as_deref() == Some(nat.id.as_str()) {
                        eip.associated_with = None;
                    }
                }
            }
            out.push(nat);
        }
        Ok(out)
    }

    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        allocation_id: &str,
        tags: &TagSet,
    ) -> CloudResult<NatGateway> {
        let mut w = self.world();
        w.mutate("CreateNatGateway", subnet_id)?;
        let vpc_id = w
            .subnets
            .get(subnet_id)
            .map(|s| s.vpc_id.clone())
            .ok_or_else(|| not_found("CreateNatGateway", subnet_id))?;
        let id = w.id("nat");
        let eip = w
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| not_found("CreateNatGateway", allocation_id))?;
        eip.associated_with = Some(id.clone());

        let nat = NatGateway {
            id: id.clone(),
            vpc_id,
            subnet_id: subnet_id.to_string(),
            allocation_id: allocation_id.to_string(),
            state: NatGatewayState::Pending,
            failure_message: None,
            tags: tags.clone(),
        };
        w.nat_gateways.insert(id.clone(), nat.clone());
        w.start_settling(&id);
        Ok(nat)
    }

    async fn delete_nat_gateway(&self, nat_gateway_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteNatGateway", nat_gateway_id)?;
        let nat = w
            .nat_gateways
            .get_mut(nat_gateway_id)
            .ok_or_else(|| not_found("DeleteNatGateway", nat_gateway_id))?;
        if nat.state != NatGatewayState::Deleted {
            nat.state = NatGatewayState::Deleting;
            w.start_settling(nat_gateway_id);
        }
        Ok(())
    }

    async fn describe_route_tables(&self, vpc_id: &str) -> CloudResult<Vec<RouteTable>> {
        Ok(self
            .world()
            .route_tables
            .values()
            .filter(|rt| rt.vpc_id == vpc_id)
            .cloned()
            .collect())
    }

    async fn create_route_table(&self, vpc_id: &str, tags: &TagSet) -> CloudResult<RouteTable> {
        let mut w = self.world();
        w.mutate("CreateRouteTable", vpc_id)?;
        let id = w.id("rtb");
        let rt = RouteTable {
            id: id.clone(),
            vpc_id: vpc_id.to_string(),
            routes: Vec::new(),
            associations: Vec::new(),
            tags: tags.clone(),
        };
        w.route_tables.insert(id, rt.clone());
        Ok(rt)
    }

    async fn create_route(&self, route_table_id: &str, route: &Route) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("CreateRoute", route_table_id)?;
        let rt = w
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found("CreateRoute", route_table_id))?;
        rt.routes
            .retain(|r| r.destination_cidr != route.destination_cidr);
        rt.routes.push(route.clone());
        Ok(())
    }

    async fn associate_route_table(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> CloudResult<String> {
        let mut w = self.world();
        w.mutate("AssociateRouteTable", route_table_id)?;
        let id = w.id("rtbassoc");
        // A subnet has at most one association
        for rt in w.route_tables.values_mut() {
            rt.associations
                .retain(|a| a.subnet_id.as_deref() != Some(subnet_id));
        }
        let rt = w
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found("AssociateRouteTable", route_table_id))?;
        rt.associations.push(RouteTableAssociation {
            id: id.clone(),
            subnet_id: Some(subnet_id.to_string()),
            main: false,
        });
        Ok(id)
    }

    async fn disassociate_route_table(&self, association_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DisassociateRouteTable", association_id)?;
        let mut found = false;
        for rt in w.route_tables.values_mut() {
            let before = rt.associations.len();
            rt.associations.retain(|a| a.id != association_id);
            found |= rt.associations.len() != before;
        }
        if found {
            Ok(())
        } else {
            Err(not_found("DisassociateRouteTable", association_id))
        }
    }

    async fn delete_route_table(&self, route_table_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteRouteTable", route_table_id)?;
        match w.route_tables.get(route_table_id) {
            None => Err(not_found("DeleteRouteTable", route_table_id)),
            Some(rt) if !rt.associations.is_empty() => Err(CloudError::new(
                CloudErrorKind::DependencyViolation,
                "DeleteRouteTable",
                format!("{route_table_id} has associations"),
            )),
            Some(_) => {
                w.route_tables.remove(route_table_id);
                Ok(())
            }
        }
    }

    async fn describe_security_groups(&self, vpc_id: &str) -> CloudResult<Vec<SecurityGroup>> {
        Ok(self
            .world()
            .security_groups
            .values()
            .filter(|sg| sg.vpc_id == vpc_id)
            .cloned()
            .collect())
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        description: &str,
        tags: &TagSet,
    ) -> CloudResult<SecurityGroup> {
        let mut w = self.world();
        w.mutate("CreateSecurityGroup", name)?;
        if w
            .security_groups
            .values()
            .any(|sg| sg.vpc_id == vpc_id && sg.name == name)
        {
            return Err(CloudError::already_exists(
                "CreateSecurityGroup",
                format!("security group {name} already exists"),
            ));
        }
        let id = w.id("sg");
        let sg = SecurityGroup {
            id: id.clone(),
            vpc_id: vpc_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            ingress: Vec::new(),
            egress: Vec::new(),
            tags: tags.clone(),
        };
        w.security_groups.insert(id, sg.clone());
        Ok(sg)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[SecurityGroupRule]) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("AuthorizeSecurityGroupIngress", group_id)?;
        let sg = w
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("AuthorizeSecurityGroupIngress", group_id))?;
        authorize(&mut sg.ingress, rules, "AuthorizeSecurityGroupIngress")
    }

    async fn authorize_egress(&self, group_id: &str, rules: &[SecurityGroupRule]) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("AuthorizeSecurityGroupEgress", group_id)?;
        let sg = w
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("AuthorizeSecurityGroupEgress", group_id))?;
        authorize(&mut sg.egress, rules, "AuthorizeSecurityGroupEgress")
    }

    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteSecurityGroup", group_id)?;
        w.security_groups
            .remove(group_id)
            .map(|_| ())
            .ok_or_else(|| not_found("DeleteSecurityGroup", group_id))
    }

    async fn describe_vpc_endpoints(&self, vpc_id: &str) -> CloudResult<Vec<VpcEndpoint>> {
        let mut w = self.world();
        let ids: Vec<String> = w
            .endpoints
            .values()
            .filter(|e| e.vpc_id == vpc_id)
            .map(|e| e.id.clone())
            .collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let settled = w.tick(&id);
            let failed = w.settles_failed(&id);
            let Some(endpoint) = w.endpoints.get_mut(&id) else {
                continue;
            };
            if settled {
                match endpoint.state {
                    VpcEndpointState::Pending if failed => endpoint.state = VpcEndpointState::Failed,
                    VpcEndpointState::Pending => endpoint.state = VpcEndpointState::Available,
                    VpcEndpointState::Deleting => {
                        w.endpoints.remove(&id);
                        continue;
                    }
                    _ => {}
                }
            }
            out.push(endpoint.clone());
        }
        Ok(out)
    }

    async fn create_vpc_endpoint(
        &self,
        request: &CreateVpcEndpointRequest,
    ) -> CloudResult<VpcEndpoint> {
        let mut w = self.world();
        w.mutate("CreateVpcEndpoint", &request.service_name)?;
        let id = w.id("vpce");
        let state = match request.endpoint_type {
            VpcEndpointType::Gateway => VpcEndpointState::Available,
            VpcEndpointType::Interface => VpcEndpointState::Pending,
        };
        let endpoint = VpcEndpoint {
            id: id.clone(),
            vpc_id: request.vpc_id.clone(),
            service_name: request.service_name.clone(),
            endpoint_type: request.endpoint_type,
            state,
            tags: request.tags.clone(),
        };
        w.endpoints.insert(id.clone(), endpoint.clone());
        if state == VpcEndpointState::Pending {
            w.start_settling(&id);
        }
        Ok(endpoint)
    }

    async fn delete_vpc_endpoints(&self, endpoint_ids: &[String]) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteVpcEndpoints", &endpoint_ids.join(","))?;
        for id in endpoint_ids {
            if let Some(endpoint) = w.endpoints.get_mut(id) {
                endpoint.state = VpcEndpointState::Deleting;
                w.start_settling(id);
            }
        }
        Ok(())
    }
}

fn same_rule(a: &SecurityGroupRule, b: &SecurityGroupRule) -> bool {
    a.protocol == b.protocol && a.from_port == b.from_port && a.to_port == b.to_port && a.source == b.source
}

fn authorize(
    existing: &mut Vec<SecurityGroupRule>,
    rules: &[SecurityGroupRule],
    operation: &str,
) -> CloudResult<()> {
    if rules.iter().any(|r| existing.iter().any(|e| same_rule(e, r))) {
        return Err(CloudError::new(
            CloudErrorKind::DuplicateRule,
            operation,
            "the specified rule already exists",
        ));
    }
    existing.extend(rules.iter().cloned());
    Ok(())
}

#[async_trait]
impl ClusterApi for InMemoryCloud {
    async fn list_clusters(&self) -> CloudResult<Vec<String>> {
        Ok(self.world().clusters.keys().cloned().collect())
    }

    async fn describe_cluster(&self, name: &str) -> CloudResult<Option<EksCluster>> {
        let mut w = self.world();
        if !w.clusters.contains_key(name) {
            return Ok(None);
        }
        let key = format!("cluster/{name}");
        let settled = w.tick(&key);
        let failed = w.settles_failed(name);
        let Some(cluster) = w.clusters.get_mut(name) else {
            return Ok(None);
        };
        if settled {
            match cluster.status {
                ClusterStatus::Creating if failed => cluster.status = ClusterStatus::Failed,
                ClusterStatus::Creating | ClusterStatus::Updating => {
                    cluster.status = ClusterStatus::Active
                }
                ClusterStatus::Deleting => {
                    w.clusters.remove(name);
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(Some(cluster.clone()))
    }

    async fn create_cluster(&self, request: &CreateClusterRequest) -> CloudResult<EksCluster> {
        let mut w = self.world();
        w.mutate("CreateCluster", &request.name)?;
        if w.clusters.contains_key(&request.name) {
            return Err(CloudError::already_exists(
                "CreateCluster",
                format!("cluster {} already exists", request.name),
            ));
        }
        let vpc_id = request
            .subnet_ids
            .first()
            .and_then(|id| w.subnets.get(id))
            .map(|s| s.vpc_id.clone())
            .ok_or_else(|| {
                CloudError::new(
                    CloudErrorKind::InvalidRequest,
                    "CreateCluster",
                    "subnets must exist",
                )
            })?;
        let suffix = w.id("oidc");
        let region = &self.region;
        let cluster = EksCluster {
            name: request.name.clone(),
            arn: format!("arn:aws:eks:{region}:{ACCOUNT_ID}:cluster/{}", request.name),
            endpoint: Some(format!("https://{suffix}.gr7.{region}.eks.amazonaws.com")),
            certificate_authority: Some("LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0t".to_string()),
            version: request.version.clone(),
            status: ClusterStatus::Creating,
            role_arn: request.role_arn.clone(),
            vpc_config: ClusterVpcConfig {
                vpc_id,
                subnet_ids: request.subnet_ids.clone(),
                security_group_ids: request.security_group_ids.clone(),
                endpoint_public_access: request.endpoint_public_access,
                endpoint_private_access: request.endpoint_private_access,
                public_access_cidrs: request.public_access_cidrs.clone(),
            },
            oidc_issuer: Some(format!("https://oidc.eks.{region}.amazonaws.com/id/{suffix}")),
            encryption_key_arn: request.encryption_key_arn.clone(),
            enabled_logs: request.enabled_logs.clone(),
            tags: request.tags.clone(),
            created_at: Some(Utc::now()),
        };
        w.clusters.insert(request.name.clone(), cluster.clone());
        w.start_settling(&format!("cluster/{}", request.name));
        Ok(cluster)
    }

    async fn update_cluster_version(&self, name: &str, version: &str) -> CloudResult<String> {
        let mut w = self.world();
        w.mutate("UpdateClusterVersion", name)?;
        let update_id = w.id("update");
        let cluster = w
            .clusters
            .get_mut(name)
            .ok_or_else(|| not_found("UpdateClusterVersion", name))?;
        if cluster.status != ClusterStatus::Active {
            return Err(CloudError::new(
                CloudErrorKind::InvalidRequest,
                "UpdateClusterVersion",
                format!("cluster {name} is {}", cluster.status),
            ));
        }
        cluster.version = version.to_string();
        cluster.status = ClusterStatus::Updating;
        w.start_settling(&format!("cluster/{name}"));
        Ok(update_id)
    }

    async fn update_cluster_config(
        &self,
        name: &str,
        update: &ClusterConfigUpdate,
    ) -> CloudResult<String> {
        let mut w = self.world();
        w.mutate("UpdateClusterConfig", name)?;
        let update_id = w.id("update");
        let cluster = w
            .clusters
            .get_mut(name)
            .ok_or_else(|| not_found("UpdateClusterConfig", name))?;
        if cluster.status != ClusterStatus::Active {
            return Err(CloudError::new(
                CloudErrorKind::InvalidRequest,
                "UpdateClusterConfig",
                format!("cluster {name} is {}", cluster.status),
            ));
        }
        if let Some(access) = &update.endpoint_access {
            cluster.vpc_config.endpoint_public_access = access.endpoint_public_access;
            cluster.vpc_config.endpoint_private_access = access.endpoint_private_access;
            cluster.vpc_config.public_access_cidrs = access.public_access_cidrs.clone();
        }
        for log in &update.enable_logs {
            if !cluster.enabled_logs.contains(log) {
                cluster.enabled_logs.push(*log);
            }
        }
        cluster.enabled_logs.sort();
        cluster.status = ClusterStatus::Updating;
        w.start_settling(&format!("cluster/{name}"));
        Ok(update_id)
    }

    async fn delete_cluster(&self, name: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteCluster", name)?;
        if !w.clusters.contains_key(name) {
            return Err(not_found("DeleteCluster", name));
        }
        if w.nodegroups.keys().any(|(cluster, _)| cluster == name) {
            return Err(CloudError::new(
                CloudErrorKind::DependencyViolation,
                "DeleteCluster",
                format!("cluster {name} still has node groups"),
            ));
        }
        if let Some(cluster) = w.clusters.get_mut(name) {
            cluster.status = ClusterStatus::Deleting;
        }
        w.start_settling(&format!("cluster/{name}"));
        Ok(())
    }
}

#[async_trait]
impl NodeGroupApi for InMemoryCloud {
    async fn list_nodegroups(&self, cluster: &str) -> CloudResult<Vec<String>> {
        let w = self.world();
        if !w.clusters.contains_key(cluster) {
            return Err(not_found("ListNodegroups", cluster));
        }
        Ok(w.nodegroups
            .keys()
            .filter(|(c, _)| c == cluster)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn describe_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<Option<Nodegroup>> {
        let mut w = self.world();
        let key = (cluster.to_string(), name.to_string());
        if !w.nodegroups.contains_key(&key) {
            return Ok(None);
        }
        let settled = w.tick(&nodegroup_key(cluster, name));
        let failed = w.settles_failed(name);
        let Some(ng) = w.nodegroups.get_mut(&key) else {
            return Ok(None);
        };
        if settled {
            match ng.status {
                NodegroupStatus::Creating if failed => {
                    ng.status = NodegroupStatus::CreateFailed;
                    ng.health_issues = vec!["AsgInstanceLaunchFailures".to_string()];
                }
                NodegroupStatus::Creating | NodegroupStatus::Updating => {
                    ng.status = NodegroupStatus::Active;
                    ng.current_size = Some(ng.scaling.desired_size);
                }
                NodegroupStatus::Deleting => {
                    w.nodegroups.remove(&key);
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(Some(ng.clone()))
    }

    async fn create_nodegroup(&self, request: &CreateNodegroupRequest) -> CloudResult<Nodegroup> {
        let mut w = self.world();
        w.mutate("CreateNodegroup", &request.nodegroup_name)?;
        if !w.clusters.contains_key(&request.cluster_name) {
            return Err(not_found("CreateNodegroup", &request.cluster_name));
        }
        let key = (request.cluster_name.clone(), request.nodegroup_name.clone());
        if w.nodegroups.contains_key(&key) {
            return Err(CloudError::already_exists(
                "CreateNodegroup",
                format!("node group {} already exists", request.nodegroup_name),
            ));
        }
        let now = Utc::now();
        let ng = Nodegroup {
            name: request.nodegroup_name.clone(),
            arn: format!(
                "arn:aws:eks:{}:{ACCOUNT_ID}:nodegroup/{}/{}",
                self.region, request.cluster_name, request.nodegroup_name
            ),
            cluster_name: request.cluster_name.clone(),
            status: NodegroupStatus::Creating,
            instance_types: request.instance_types.clone(),
            scaling: request.scaling,
            current_size: None,
            subnets: request.subnets.clone(),
            node_role_arn: request.node_role_arn.clone(),
            ami_type: request.ami_type.clone(),
            disk_size: Some(request.disk_size),
            labels: request.labels.clone(),
            taints: request.taints.clone(),
            capacity_type: request.capacity_type,
            health_issues: Vec::new(),
            tags: request.tags.clone(),
            created_at: Some(now),
            modified_at: Some(now),
        };
        w.nodegroups.insert(key, ng.clone());
        w.start_settling(&nodegroup_key(&request.cluster_name, &request.nodegroup_name));
        Ok(ng)
    }

    async fn update_nodegroup_config(&self, update: &NodegroupConfigUpdate) -> CloudResult<String> {
        let mut w = self.world();
        w.mutate("UpdateNodegroupConfig", &update.nodegroup_name)?;
        let update_id = w.id("update");
        let key = (update.cluster_name.clone(), update.nodegroup_name.clone());
        let ng = w
            .nodegroups
            .get_mut(&key)
            .ok_or_else(|| not_found("UpdateNodegroupConfig", &update.nodegroup_name))?;
        if ng.status != NodegroupStatus::Active {
            return Err(CloudError::new(
                CloudErrorKind::InvalidRequest,
                "UpdateNodegroupConfig",
                format!("node group {} is {}", ng.name, ng.status),
            ));
        }
        if let Some(scaling) = update.scaling {
            ng.scaling = scaling;
        }
        for key in &update.remove_labels {
            ng.labels.remove(key);
        }
        ng.labels.extend(update.add_or_update_labels.clone());
        ng.taints.retain(|t| {
            !update
                .remove_taints
                .iter()
                .chain(update.add_or_update_taints.iter())
                .any(|r| r.key == t.key && r.effect == t.effect)
        });
        ng.taints.extend(update.add_or_update_taints.iter().cloned());
        ng.status = NodegroupStatus::Updating;
        ng.modified_at = Some(Utc::now());
        w.start_settling(&nodegroup_key(&update.cluster_name, &update.nodegroup_name));
        Ok(update_id)
    }

    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteNodegroup", name)?;
        let key = (cluster.to_string(), name.to_string());
        let ng = w
            .nodegroups
            .get_mut(&key)
            .ok_or_else(|| not_found("DeleteNodegroup", name))?;
        ng.status = NodegroupStatus::Deleting;
        w.start_settling(&nodegroup_key(cluster, name));
        Ok(())
    }
}

#[async_trait]
impl IamApi for InMemoryCloud {
    async fn get_role(&self, name: &str) -> CloudResult<Option<Role>> {
        Ok(self.world().roles.get(name).map(|r| r.role.clone()))
    }

    async fn create_role(
        &self,
        name: &str,
        assume_role_policy: &str,
        tags: &TagSet,
    ) -> CloudResult<Role> {
        let mut w = self.world();
        w.mutate("CreateRole", name)?;
        if w.roles.contains_key(name) {
            return Err(CloudError::already_exists(
                "CreateRole",
                format!("role {name} already exists"),
            ));
        }
        let role = Role {
            name: name.to_string(),
            arn: format!("arn:aws:iam::{ACCOUNT_ID}:role/{name}"),
            assume_role_policy: assume_role_policy.to_string(),
            tags: tags.clone(),
            created_at: Some(Utc::now()),
        };
        w.roles.insert(
            name.to_string(),
            RoleRecord {
                role: role.clone(),
                attached: BTreeSet::new(),
                inline: BTreeSet::new(),
            },
        );
        Ok(role)
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("AttachRolePolicy", role_name)?;
        let record = w
            .roles
            .get_mut(role_name)
            .ok_or_else(|| not_found("AttachRolePolicy", role_name))?;
        record.attached.insert(policy_arn.to_string());
        Ok(())
    }

    async fn list_attached_role_policies(&self, role_name: &str) -> CloudResult<Vec<String>> {
        self.world()
            .roles
            .get(role_name)
            .map(|r| r.attached.iter().cloned().collect())
            .ok_or_else(|| not_found("ListAttachedRolePolicies", role_name))
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DetachRolePolicy", role_name)?;
        let record = w
            .roles
            .get_mut(role_name)
            .ok_or_else(|| not_found("DetachRolePolicy", role_name))?;
        if record.attached.remove(policy_arn) {
            Ok(())
        } else {
            Err(not_found("DetachRolePolicy", policy_arn))
        }
    }

    async fn list_role_policies(&self, role_name: &str) -> CloudResult<Vec<String>> {
        self.world()
            .roles
            .get(role_name)
            .map(|r| r.inline.iter().cloned().collect())
            .ok_or_else(|| not_found("ListRolePolicies", role_name))
    }

    async fn delete_role_policy(&self, role_name: &str, policy_name: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteRolePolicy", role_name)?;
        let record = w
            .roles
            .get_mut(role_name)
            .ok_or_else(|| not_found("DeleteRolePolicy", role_name))?;
        if record.inline.remove(policy_name) {
            Ok(())
        } else {
            Err(not_found("DeleteRolePolicy", policy_name))
        }
    }

    async fn delete_role(&self, role_name: &str) -> CloudResult<()> {
        let mut w = self.world();
        w.mutate("DeleteRole", role_name)?;
        match w.roles.get(role_name) {
            None => Err(not_found("DeleteRole", role_name)),
            Some(r) if !r.attached.is_empty() || !r.inline.is_empty() => Err(CloudError::new(
                CloudErrorKind::DependencyViolation,
                "DeleteRole",
                format!("role {role_name} still has policies"),
            )),
            Some(_) => {
                w.roles.remove(role_name);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nat_gateway_settles_after_configured_polls() {
        let cloud = InMemoryCloud::default();
        cloud.set_settle_polls(2);
        let vpc = cloud.create_vpc("10.0.0.0/16", &TagSet::new()).await.unwrap();
        let subnet = cloud
            .create_subnet(&CreateSubnetRequest {
                vpc_id: vpc.id.clone(),
                cidr_block: "10.0.0.0/20".to_string(),
                availability_zone: "us-west-2a".to_string(),
                map_public_ip_on_launch: true,
                tags: TagSet::new(),
            })
            .await
            .unwrap();
        let eip = cloud.allocate_address(&TagSet::new()).await.unwrap();
        let nat = cloud.create_nat_gateway(&subnet.id, &eip, &TagSet::new()).await.unwrap();
        assert_eq!(nat.state, NatGatewayState::Pending);

        let state = |nats: Vec<NatGateway>| nats[0].state;
        assert_eq!(state(cloud.describe_nat_gateways(&vpc.id).await.unwrap()), NatGatewayState::Pending);
        assert_eq!(state(cloud.describe_nat_gateways(&vpc.id).await.unwrap()), NatGatewayState::Pending);
        assert_eq!(state(cloud.describe_nat_gateways(&vpc.id).await.unwrap()), NatGatewayState::Available);
        assert_eq!(cloud.mutation_count(), 4);
    }

    #[tokio::test]
    async fn injected_error_targets_matching_calls() {
        let cloud = InMemoryCloud::default();
        cloud.inject_error("CreateRole", "node", CloudErrorKind::Throttled);
        assert!(cloud.create_role("demo-cluster-role", "{}", &TagSet::new()).await.is_ok());
        let err = cloud
            .create_role("demo-node-role", "{}", &TagSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, CloudErrorKind::Throttled);
        assert_eq!(cloud.calls("CreateRole"), 2);
    }

    #[tokio::test]
    async fn duplicate_ingress_rule_is_reported() {
        let cloud = InMemoryCloud::default();
        let vpc = cloud.create_vpc("10.0.0.0/16", &TagSet::new()).await.unwrap();
        let sg = cloud
            .create_security_group(&vpc.id, "sg", "test", &TagSet::new())
            .await
            .unwrap();
        let rule = SecurityGroupRule {
            protocol: IpProtocol::Tcp,
            from_port: 443,
            to_port: 443,
            source: RuleSource::Group(sg.id.clone()),
            description: "https".to_string(),
        };
        cloud.authorize_ingress(&sg.id, &[rule.clone()]).await.unwrap();
        let err = cloud.authorize_ingress(&sg.id, &[rule]).await.unwrap_err();
        assert!(err.is_duplicate_rule());
    }
}
