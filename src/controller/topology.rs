//! Network topology builder
//!
//! Builds (or resumes) the owned VPC and everything inside it, one step at a
//! time. Every step first looks at what discovery found and only creates what
//! is missing, so a pass interrupted half way resumes at the first missing
//! piece. Teardown walks the same resources in reverse dependency order.

use std::collections::{BTreeMap, BTreeSet};

use ipnet::Ipv4Net;
use tracing::{debug, info, instrument, warn};

use super::cidr::{subnet_layout, MAX_ZONES};
use super::context::ReconcileContext;
use super::summary::Change;
use super::waiter::{wait_until, Poll};
use crate::cloud::{
    ignore_not_found, CreateSubnetRequest, CreateVpcEndpointRequest, IpProtocol, NatGateway,
    NatGatewayState, NetworkApi, Route, RouteTable, RouteTarget, RuleSource, SecurityGroup,
    SecurityGroupRule, Subnet, TagSet, VpcEndpoint, VpcEndpointState, VpcEndpointType,
};
use crate::config::settings::MIN_ZONE_COUNT;
use crate::config::{parse_network_cidr, ClusterConfig, EngineSettings, ZoneSelection};
use crate::discovery::discover_inventory;
use crate::error::{Error, Result};
use crate::state::{NetworkInventory, NetworkState, PRIVATE_TIER, PUBLIC_TIER};
use crate::tags::{tags_for, ResourceKind, NAME_KEY, SUBNET_TIER_KEY, ZONE_KEY};

/// Interface endpoints a fully private cluster needs for node bootstrap
pub const INTERFACE_ENDPOINT_SERVICES: [&str; 7] = [
    "eks",
    "ec2",
    "ecr.api",
    "ecr.dkr",
    "logs",
    "sts",
    "elasticloadbalancing",
];
/// Gateway endpoint bound to the private route tables
pub const GATEWAY_ENDPOINT_SERVICE: &str = "s3";

const DEFAULT_ROUTE: &str = "0.0.0.0/0";
const ELB_ROLE_TAG: &str = "kubernetes.io/role/elb";
const INTERNAL_ELB_ROLE_TAG: &str = "kubernetes.io/role/internal-elb";

/// Regional service name of a private endpoint
pub fn endpoint_service_name(region: &str, service: &str) -> String {
    format!("com.amazonaws.{region}.{service}")
}

/// Rules of the cluster security group
///
/// Ingress is self-referencing (API server, kubelet, DNS); egress is open.
pub fn cluster_security_group_rules(group_id: &str) -> (Vec<SecurityGroupRule>, Vec<SecurityGroupRule>) {
    let own = |protocol, port, description: &str| SecurityGroupRule {
        protocol,
        from_port: port,
        to_port: port,
        source: RuleSource::Group(group_id.to_string()),
        description: description.to_string(),
    };
    let ingress = vec![
        own(IpProtocol::Tcp, 443, "Kubernetes API server"),
        own(IpProtocol::Tcp, 10250, "kubelet"),
        own(IpProtocol::Tcp, 53, "cluster DNS (tcp)"),
        own(IpProtocol::Udp, 53, "cluster DNS (udp)"),
    ];
    let egress = vec![SecurityGroupRule {
        protocol: IpProtocol::All,
        from_port: -1,
        to_port: -1,
        source: RuleSource::Cidr(DEFAULT_ROUTE.to_string()),
        description: "all outbound".to_string(),
    }];
    (ingress, egress)
}

/// Zones the network spans: the explicit list, or the first N available
///
/// # Errors
///
/// [`Error::Configuration`] when fewer than two (or more than eight) zones result.
pub async fn resolve_zones<C>(
    cloud: &C,
    desired: &ClusterConfig,
    settings: &EngineSettings,
) -> Result<Vec<String>>
where
    C: NetworkApi + ?Sized,
{
    let zones: Vec<String> = match &desired.availability_zones {
        ZoneSelection::Explicit(zones) => zones.clone(),
        ZoneSelection::Auto => cloud
            .describe_availability_zones()
            .await?
            .into_iter()
            .take(settings.default_zone_count.min(MAX_ZONES))
            .collect(),
    };

    if zones.len() < MIN_ZONE_COUNT {
        return Err(Error::configuration(
            "availabilityZones",
            format!(
                "at least {MIN_ZONE_COUNT} availability zones are required, {} available",
                zones.len()
            ),
        ));
    }
    if zones.len() > MAX_ZONES {
        return Err(Error::configuration(
            "availabilityZones",
            format!("at most {MAX_ZONES} availability zones fit in a /16, got {}", zones.len()),
        ));
    }
    Ok(zones)
}

/// Public/private subnet pair of one zone, as it exists in the provider
#[derive(Clone, Debug)]
struct ZoneNetwork {
    zone: String,
    public: Subnet,
    private: Subnet,
}

fn tagged(kind: ResourceKind, desired: &ClusterConfig, name: String, extra: &[(&str, &str)]) -> TagSet {
    let mut tags = desired.tags.clone();
    tags.insert(NAME_KEY.to_string(), name);
    for (key, value) in extra {
        tags.insert((*key).to_string(), (*value).to_string());
    }
    tags_for(kind, &desired.name, &tags)
}

/// Build or resume the owned network, then return it as freshly discovered
///
/// `actual` is the inventory discovery found before the call (if any).
///
/// # Errors
///
/// Any step failure aborts the build. A VPC CIDR change or a subnet found in a
/// different zone is [`Error::ImmutableField`].
#[instrument(skip_all, fields(cluster = %desired.name))]
pub async fn ensure_network<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    actual: Option<NetworkInventory>,
) -> Result<NetworkState>
where
    C: NetworkApi + ?Sized,
{
    let network = parse_network_cidr(&desired.network_cidr)
        .map_err(|message| Error::configuration("networkCidr", message))?;
    let zones = resolve_zones(cloud, desired, &ctx.settings).await?;
    let mutations_before = ctx.summary().mutations();

    let mut inventory = match actual {
        Some(inventory) => {
            check_vpc_cidr(&inventory, network)?;
            inventory
        }
        None => create_vpc(cloud, ctx, desired, network).await?,
    };

    if !inventory.vpc.dns_enabled {
        cloud.enable_vpc_dns(&inventory.vpc.id).await?;
        inventory.vpc.dns_enabled = true;
        if ctx.summary().mutations() == mutations_before {
            ctx.record(ResourceKind::Vpc, &inventory.vpc.id, Change::Updated);
        }
    }

    let igw_id = ensure_internet_gateway(cloud, ctx, desired, &inventory).await?;
    let zonal = ensure_subnets(cloud, ctx, desired, &inventory, network, &zones).await?;
    let nat_ids = ensure_nat_gateways(cloud, ctx, desired, &inventory, &zonal).await?;
    let private_route_tables =
        ensure_route_tables(cloud, ctx, desired, &inventory, &zonal, &igw_id, &nat_ids).await?;
    let group_id = ensure_security_group(cloud, ctx, desired, &inventory).await?;

    if desired.endpoint_access.requires_private_endpoints() {
        ensure_endpoints(
            cloud,
            ctx,
            desired,
            &inventory,
            &zonal,
            &group_id,
            &private_route_tables,
        )
        .await?;
    }

    if ctx.summary().mutations() == mutations_before {
        ctx.record(ResourceKind::Vpc, &inventory.vpc.id, Change::Unchanged);
    }

    let inventory = discover_inventory(cloud, &desired.name).await?.ok_or_else(|| {
        Error::Discovery(format!(
            "network {} is no longer discoverable after the build",
            inventory.vpc.id
        ))
    })?;
    Ok(inventory.to_state())
}

fn check_vpc_cidr(inventory: &NetworkInventory, desired: Ipv4Net) -> Result<()> {
    let current = inventory.vpc.cidr_block.parse::<Ipv4Net>().ok();
    if current.map(|net| net.trunc()) != Some(desired) {
        return Err(Error::immutable(
            format!("network {}", inventory.vpc.id),
            "networkCidr",
            &inventory.vpc.cidr_block,
            desired,
        ));
    }
    Ok(())
}

async fn create_vpc<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    network: Ipv4Net,
) -> Result<NetworkInventory>
where
    C: NetworkApi + ?Sized,
{
    let tags = tagged(ResourceKind::Vpc, desired, format!("{}-vpc", desired.name), &[]);
    let mut vpc = cloud.create_vpc(&network.to_string(), &tags).await?;
    cloud.enable_vpc_dns(&vpc.id).await?;
    vpc.dns_enabled = true;

    info!(vpc_id = %vpc.id, cidr = %network, "Created VPC");
    ctx.record(ResourceKind::Vpc, &vpc.id, Change::Created);
    Ok(NetworkInventory::empty(vpc))
}

async fn ensure_internet_gateway<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    inventory: &NetworkInventory,
) -> Result<String>
where
    C: NetworkApi + ?Sized,
{
    let vpc_id = &inventory.vpc.id;
    match inventory.internet_gateways.first() {
        Some(igw) if igw.attached_vpc_ids.contains(vpc_id) => Ok(igw.id.clone()),
        Some(igw) => {
            cloud.attach_internet_gateway(&igw.id, vpc_id).await?;
            ctx.record(ResourceKind::InternetGateway, &igw.id, Change::Updated);
            Ok(igw.id.clone())
        }
        None => {
            let tags = tagged(
                ResourceKind::InternetGateway,
                desired,
                format!("{}-igw", desired.name),
                &[],
            );
            let igw = cloud.create_internet_gateway(&tags).await?;
            cloud.attach_internet_gateway(&igw.id, vpc_id).await?;
            info!(igw_id = %igw.id, %vpc_id, "Created internet gateway");
            ctx.record(ResourceKind::InternetGateway, &igw.id, Change::Created);
            Ok(igw.id)
        }
    }
}

async fn ensure_subnets<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    inventory: &NetworkInventory,
    network: Ipv4Net,
    zones: &[String],
) -> Result<Vec<ZoneNetwork>>
where
    C: NetworkApi + ?Sized,
{
    let layout = subnet_layout(network, zones);
    let mut zonal = Vec::with_capacity(layout.len());

    for entry in &layout {
        let public = ensure_subnet(cloud, ctx, desired, inventory, &entry.zone, entry.public, PUBLIC_TIER).await?;
        let private =
            ensure_subnet(cloud, ctx, desired, inventory, &entry.zone, entry.private, PRIVATE_TIER).await?;
        zonal.push(ZoneNetwork {
            zone: entry.zone.clone(),
            public,
            private,
        });
    }

    let expected: BTreeSet<String> = layout
        .iter()
        .flat_map(|entry| [entry.public.to_string(), entry.private.to_string()])
        .collect();
    for stray in inventory.subnets.iter().filter(|s| !expected.contains(&s.cidr_block)) {
        warn!(
            subnet_id = %stray.id,
            cidr = %stray.cidr_block,
            zone = %stray.availability_zone,
            "Owned subnet is outside the current zone layout and is left in place"
        );
    }

    Ok(zonal)
}

async fn ensure_subnet<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    inventory: &NetworkInventory,
    zone: &str,
    cidr: Ipv4Net,
    tier: &str,
) -> Result<Subnet>
where
    C: NetworkApi + ?Sized,
{
    let cidr_block = cidr.to_string();
    if let Some(existing) = inventory.subnets.iter().find(|s| s.cidr_block == cidr_block) {
        if existing.availability_zone != zone {
            return Err(Error::immutable(
                format!("subnet {}", existing.id),
                "availabilityZone",
                &existing.availability_zone,
                zone,
            ));
        }
        return Ok(existing.clone());
    }

    let elb_role = if tier == PUBLIC_TIER {
        ELB_ROLE_TAG
    } else {
        INTERNAL_ELB_ROLE_TAG
    };
    let cluster_tag = format!("kubernetes.io/cluster/{}", desired.name);
    let tags = tagged(
        ResourceKind::Subnet,
        desired,
        format!("{}-{tier}-{zone}", desired.name),
        &[
            (SUBNET_TIER_KEY, tier),
            (ZONE_KEY, zone),
            (elb_role, "1"),
            (cluster_tag.as_str(), "shared"),
        ],
    );

    let subnet = cloud
        .create_subnet(&CreateSubnetRequest {
            vpc_id: inventory.vpc.id.clone(),
            cidr_block,
            availability_zone: zone.to_string(),
            map_public_ip_on_launch: tier == PUBLIC_TIER,
            tags,
        })
        .await?;
    info!(subnet_id = %subnet.id, cidr = %subnet.cidr_block, zone, tier, "Created subnet");
    ctx.record(ResourceKind::Subnet, &subnet.id, Change::Created);
    Ok(subnet)
}

/// One NAT gateway per public subnet; returns NAT ids in zone order
async fn ensure_nat_gateways<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    inventory: &NetworkInventory,
    zonal: &[ZoneNetwork],
) -> Result<Vec<String>>
where
    C: NetworkApi + ?Sized,
{
    let mut free_addresses = inventory
        .addresses
        .iter()
        .filter(|eip| eip.associated_with.is_none())
        .map(|eip| eip.allocation_id.clone());

    let mut nat_ids = Vec::with_capacity(zonal.len());
    let mut waiting = BTreeSet::new();

    for zone in zonal {
        // A failed gateway never recovers; it is replaced and removed on teardown
        let (failed, live): (Vec<&NatGateway>, Vec<&NatGateway>) = inventory
            .nat_gateways
            .iter()
            .filter(|nat| nat.subnet_id == zone.public.id)
            .partition(|nat| nat.state == NatGatewayState::Failed);
        let existing = live.first().copied();
        if existing.is_none() {
            for nat in &failed {
                warn!(nat_gateway_id = %nat.id, zone = %zone.zone, "Replacing failed NAT gateway");
            }
        }
        if let Some(nat) = existing {
            if nat.state != NatGatewayState::Available {
                waiting.insert(nat.id.clone());
            }
            nat_ids.push(nat.id.clone());
            continue;
        }

        let allocation_id = match free_addresses.next() {
            Some(id) => {
                debug!(allocation_id = %id, "Reusing unassociated elastic address");
                id
            }
            None => {
                let tags = tagged(
                    ResourceKind::ElasticIp,
                    desired,
                    format!("{}-nat-{}", desired.name, zone.zone),
                    &[(ZONE_KEY, zone.zone.as_str())],
                );
                let id = cloud.allocate_address(&tags).await?;
                ctx.record(ResourceKind::ElasticIp, &id, Change::Created);
                id
            }
        };

        let tags = tagged(
            ResourceKind::NatGateway,
            desired,
            format!("{}-nat-{}", desired.name, zone.zone),
            &[(ZONE_KEY, zone.zone.as_str())],
        );
        let nat = cloud
            .create_nat_gateway(&zone.public.id, &allocation_id, &tags)
            .await?;
        info!(nat_gateway_id = %nat.id, zone = %zone.zone, "Created NAT gateway");
        ctx.record(ResourceKind::NatGateway, &nat.id, Change::Created);
        waiting.insert(nat.id.clone());
        nat_ids.push(nat.id);
    }

    if !waiting.is_empty() {
        ctx.progress(
            ResourceKind::NatGateway,
            "wait",
            format!("Waiting for {} NAT gateway(s) to become available", waiting.len()),
        );
        let timeouts = ctx.timeouts();
        let vpc_id = inventory.vpc.id.as_str();
        let watched = &waiting;
        wait_until(
            &format!("NAT gateways in {vpc_id}"),
            timeouts.nat_gateway,
            timeouts.poll_interval,
            move || async move {
                let nats = cloud.describe_nat_gateways(vpc_id).await?;
                Ok(nat_gateways_ready(nats, watched))
            },
        )
        .await?;
    }

    Ok(nat_ids)
}

fn nat_gateways_ready(nats: Vec<NatGateway>, watched: &BTreeSet<String>) -> Poll<()> {
    let nats: Vec<_> = nats.into_iter().filter(|n| watched.contains(&n.id)).collect();
    if let Some(failed) = nats.iter().find(|n| n.state == NatGatewayState::Failed) {
        return Poll::Failed {
            status: "failed".to_string(),
            reason: failed
                .failure_message
                .clone()
                .unwrap_or_else(|| format!("NAT gateway {} failed", failed.id)),
        };
    }
    let available = nats
        .iter()
        .filter(|n| n.state == NatGatewayState::Available)
        .count();
    if available == watched.len() {
        Poll::Ready(())
    } else {
        Poll::Pending(format!("{available}/{} available", watched.len()))
    }
}

/// Public table to the IGW, one private table per zone to that zone's NAT.
/// Returns the private route table ids in zone order.
async fn ensure_route_tables<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    inventory: &NetworkInventory,
    zonal: &[ZoneNetwork],
    igw_id: &str,
    nat_ids: &[String],
) -> Result<Vec<String>>
where
    C: NetworkApi + ?Sized,
{
    let public_subnets: Vec<&str> = zonal.iter().map(|z| z.public.id.as_str()).collect();
    ensure_route_table(
        cloud,
        ctx,
        desired,
        inventory,
        inventory.route_tables_in_tier(PUBLIC_TIER).next(),
        PUBLIC_TIER,
        None,
        RouteTarget::InternetGateway(igw_id.to_string()),
        &public_subnets,
    )
    .await?;

    let mut private_ids = Vec::with_capacity(zonal.len());
    for (zone, nat_id) in zonal.iter().zip(nat_ids) {
        let existing = inventory
            .route_tables_in_tier(PRIVATE_TIER)
            .find(|rt| rt.tags.get(ZONE_KEY) == Some(&zone.zone));
        let id = ensure_route_table(
            cloud,
            ctx,
            desired,
            inventory,
            existing,
            PRIVATE_TIER,
            Some(&zone.zone),
            RouteTarget::NatGateway(nat_id.clone()),
            &[zone.private.id.as_str()],
        )
        .await?;
        private_ids.push(id);
    }
    Ok(private_ids)
}

#[allow(clippy::too_many_arguments)]
async fn ensure_route_table<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    inventory: &NetworkInventory,
    existing: Option<&RouteTable>,
    tier: &str,
    zone: Option<&str>,
    target: RouteTarget,
    subnets: &[&str],
) -> Result<String>
where
    C: NetworkApi + ?Sized,
{
    let (table, created) = match existing {
        Some(table) => (table.clone(), false),
        None => {
            let name = match zone {
                Some(zone) => format!("{}-{tier}-{zone}", desired.name),
                None => format!("{}-{tier}", desired.name),
            };
            let mut extra = vec![(SUBNET_TIER_KEY, tier)];
            if let Some(zone) = zone {
                extra.push((ZONE_KEY, zone));
            }
            let tags = tagged(ResourceKind::RouteTable, desired, name, &extra);
            let table = cloud.create_route_table(&inventory.vpc.id, &tags).await?;
            info!(route_table_id = %table.id, tier, "Created route table");
            (table, true)
        }
    };

    let mut changed = false;
    if !table.has_default_route_to(&target) {
        let route = Route {
            destination_cidr: DEFAULT_ROUTE.to_string(),
            target,
        };
        cloud.create_route(&table.id, &route).await?;
        changed = true;
    }
    for subnet_id in subnets {
        if !table.is_associated_with(subnet_id) {
            cloud.associate_route_table(&table.id, subnet_id).await?;
            changed = true;
        }
    }

    if created {
        ctx.record(ResourceKind::RouteTable, &table.id, Change::Created);
    } else if changed {
        ctx.record(ResourceKind::RouteTable, &table.id, Change::Updated);
    }
    Ok(table.id)
}

fn has_rule(existing: &[SecurityGroupRule], rule: &SecurityGroupRule) -> bool {
    existing.iter().any(|e| {
        e.protocol == rule.protocol
            && e.from_port == rule.from_port
            && e.to_port == rule.to_port
            && e.source == rule.source
    })
}

/// Authorize `rules`, treating a duplicate-rule rejection as already satisfied
async fn authorize_missing<C>(
    cloud: &C,
    group: &SecurityGroup,
    rules: Vec<SecurityGroupRule>,
    ingress: bool,
) -> Result<bool>
where
    C: NetworkApi + ?Sized,
{
    let current = if ingress { &group.ingress } else { &group.egress };
    let missing: Vec<_> = rules.into_iter().filter(|r| !has_rule(current, r)).collect();
    if missing.is_empty() {
        return Ok(false);
    }

    let result = if ingress {
        cloud.authorize_ingress(&group.id, &missing).await
    } else {
        cloud.authorize_egress(&group.id, &missing).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_duplicate_rule() => {
            debug!(group_id = %group.id, ingress, "Rules already present");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn ensure_security_group<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    inventory: &NetworkInventory,
) -> Result<String>
where
    C: NetworkApi + ?Sized,
{
    let (group, created) = match inventory.security_groups.first() {
        Some(group) => (group.clone(), false),
        None => {
            let name = format!("{}-cluster", desired.name);
            let tags = tagged(ResourceKind::SecurityGroup, desired, name.clone(), &[]);
            let group = cloud
                .create_security_group(
                    &inventory.vpc.id,
                    &name,
                    "Cluster communication for the control plane and worker nodes",
                    &tags,
                )
                .await?;
            info!(group_id = %group.id, "Created cluster security group");
            (group, true)
        }
    };

    let (ingress, egress) = cluster_security_group_rules(&group.id);
    let ingress_changed = authorize_missing(cloud, &group, ingress, true).await?;
    let egress_changed = authorize_missing(cloud, &group, egress, false).await?;

    if created {
        ctx.record(ResourceKind::SecurityGroup, &group.id, Change::Created);
    } else if ingress_changed || egress_changed {
        ctx.record(ResourceKind::SecurityGroup, &group.id, Change::Updated);
    }
    Ok(group.id)
}

async fn ensure_endpoints<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    inventory: &NetworkInventory,
    zonal: &[ZoneNetwork],
    group_id: &str,
    private_route_tables: &[String],
) -> Result<()>
where
    C: NetworkApi + ?Sized,
{
    let existing: BTreeMap<&str, &VpcEndpoint> = inventory
        .endpoints
        .iter()
        .map(|ep| (ep.service_name.as_str(), ep))
        .collect();
    let private_subnets: Vec<String> = zonal.iter().map(|z| z.private.id.clone()).collect();
    let mut waiting = BTreeSet::new();

    for service in INTERFACE_ENDPOINT_SERVICES {
        let service_name = endpoint_service_name(&desired.region, service);
        if let Some(endpoint) = existing.get(service_name.as_str()) {
            if endpoint.state != VpcEndpointState::Available {
                waiting.insert(endpoint.id.clone());
            }
            continue;
        }

        let endpoint = cloud
            .create_vpc_endpoint(&CreateVpcEndpointRequest {
                vpc_id: inventory.vpc.id.clone(),
                service_name,
                endpoint_type: VpcEndpointType::Interface,
                subnet_ids: private_subnets.clone(),
                security_group_ids: vec![group_id.to_string()],
                route_table_ids: Vec::new(),
                private_dns_enabled: true,
                tags: tagged(
                    ResourceKind::VpcEndpoint,
                    desired,
                    format!("{}-{service}", desired.name),
                    &[],
                ),
            })
            .await?;
        info!(endpoint_id = %endpoint.id, service, "Created interface endpoint");
        ctx.record(ResourceKind::VpcEndpoint, &endpoint.id, Change::Created);
        waiting.insert(endpoint.id);
    }

    let gateway_service = endpoint_service_name(&desired.region, GATEWAY_ENDPOINT_SERVICE);
    if !existing.contains_key(gateway_service.as_str()) {
        let endpoint = cloud
            .create_vpc_endpoint(&CreateVpcEndpointRequest {
                vpc_id: inventory.vpc.id.clone(),
                service_name: gateway_service,
                endpoint_type: VpcEndpointType::Gateway,
                subnet_ids: Vec::new(),
                security_group_ids: Vec::new(),
                route_table_ids: private_route_tables.to_vec(),
                private_dns_enabled: false,
                tags: tagged(
                    ResourceKind::VpcEndpoint,
                    desired,
                    format!("{}-{GATEWAY_ENDPOINT_SERVICE}", desired.name),
                    &[],
                ),
            })
            .await?;
        info!(endpoint_id = %endpoint.id, "Created gateway endpoint");
        ctx.record(ResourceKind::VpcEndpoint, &endpoint.id, Change::Created);
    }

    if waiting.is_empty() {
        return Ok(());
    }

    ctx.progress(
        ResourceKind::VpcEndpoint,
        "wait",
        format!("Waiting for {} endpoint(s) to become available", waiting.len()),
    );
    let timeouts = ctx.timeouts();
    let vpc_id = inventory.vpc.id.as_str();
    let watched = &waiting;
    wait_until(
        &format!("endpoints in {vpc_id}"),
        timeouts.vpc_endpoint,
        timeouts.poll_interval,
        move || async move {
            let endpoints: Vec<_> = cloud
                .describe_vpc_endpoints(vpc_id)
                .await?
                .into_iter()
                .filter(|ep| watched.contains(&ep.id))
                .collect();
            if let Some(failed) = endpoints.iter().find(|ep| ep.state == VpcEndpointState::Failed) {
                return Ok(Poll::Failed {
                    status: "failed".to_string(),
                    reason: format!("endpoint {} for {} failed", failed.id, failed.service_name),
                });
            }
            let available = endpoints
                .iter()
                .filter(|ep| ep.state == VpcEndpointState::Available)
                .count();
            Ok(if available == watched.len() {
                Poll::Ready(())
            } else {
                Poll::Pending(format!("{available}/{} available", watched.len()))
            })
        },
    )
    .await
}

/// Delete every owned network resource in reverse dependency order
///
/// Resources already gone are skipped.
#[instrument(skip_all, fields(vpc_id = %inventory.vpc.id))]
pub async fn teardown_network<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    inventory: &NetworkInventory,
) -> Result<()>
where
    C: NetworkApi + ?Sized,
{
    let timeouts = ctx.timeouts();
    let vpc_id = inventory.vpc.id.as_str();

    if !inventory.endpoints.is_empty() {
        let ids: Vec<String> = inventory.endpoints.iter().map(|ep| ep.id.clone()).collect();
        ignore_not_found(cloud.delete_vpc_endpoints(&ids).await)?;
        for id in &ids {
            ctx.record(ResourceKind::VpcEndpoint, id, Change::Deleted);
        }
        ctx.progress(ResourceKind::VpcEndpoint, "wait", "Waiting for endpoints to be deleted");
        let watched: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let watched = &watched;
        wait_until(
            &format!("endpoint deletion in {vpc_id}"),
            timeouts.vpc_endpoint,
            timeouts.poll_interval,
            move || async move {
                let remaining = cloud
                    .describe_vpc_endpoints(vpc_id)
                    .await?
                    .into_iter()
                    .filter(|ep| watched.contains(ep.id.as_str()) && ep.state != VpcEndpointState::Deleted)
                    .count();
                Ok(if remaining == 0 {
                    Poll::Ready(())
                } else {
                    Poll::Pending(format!("{remaining} remaining"))
                })
            },
        )
        .await?;
    }

    if !inventory.nat_gateways.is_empty() {
        for nat in &inventory.nat_gateways {
            ignore_not_found(cloud.delete_nat_gateway(&nat.id).await)?;
            ctx.record(ResourceKind::NatGateway, &nat.id, Change::Deleted);
        }
        ctx.progress(ResourceKind::NatGateway, "wait", "Waiting for NAT gateways to be deleted");
        let watched: BTreeSet<&str> = inventory.nat_gateways.iter().map(|n| n.id.as_str()).collect();
        let watched = &watched;
        wait_until(
            &format!("NAT gateway deletion in {vpc_id}"),
            timeouts.nat_gateway,
            timeouts.poll_interval,
            move || async move {
                let remaining = cloud
                    .describe_nat_gateways(vpc_id)
                    .await?
                    .into_iter()
                    .filter(|n| watched.contains(n.id.as_str()) && n.state != NatGatewayState::Deleted)
                    .count();
                Ok(if remaining == 0 {
                    Poll::Ready(())
                } else {
                    Poll::Pending(format!("{remaining} remaining"))
                })
            },
        )
        .await?;
    }

    for eip in &inventory.addresses {
        ignore_not_found(cloud.release_address(&eip.allocation_id).await)?;
        ctx.record(ResourceKind::ElasticIp, &eip.allocation_id, Change::Deleted);
    }

    for table in &inventory.route_tables {
        for association in table.associations.iter().filter(|a| !a.main) {
            ignore_not_found(cloud.disassociate_route_table(&association.id).await)?;
        }
        ignore_not_found(cloud.delete_route_table(&table.id).await)?;
        ctx.record(ResourceKind::RouteTable, &table.id, Change::Deleted);
    }

    for group in &inventory.security_groups {
        ignore_not_found(cloud.delete_security_group(&group.id).await)?;
        ctx.record(ResourceKind::SecurityGroup, &group.id, Change::Deleted);
    }

    for subnet in &inventory.subnets {
        ignore_not_found(cloud.delete_subnet(&subnet.id).await)?;
        ctx.record(ResourceKind::Subnet, &subnet.id, Change::Deleted);
    }

    for igw in &inventory.internet_gateways {
        if igw.attached_vpc_ids.iter().any(|v| v == vpc_id) {
            ignore_not_found(cloud.detach_internet_gateway(&igw.id, vpc_id).await)?;
        }
        ignore_not_found(cloud.delete_internet_gateway(&igw.id).await)?;
        ctx.record(ResourceKind::InternetGateway, &igw.id, Change::Deleted);
    }

    ignore_not_found(cloud.delete_vpc(vpc_id).await)?;
    info!(%vpc_id, "Deleted network");
    ctx.record(ResourceKind::Vpc, vpc_id, Change::Deleted);
    Ok(())
}
