//! Topology builder tests against the in-memory provider

use super::context::ReconcileContext;
use super::summary::Change;
use super::topology::*;
use crate::cloud::memory::InMemoryCloud;
use crate::cloud::{
    CloudError, CloudErrorKind, IpProtocol, MockNetworkApi, NetworkApi, RuleSource, TagSet,
};
use crate::config::{ClusterConfig, EndpointAccess, ZoneSelection};
use crate::discovery::discover_inventory;
use crate::error::Error;
use crate::tags::{CLUSTER_KEY, MANAGED_BY_KEY};

fn desired() -> ClusterConfig {
    let mut config = ClusterConfig::new("demo", "us-west-2");
    config.network_cidr = "10.10.0.0/16".to_string();
    config
}

async fn build(cloud: &InMemoryCloud, config: &ClusterConfig) -> crate::error::Result<crate::state::NetworkState> {
    let ctx = ReconcileContext::default();
    let actual = discover_inventory(cloud, &config.name).await?;
    ensure_network(cloud, &ctx, config, actual).await
}

fn cidr_of(cloud: &InMemoryCloud, subnet_id: &str) -> String {
    cloud
        .subnets()
        .into_iter()
        .find(|s| s.id == subnet_id)
        .map(|s| s.cidr_block)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn fresh_build_creates_the_full_layout() {
    let cloud = InMemoryCloud::default();
    let ctx = ReconcileContext::default();

    let network = ensure_network(&cloud, &ctx, &desired(), None).await.unwrap();

    assert_eq!(
        network.availability_zones,
        vec!["us-west-2a", "us-west-2b", "us-west-2c"]
    );
    let public: Vec<_> = network
        .public_subnet_ids
        .iter()
        .map(|id| cidr_of(&cloud, id))
        .collect();
    let private: Vec<_> = network
        .private_subnet_ids
        .iter()
        .map(|id| cidr_of(&cloud, id))
        .collect();
    assert_eq!(public, vec!["10.10.0.0/20", "10.10.16.0/20", "10.10.32.0/20"]);
    assert_eq!(private, vec!["10.10.128.0/20", "10.10.144.0/20", "10.10.160.0/20"]);

    assert!(network.internet_gateway_id.is_some());
    assert_eq!(network.nat_gateway_ids.len(), 3);
    assert_eq!(network.public_route_table_ids.len(), 1);
    assert_eq!(network.private_route_table_ids.len(), 3);
    assert_eq!(network.security_group_ids.len(), 1);
    assert!(network.endpoint_ids.is_empty());

    // vpc, igw, 6 subnets, 3 addresses, 3 NATs, 4 route tables, 1 security group
    assert_eq!(ctx.summary().count(Change::Created), 19);
}

#[tokio::test(start_paused = true)]
async fn security_group_rules_are_self_referencing() {
    let cloud = InMemoryCloud::default();
    let network = build(&cloud, &desired()).await.unwrap();

    let group = cloud.security_groups().pop().unwrap();
    assert_eq!(Some(group.id.as_str()), network.cluster_security_group_id());
    assert_eq!(group.ingress.len(), 4);
    assert!(group
        .ingress
        .iter()
        .all(|r| r.source == RuleSource::Group(group.id.clone())));
    assert!(group
        .ingress
        .iter()
        .any(|r| r.protocol == IpProtocol::Udp && r.from_port == 53));
    assert_eq!(group.egress.len(), 1);
    assert_eq!(group.egress[0].protocol, IpProtocol::All);
}

#[tokio::test(start_paused = true)]
async fn second_build_issues_no_mutations() {
    let cloud = InMemoryCloud::default();
    let first = build(&cloud, &desired()).await.unwrap();
    cloud.reset_counters();

    let ctx = ReconcileContext::default();
    let actual = discover_inventory(&cloud, "demo").await.unwrap();
    let second = ensure_network(&cloud, &ctx, &desired(), actual).await.unwrap();

    assert_eq!(cloud.mutation_count(), 0);
    assert_eq!(first, second);
    assert_eq!(ctx.summary().count(Change::Unchanged), 1);
    assert_eq!(ctx.summary().mutations(), 0);
}

#[tokio::test(start_paused = true)]
async fn build_resumes_at_the_missing_piece() {
    let cloud = InMemoryCloud::default();
    let network = build(&cloud, &desired()).await.unwrap();
    cloud.remove_subnet(&network.private_subnet_ids[1]);
    cloud.reset_counters();

    let resumed = build(&cloud, &desired()).await.unwrap();

    assert_eq!(cloud.calls("CreateSubnet"), 1);
    assert_eq!(cloud.calls("AssociateRouteTable"), 1);
    assert_eq!(cloud.mutation_count(), 2);
    assert_eq!(cidr_of(&cloud, &resumed.private_subnet_ids[1]), "10.10.144.0/20");
}

#[tokio::test(start_paused = true)]
async fn explicit_zones_keep_their_order() {
    let cloud = InMemoryCloud::default();
    let mut config = desired();
    config.availability_zones =
        ZoneSelection::Explicit(vec!["us-west-2c".to_string(), "us-west-2a".to_string()]);

    let network = build(&cloud, &config).await.unwrap();

    assert_eq!(network.availability_zones, vec!["us-west-2c", "us-west-2a"]);
    assert_eq!(network.nat_gateway_ids.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn private_access_creates_endpoints_and_waits() {
    let cloud = InMemoryCloud::default();
    cloud.set_settle_polls(2);
    let mut config = desired();
    config.endpoint_access = EndpointAccess::Private;

    let network = build(&cloud, &config).await.unwrap();

    assert_eq!(network.endpoint_ids.len(), INTERFACE_ENDPOINT_SERVICES.len() + 1);
    let endpoints = cloud.endpoints();
    assert!(endpoints
        .iter()
        .any(|ep| ep.service_name == endpoint_service_name("us-west-2", GATEWAY_ENDPOINT_SERVICE)));
    assert!(endpoints
        .iter()
        .all(|ep| ep.state == crate::cloud::VpcEndpointState::Available));
}

#[tokio::test(start_paused = true)]
async fn failed_nat_gateway_aborts_the_build() {
    let cloud = InMemoryCloud::default();
    cloud.fail_settling("nat-");

    let err = build(&cloud, &desired()).await.unwrap_err();

    assert!(
        matches!(err, Error::ResourceFailed { ref status, .. } if status == "failed"),
        "unexpected error: {err}"
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_rule_rejection_counts_as_applied() {
    let cloud = InMemoryCloud::default();
    let config = desired();
    build(&cloud, &config).await.unwrap();

    // Serve the finished network from a mock, but let discovery miss the ingress rules
    let mut stale = discover_inventory(&cloud, "demo").await.unwrap().unwrap();
    stale.security_groups[0].ingress.clear();
    let vpc_id = stale.vpc.id.clone();
    let zones = cloud.describe_availability_zones().await.unwrap();
    let vpcs = cloud.describe_vpcs(&[]).await.unwrap();
    let subnets = cloud.describe_subnets(&vpc_id).await.unwrap();
    let igws = cloud.describe_internet_gateways(&vpc_id).await.unwrap();
    let addresses = cloud.describe_addresses(&[]).await.unwrap();
    let nats = cloud.describe_nat_gateways(&vpc_id).await.unwrap();
    let route_tables = cloud.describe_route_tables(&vpc_id).await.unwrap();
    let groups = cloud.describe_security_groups(&vpc_id).await.unwrap();
    let endpoints = cloud.describe_vpc_endpoints(&vpc_id).await.unwrap();

    let mut mock = MockNetworkApi::new();
    mock.expect_describe_availability_zones()
        .returning(move || Ok(zones.clone()));
    mock.expect_describe_vpcs().returning(move |_| Ok(vpcs.clone()));
    mock.expect_describe_subnets().returning(move |_| Ok(subnets.clone()));
    mock.expect_describe_internet_gateways()
        .returning(move |_| Ok(igws.clone()));
    mock.expect_describe_addresses()
        .returning(move |_| Ok(addresses.clone()));
    mock.expect_describe_nat_gateways()
        .returning(move |_| Ok(nats.clone()));
    mock.expect_describe_route_tables()
        .returning(move |_| Ok(route_tables.clone()));
    mock.expect_describe_security_groups()
        .returning(move |_| Ok(groups.clone()));
    mock.expect_describe_vpc_endpoints()
        .returning(move |_| Ok(endpoints.clone()));
    mock.expect_authorize_ingress().times(1).returning(|_, _| {
        Err(CloudError::new(
            CloudErrorKind::DuplicateRule,
            "AuthorizeSecurityGroupIngress",
            "the specified rule already exists",
        ))
    });

    let ctx = ReconcileContext::default();
    let network = ensure_network(&mock, &ctx, &config, Some(stale)).await.unwrap();

    assert_eq!(network.vpc_id, vpc_id);
    assert_eq!(ctx.summary().mutations(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_nat_gateway_is_replaced_on_the_next_build() {
    let cloud = InMemoryCloud::default();
    cloud.fail_settling("nat-");
    build(&cloud, &desired()).await.unwrap_err();

    cloud.clear_failed_settling();
    cloud.reset_counters();
    let network = build(&cloud, &desired()).await.unwrap();

    assert_eq!(cloud.calls("CreateNatGateway"), 3);
    assert_eq!(cloud.calls("AllocateAddress"), 0, "addresses of failed gateways are reused");
    assert_eq!(network.nat_gateway_ids.len(), 3);

    cloud.reset_counters();
    build(&cloud, &desired()).await.unwrap();
    assert_eq!(cloud.mutation_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cidr_change_is_immutable() {
    let cloud = InMemoryCloud::default();
    build(&cloud, &desired()).await.unwrap();
    cloud.reset_counters();

    let mut changed = desired();
    changed.network_cidr = "10.20.0.0/16".to_string();
    let err = build(&cloud, &changed).await.unwrap_err();

    assert!(matches!(err, Error::ImmutableField { ref field, .. } if field == "networkCidr"));
    assert_eq!(cloud.mutation_count(), 0);
}

#[tokio::test]
async fn a_single_zone_is_rejected_before_any_mutation() {
    let cloud = InMemoryCloud::default();
    cloud.set_zones(vec!["us-west-2a".to_string()]);

    let err = build(&cloud, &desired()).await.unwrap_err();

    assert!(matches!(err, Error::Configuration { ref field, .. } if field == "availabilityZones"));
    assert_eq!(cloud.mutation_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn teardown_removes_everything_owned() {
    let cloud = InMemoryCloud::default();
    cloud.set_settle_polls(1);
    let mut config = desired();
    config.endpoint_access = EndpointAccess::Private;
    build(&cloud, &config).await.unwrap();

    let ctx = ReconcileContext::default();
    let inventory = discover_inventory(&cloud, "demo").await.unwrap().unwrap();
    teardown_network(&cloud, &ctx, &inventory).await.unwrap();

    assert!(cloud.inventory_counts().values().all(|&n| n == 0));
    assert!(discover_inventory(&cloud, "demo").await.unwrap().is_none());
    assert!(ctx.summary().count(Change::Deleted) > 0);
}

#[tokio::test(start_paused = true)]
async fn foreign_network_is_never_touched() {
    let cloud = InMemoryCloud::default();
    let mut foreign = TagSet::new();
    foreign.insert(MANAGED_BY_KEY.to_string(), "terraform".to_string());
    foreign.insert(CLUSTER_KEY.to_string(), "demo".to_string());
    let foreign_vpc = cloud.insert_vpc("10.10.0.0/16", foreign);

    let network = build(&cloud, &desired()).await.unwrap();
    assert_ne!(network.vpc_id, foreign_vpc);

    let ctx = ReconcileContext::default();
    let inventory = discover_inventory(&cloud, "demo").await.unwrap().unwrap();
    teardown_network(&cloud, &ctx, &inventory).await.unwrap();

    assert_eq!(cloud.inventory_counts()["vpcs"], 1);
}

#[test]
fn endpoint_names_are_regional() {
    assert_eq!(
        endpoint_service_name("eu-central-1", "ecr.dkr"),
        "com.amazonaws.eu-central-1.ecr.dkr"
    );
}
