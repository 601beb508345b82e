//! Network discovery

use ipnet::Ipv4Net;
use tracing::{debug, instrument};

use crate::cloud::{NetworkApi, VpcEndpointState};
use crate::error::{Error, Result};
use crate::state::{NetworkInventory, NetworkState};
use crate::tags::{is_owned, ownership_filters, ResourceKind};

/// Find the owned VPC and every owned resource inside it
///
/// # Errors
///
/// [`Error::Discovery`] when more than one owned VPC exists for the cluster.
#[instrument(skip(cloud))]
pub async fn discover_inventory<C>(cloud: &C, cluster_name: &str) -> Result<Option<NetworkInventory>>
where
    C: NetworkApi + ?Sized,
{
    let mut vpcs: Vec<_> = cloud
        .describe_vpcs(&ownership_filters(ResourceKind::Vpc, cluster_name))
        .await?
        .into_iter()
        .filter(|vpc| is_owned(&vpc.tags, cluster_name))
        .collect();

    let vpc = match vpcs.len() {
        0 => {
            debug!("No owned network found");
            return Ok(None);
        }
        1 => vpcs.remove(0),
        n => {
            let ids: Vec<_> = vpcs.iter().map(|v| v.id.as_str()).collect();
            return Err(Error::Discovery(format!(
                "{n} owned networks found for cluster {cluster_name}: {}",
                ids.join(", ")
            )));
        }
    };

    let vpc_id = vpc.id.clone();
    let owned = |tags: &crate::cloud::TagSet| is_owned(tags, cluster_name);

    let mut subnets: Vec<_> = cloud
        .describe_subnets(&vpc_id)
        .await?
        .into_iter()
        .filter(|s| owned(&s.tags))
        .collect();
    subnets.sort_by_key(|s| s.cidr_block.parse::<Ipv4Net>().map(|n| n.network()).ok());

    let internet_gateways = cloud
        .describe_internet_gateways(&vpc_id)
        .await?
        .into_iter()
        .filter(|igw| owned(&igw.tags))
        .collect();

    let addresses = cloud
        .describe_addresses(&ownership_filters(ResourceKind::ElasticIp, cluster_name))
        .await?
        .into_iter()
        .filter(|eip| owned(&eip.tags))
        .collect();

    let nat_gateways = cloud
        .describe_nat_gateways(&vpc_id)
        .await?
        .into_iter()
        .filter(|nat| owned(&nat.tags) && !nat.state.is_gone())
        .collect();

    let route_tables = cloud
        .describe_route_tables(&vpc_id)
        .await?
        .into_iter()
        .filter(|rt| owned(&rt.tags))
        .collect();

    let security_groups = cloud
        .describe_security_groups(&vpc_id)
        .await?
        .into_iter()
        .filter(|sg| owned(&sg.tags))
        .collect();

    let endpoints = cloud
        .describe_vpc_endpoints(&vpc_id)
        .await?
        .into_iter()
        .filter(|ep| {
            owned(&ep.tags)
                && !matches!(
                    ep.state,
                    VpcEndpointState::Deleting | VpcEndpointState::Deleted
                )
        })
        .collect();

    Ok(Some(NetworkInventory {
        vpc,
        subnets,
        internet_gateways,
        addresses,
        nat_gateways,
        route_tables,
        security_groups,
        endpoints,
    }))
}

/// Owned network summary, or `None` when nothing is owned
pub async fn discover_network<C>(cloud: &C, cluster_name: &str) -> Result<Option<NetworkState>>
where
    C: NetworkApi + ?Sized,
{
    Ok(discover_inventory(cloud, cluster_name)
        .await?
        .map(|inventory| inventory.to_state()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{MockNetworkApi, Subnet, TagSet, Vpc};
    use crate::state::{PRIVATE_TIER, PUBLIC_TIER};
    use crate::tags::{tags_for, SUBNET_TIER_KEY};

    fn vpc(id: &str, tags: TagSet) -> Vpc {
        Vpc {
            id: id.to_string(),
            cidr_block: "10.10.0.0/16".to_string(),
            dns_enabled: true,
            tags,
        }
    }

    fn subnet(id: &str, cidr: &str, zone: &str, tier: &str) -> Subnet {
        let mut extra = TagSet::new();
        extra.insert(SUBNET_TIER_KEY.to_string(), tier.to_string());
        Subnet {
            id: id.to_string(),
            vpc_id: "vpc-1".to_string(),
            cidr_block: cidr.to_string(),
            availability_zone: zone.to_string(),
            map_public_ip_on_launch: tier == PUBLIC_TIER,
            tags: tags_for(ResourceKind::Subnet, "demo", &extra),
        }
    }

    fn empty_children(mock: &mut MockNetworkApi) {
        mock.expect_describe_internet_gateways().returning(|_| Ok(vec![]));
        mock.expect_describe_addresses().returning(|_| Ok(vec![]));
        mock.expect_describe_nat_gateways().returning(|_| Ok(vec![]));
        mock.expect_describe_route_tables().returning(|_| Ok(vec![]));
        mock.expect_describe_security_groups().returning(|_| Ok(vec![]));
        mock.expect_describe_vpc_endpoints().returning(|_| Ok(vec![]));
    }

    #[tokio::test]
    async fn test_no_owned_network() {
        let mut mock = MockNetworkApi::new();
        mock.expect_describe_vpcs().returning(|_| Ok(vec![]));
        assert!(discover_network(&mock, "demo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partially_tagged_vpc_is_invisible() {
        let mut mock = MockNetworkApi::new();
        mock.expect_describe_vpcs().returning(|_| {
            let mut tags = tags_for(ResourceKind::Vpc, "demo", &TagSet::new());
            tags.remove(crate::tags::MANAGED_BY_KEY);
            Ok(vec![vpc("vpc-hand", tags)])
        });
        assert!(discover_network(&mock, "demo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_owned_networks_is_fatal() {
        let mut mock = MockNetworkApi::new();
        mock.expect_describe_vpcs().returning(|_| {
            let tags = tags_for(ResourceKind::Vpc, "demo", &TagSet::new());
            Ok(vec![vpc("vpc-1", tags.clone()), vpc("vpc-2", tags)])
        });
        let err = discover_network(&mock, "demo").await.unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
        assert!(err.to_string().contains("vpc-1, vpc-2"));
    }

    #[tokio::test]
    async fn test_subnets_split_by_tier_in_zone_order() {
        let mut mock = MockNetworkApi::new();
        mock.expect_describe_vpcs()
            .returning(|_| Ok(vec![vpc("vpc-1", tags_for(ResourceKind::Vpc, "demo", &TagSet::new()))]));
        mock.expect_describe_subnets().returning(|_| {
            Ok(vec![
                subnet("subnet-p2", "10.10.144.0/20", "us-west-2b", PRIVATE_TIER),
                subnet("subnet-u1", "10.10.0.0/20", "us-west-2a", PUBLIC_TIER),
                subnet("subnet-p1", "10.10.128.0/20", "us-west-2a", PRIVATE_TIER),
                subnet("subnet-u2", "10.10.16.0/20", "us-west-2b", PUBLIC_TIER),
            ])
        });
        empty_children(&mut mock);

        let state = discover_network(&mock, "demo").await.unwrap().unwrap();
        assert_eq!(state.public_subnet_ids, vec!["subnet-u1", "subnet-u2"]);
        assert_eq!(state.private_subnet_ids, vec!["subnet-p1", "subnet-p2"]);
        assert_eq!(state.availability_zones, vec!["us-west-2a", "us-west-2b"]);
        assert!(state.internet_gateway_id.is_none());
    }
}
