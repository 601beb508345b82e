//! Node-pool reconciler tests

use std::collections::BTreeMap;

use super::context::ReconcileContext;
use super::nodepool::*;
use super::summary::Change;
use crate::cloud::memory::InMemoryCloud;
use crate::cloud::{
    CapacityType, ClusterStatus, ClusterVpcConfig, CloudErrorKind, EksCluster, MockNodeGroupApi,
    Nodegroup, NodegroupStatus, ScalingConfig, TagSet, Taint, TaintEffect,
};
use crate::config::{ClusterConfig, NodePoolSpec, DEFAULT_AMI_TYPE, GPU_AMI_TYPE};
use crate::discovery::{discover_node_pools, index_by_pool};
use crate::error::Error;
use crate::state::{ClusterState, IdentityRoles, NetworkState, NodePoolState, RoleRef};
use crate::tags::{node_pool_tags, tags_for, ResourceKind, NODE_POOL_KEY};

fn nodegroup(pool: &str, status: NodegroupStatus) -> Nodegroup {
    let mut labels = BTreeMap::new();
    labels.insert(NODE_POOL_KEY.to_string(), pool.to_string());
    Nodegroup {
        name: format!("demo-{pool}-abc123"),
        arn: format!("arn:aws:eks:us-west-2:123:nodegroup/demo/demo-{pool}-abc123"),
        cluster_name: "demo".to_string(),
        status,
        instance_types: vec!["m5.large".to_string()],
        scaling: ScalingConfig {
            min_size: 1,
            max_size: 3,
            desired_size: 1,
        },
        current_size: Some(1),
        subnets: vec!["subnet-a".to_string()],
        node_role_arn: "arn:aws:iam::123:role/demo-node-role".to_string(),
        ami_type: DEFAULT_AMI_TYPE.to_string(),
        disk_size: Some(NODE_DISK_SIZE_GIB),
        labels,
        taints: vec![],
        capacity_type: CapacityType::OnDemand,
        health_issues: vec![],
        tags: node_pool_tags("demo", pool, &TagSet::new()),
        created_at: None,
        modified_at: None,
    }
}

fn pool_state(pool: &str) -> NodePoolState {
    NodePoolState::from_nodegroup(nodegroup(pool, NodegroupStatus::Active)).unwrap()
}

fn spec() -> NodePoolSpec {
    NodePoolSpec::new("m5.large")
}

fn network() -> NetworkState {
    NetworkState {
        vpc_id: "vpc-1".to_string(),
        private_subnet_ids: vec!["subnet-a".to_string(), "subnet-b".to_string()],
        security_group_ids: vec!["sg-1".to_string()],
        ..Default::default()
    }
}

fn roles() -> IdentityRoles {
    IdentityRoles {
        cluster_role: RoleRef {
            name: "demo-cluster-role".to_string(),
            arn: "arn:aws:iam::123:role/demo-cluster-role".to_string(),
        },
        node_role: RoleRef {
            name: "demo-node-role".to_string(),
            arn: "arn:aws:iam::123:role/demo-node-role".to_string(),
        },
    }
}

fn live_cluster() -> EksCluster {
    EksCluster {
        name: "demo".to_string(),
        arn: "arn:aws:eks:us-west-2:123:cluster/demo".to_string(),
        endpoint: None,
        certificate_authority: None,
        version: "1.29".to_string(),
        status: ClusterStatus::Active,
        role_arn: roles().cluster_role.arn,
        vpc_config: ClusterVpcConfig {
            vpc_id: "vpc-1".to_string(),
            subnet_ids: network().private_subnet_ids,
            security_group_ids: vec!["sg-1".to_string()],
            endpoint_public_access: true,
            endpoint_private_access: false,
            public_access_cidrs: vec!["0.0.0.0/0".to_string()],
        },
        oidc_issuer: None,
        encryption_key_arn: None,
        enabled_logs: vec![],
        tags: tags_for(ResourceKind::Cluster, "demo", &TagSet::new()),
        created_at: None,
    }
}

fn memory_cloud() -> InMemoryCloud {
    let cloud = InMemoryCloud::default();
    cloud.insert_cluster(live_cluster());
    cloud
}

fn config_with(pools: &[(&str, NodePoolSpec)]) -> ClusterConfig {
    let mut config = ClusterConfig::new("demo", "us-west-2");
    config.node_pools = pools
        .iter()
        .map(|(name, spec)| (name.to_string(), spec.clone()))
        .collect();
    config
}

async fn actual_pools(cloud: &InMemoryCloud) -> BTreeMap<String, NodePoolState> {
    index_by_pool(discover_node_pools(cloud, "demo").await.unwrap()).unwrap()
}

#[test]
fn test_orphan_detection() {
    let desired = config_with(&[("general", spec())]).node_pools;
    let actual: BTreeMap<_, _> = [("general", pool_state("general")), ("old-pool", pool_state("old-pool"))]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

    let orphaned: Vec<_> = orphans(&desired, &actual).into_iter().map(|p| p.pool.as_str()).collect();
    assert_eq!(orphaned, vec!["old-pool"]);

    let plan = plan_pools(&desired, &actual);
    assert_eq!(
        plan,
        vec![
            ("general".to_string(), PoolAction::Update),
            ("old-pool".to_string(), PoolAction::Delete),
        ]
    );
}

#[test]
fn test_physical_name_shape() {
    let name = physical_name("demo", "general");
    let suffix = name.strip_prefix("demo-general-").unwrap();
    assert_eq!(suffix.len(), 6);
    assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
}

#[test]
fn test_gpu_pool_labels_and_ami() {
    let mut gpu = NodePoolSpec::new("g5.xlarge");
    gpu.gpu = true;
    let labels = desired_labels("gpu", &gpu);
    assert_eq!(labels.get(NODE_POOL_KEY).unwrap(), "gpu");
    assert_eq!(labels.get(GPU_LABEL_KEY).unwrap(), "true");
    assert_eq!(gpu.resolved_ami_type(), GPU_AMI_TYPE);
}

#[test]
fn test_desired_size_is_kept_inside_new_bounds() {
    let mut actual = pool_state("general");
    actual.desired_size = 3;
    let mut wider = spec();
    wider.max_size = Some(5);

    let scaling = scaling_update(&wider, &actual).unwrap();
    assert_eq!((scaling.min_size, scaling.max_size, scaling.desired_size), (1, 5, 3));

    let mut narrower = spec();
    narrower.max_size = Some(2);
    assert_eq!(scaling_update(&narrower, &actual).unwrap().desired_size, 2);
}

#[test]
fn test_extra_live_labels_do_not_trigger_update() {
    let mut actual = pool_state("general");
    actual
        .labels
        .insert("added-by-hand".to_string(), "yes".to_string());
    assert!(pool_update("demo", "general", &spec(), &actual).is_empty());
}

#[test]
fn test_taint_change_removes_only_dropped_slots() {
    let mut actual = pool_state("general");
    actual.taints = vec![
        Taint::new("dedicated", "batch", TaintEffect::NoSchedule),
        Taint::new("legacy", "", TaintEffect::NoExecute),
    ];
    let mut wanted = spec();
    wanted.taints = vec![Taint::new("dedicated", "ml", TaintEffect::NoSchedule)];

    let update = pool_update("demo", "general", &wanted, &actual);
    assert_eq!(update.add_or_update_taints, wanted.taints);
    assert_eq!(update.remove_taints, vec![Taint::new("legacy", "", TaintEffect::NoExecute)]);
}

#[tokio::test]
async fn test_instance_type_change_makes_no_update_call() {
    let mut mock = MockNodeGroupApi::new();
    mock.expect_update_nodegroup_config().times(0);
    mock.expect_describe_nodegroup().times(0);

    let err = reconcile_one(
        &mock,
        &ReconcileContext::default(),
        "general",
        &NodePoolSpec::new("m5.xlarge"),
        &pool_state("general"),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::ImmutableField { ref field, .. } if field == "instanceType"));
    assert!(err.to_string().contains("destroy and recreate"));
}

#[tokio::test]
async fn test_spot_change_is_immutable() {
    let mock = MockNodeGroupApi::new();
    let mut spot = spec();
    spot.spot = true;

    let err = reconcile_one(&mock, &ReconcileContext::default(), "general", &spot, &pool_state("general"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ImmutableField { ref field, .. } if field == "capacityType"));
}

#[tokio::test(start_paused = true)]
async fn test_min_max_change_makes_exactly_one_update_call() {
    let mut mock = MockNodeGroupApi::new();
    mock.expect_update_nodegroup_config()
        .withf(|update| {
            update.nodegroup_name == "demo-general-abc123"
                && update.scaling
                    == Some(ScalingConfig {
                        min_size: 2,
                        max_size: 6,
                        desired_size: 2,
                    })
                && update.add_or_update_labels.is_empty()
        })
        .times(1)
        .returning(|_| Ok("update-1".to_string()));
    mock.expect_describe_nodegroup()
        .returning(|_, _| Ok(Some(nodegroup("general", NodegroupStatus::Active))));

    let mut resized = spec();
    resized.min_size = Some(2);
    resized.max_size = Some(6);
    let change = reconcile_one(&mock, &ReconcileContext::default(), "general", &resized, &pool_state("general"))
        .await
        .unwrap();
    assert_eq!(change, Change::Updated);
}

#[tokio::test]
async fn test_failed_pool_is_reported_not_updated() {
    let mock = MockNodeGroupApi::new();
    let mut ng = nodegroup("general", NodegroupStatus::Degraded);
    ng.health_issues = vec!["InsufficientFreeAddresses".to_string()];
    let actual = NodePoolState::from_nodegroup(ng).unwrap();

    let err = reconcile_one(&mock, &ReconcileContext::default(), "general", &spec(), &actual)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("InsufficientFreeAddresses"));
}

#[test]
fn test_create_failed_pool_is_planned_for_replacement() {
    let desired = config_with(&[("general", spec()), ("gpu", spec())]).node_pools;
    let mut actual = BTreeMap::new();
    actual.insert("general".to_string(), pool_state("general"));
    actual.insert(
        "gpu".to_string(),
        NodePoolState::from_nodegroup(nodegroup("gpu", NodegroupStatus::CreateFailed)).unwrap(),
    );

    assert_eq!(
        plan_pools(&desired, &actual),
        vec![
            ("general".to_string(), PoolAction::Update),
            ("gpu".to_string(), PoolAction::Replace),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_create_failed_pool_is_replaced_on_next_pass() {
    let cloud = memory_cloud();
    cloud.fail_settling("demo-gpu-");
    let config = config_with(&[("general", spec()), ("gpu", NodePoolSpec::new("g5.xlarge"))]);
    let cluster = ClusterState::from(live_cluster());

    let err = reconcile_node_pools(&cloud, &ReconcileContext::default(), &config, &network(), &cluster, &roles(), BTreeMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.failed_pools(), vec!["gpu"]);
    let failed_name = actual_pools(&cloud).await["gpu"].name.clone();

    cloud.clear_failed_settling();
    cloud.reset_counters();
    let outcomes = reconcile_node_pools(&cloud, &ReconcileContext::default(), &config, &network(), &cluster, &roles(), actual_pools(&cloud).await)
        .await
        .unwrap();

    assert_eq!(cloud.calls("DeleteNodegroup"), 1);
    assert_eq!(cloud.calls("CreateNodegroup"), 1);
    assert_eq!(cloud.mutation_count(), 2);
    let gpu = outcomes.iter().find(|o| o.pool == "gpu").unwrap();
    assert_eq!((gpu.action, gpu.change), (PoolAction::Replace, Change::Created));

    let pools = actual_pools(&cloud).await;
    assert_ne!(pools["gpu"].name, failed_name);
    assert_eq!(pools["gpu"].status, NodegroupStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_created_pool_matches_spec() {
    let cloud = memory_cloud();
    let mut gpu = NodePoolSpec::new("g5.xlarge");
    gpu.gpu = true;
    gpu.spot = true;
    gpu.min_size = Some(2);
    gpu.taints = vec![Taint::new("nvidia.com/gpu", "present", TaintEffect::NoSchedule)];
    let config = config_with(&[("gpu", gpu)]);
    let cluster = ClusterState::from(live_cluster());

    let outcomes = reconcile_node_pools(&cloud, &ReconcileContext::default(), &config, &network(), &cluster, &roles(), BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].action, PoolAction::Create);

    let created = cloud.nodegroups("demo").pop().unwrap();
    assert!(created.name.starts_with("demo-gpu-"));
    assert_eq!(created.ami_type, GPU_AMI_TYPE);
    assert_eq!(created.capacity_type, CapacityType::Spot);
    assert_eq!(created.scaling.desired_size, 2);
    assert_eq!(created.scaling.max_size, 3);
    assert_eq!(created.subnets, network().private_subnet_ids);
    assert_eq!(created.disk_size, Some(NODE_DISK_SIZE_GIB));
    assert_eq!(created.labels.get(GPU_LABEL_KEY).unwrap(), "true");
    assert_eq!(created.taints.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_isolation() {
    let cloud = memory_cloud();
    cloud.inject_error("CreateNodegroup", "demo-gpu-", CloudErrorKind::InvalidRequest);
    let config = config_with(&[
        ("batch", NodePoolSpec::new("c5.large")),
        ("general", spec()),
        ("gpu", NodePoolSpec::new("g5.xlarge")),
    ]);
    let cluster = ClusterState::from(live_cluster());
    let ctx = ReconcileContext::default();

    let err = reconcile_node_pools(&cloud, &ctx, &config, &network(), &cluster, &roles(), BTreeMap::new())
        .await
        .unwrap_err();

    assert_eq!(err.failed_pools(), vec!["gpu"]);
    assert!(err.is_retriable());
    let created = actual_pools(&cloud).await;
    assert_eq!(created.keys().collect::<Vec<_>>(), vec!["batch", "general"]);
    assert_eq!(ctx.summary().count(Change::Created), 2);
    assert_eq!(ctx.summary().count(Change::Failed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_orphans_are_deleted_and_kept_pools_untouched() {
    let cloud = memory_cloud();
    cloud.insert_nodegroup(nodegroup("general", NodegroupStatus::Active));
    cloud.insert_nodegroup(nodegroup("old-pool", NodegroupStatus::Active));
    let config = config_with(&[("general", spec())]);
    let cluster = ClusterState::from(live_cluster());
    let actual = actual_pools(&cloud).await;

    let outcomes = reconcile_node_pools(&cloud, &ReconcileContext::default(), &config, &network(), &cluster, &roles(), actual)
        .await
        .unwrap();

    assert_eq!(
        outcomes,
        vec![
            PoolOutcome {
                pool: "general".to_string(),
                action: PoolAction::Update,
                change: Change::Unchanged,
            },
            PoolOutcome {
                pool: "old-pool".to_string(),
                action: PoolAction::Delete,
                change: Change::Deleted,
            },
        ]
    );
    assert_eq!(cloud.calls("DeleteNodegroup"), 1);
    assert_eq!(cloud.calls("UpdateNodegroupConfig"), 0);
    assert_eq!(actual_pools(&cloud).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_node_pools_aggregates_failures() {
    let cloud = memory_cloud();
    cloud.insert_nodegroup(nodegroup("general", NodegroupStatus::Active));
    cloud.insert_nodegroup(nodegroup("batch", NodegroupStatus::Active));
    cloud.inject_error("DeleteNodegroup", "batch", CloudErrorKind::Throttled);
    let actual: Vec<_> = actual_pools(&cloud).await.into_values().collect();

    let err = delete_node_pools(&cloud, &ReconcileContext::default(), &actual)
        .await
        .unwrap_err();

    assert_eq!(err.failed_pools(), vec!["batch"]);
    assert_eq!(cloud.nodegroups("demo").len(), 1);
}
