//! Node-pool reconciler
//!
//! Pools are matched to desired state by their logical name tag, never by
//! physical name. Creates, updates and orphan deletes run concurrently with
//! bounded fan-out; each pool is its own failure domain and failures are
//! aggregated into one [`Error::PartialFailure`] after everything finished.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::context::ReconcileContext;
use super::summary::Change;
use super::waiter::{wait_until, Poll};
use crate::cloud::{
    ignore_not_found, CreateNodegroupRequest, NodeGroupApi, NodegroupConfigUpdate,
    NodegroupStatus, ScalingConfig, Taint,
};
use crate::config::{ClusterConfig, NodePoolSpec};
use crate::error::{Error, PoolFailure, Result};
use crate::state::{ClusterState, IdentityRoles, NetworkState, NodePoolState};
use crate::tags::{node_pool_tags, ResourceKind, NODE_POOL_KEY};

/// Root volume size of every node, in GiB
pub const NODE_DISK_SIZE_GIB: u32 = 20;
/// Label added to GPU pools
pub const GPU_LABEL_KEY: &str = "nvidia.com/gpu";
const NAME_SUFFIX_LEN: usize = 6;

/// What a pool task does
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolAction {
    Create,
    Update,
    Replace,
    Delete,
}

impl PoolAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolAction::Create => "create",
            PoolAction::Update => "update",
            PoolAction::Replace => "replace",
            PoolAction::Delete => "delete",
        }
    }
}

impl fmt::Display for PoolAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one successful pool task
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolOutcome {
    pub pool: String,
    pub action: PoolAction,
    pub change: Change,
}

/// `<cluster>-<pool>-<6 random lowercase alphanumerics>`
pub fn physical_name(cluster_name: &str, pool: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{cluster_name}-{pool}-{suffix}")
}

/// Labels every node of the pool must carry
pub fn desired_labels(pool: &str, spec: &NodePoolSpec) -> BTreeMap<String, String> {
    let mut labels = spec.labels.clone();
    labels.insert(NODE_POOL_KEY.to_string(), pool.to_string());
    if spec.gpu {
        labels.insert(GPU_LABEL_KEY.to_string(), "true".to_string());
    }
    labels
}

/// Discovered pools with no desired entry, in logical-name order
pub fn orphans<'a>(
    desired: &BTreeMap<String, NodePoolSpec>,
    actual: &'a BTreeMap<String, NodePoolState>,
) -> Vec<&'a NodePoolState> {
    actual
        .iter()
        .filter(|(pool, _)| !desired.contains_key(*pool))
        .map(|(_, state)| state)
        .collect()
}

/// Action per logical pool: desired pools are created or updated, orphans deleted
pub fn plan_pools(
    desired: &BTreeMap<String, NodePoolSpec>,
    actual: &BTreeMap<String, NodePoolState>,
) -> Vec<(String, PoolAction)> {
    let mut plan: Vec<_> = desired
        .keys()
        .map(|pool| {
            let action = match actual.get(pool) {
                Some(state) if needs_replacement(state) => PoolAction::Replace,
                Some(_) => PoolAction::Update,
                None => PoolAction::Create,
            };
            (pool.clone(), action)
        })
        .collect();
    plan.extend(
        orphans(desired, actual)
            .into_iter()
            .map(|state| (state.pool.clone(), PoolAction::Delete)),
    );
    plan
}

/// A pool whose creation failed is deleted and created again from its spec
pub fn needs_replacement(actual: &NodePoolState) -> bool {
    actual.status == NodegroupStatus::CreateFailed
}

/// Fail fast on fields that cannot change in place
pub fn check_immutable(pool: &str, spec: &NodePoolSpec, actual: &NodePoolState) -> Result<()> {
    let what = format!("node pool {pool}");
    if actual.instance_type() != spec.instance_type {
        return Err(Error::immutable(
            what,
            "instanceType",
            actual.instance_type(),
            &spec.instance_type,
        ));
    }
    let ami = spec.resolved_ami_type();
    if actual.ami_type != ami {
        return Err(Error::immutable(what, "amiType", &actual.ami_type, ami));
    }
    if actual.capacity_type != spec.capacity_type() {
        return Err(Error::immutable(
            what,
            "capacityType",
            actual.capacity_type,
            spec.capacity_type(),
        ));
    }
    Ok(())
}

/// New scaling config, or `None` when the bounds already match
///
/// The running desired size is kept unless it falls outside the new bounds;
/// the provider rejects an out-of-range desired size, so it is clamped only
/// to keep the update valid. `spec` must have passed validation, which
/// guarantees min <= max.
pub fn scaling_update(spec: &NodePoolSpec, actual: &NodePoolState) -> Option<ScalingConfig> {
    let min_size = spec.effective_min();
    let max_size = spec.effective_max();
    if actual.min_size == min_size && actual.max_size == max_size {
        return None;
    }
    Some(ScalingConfig {
        min_size,
        max_size,
        desired_size: actual.desired_size.clamp(min_size, max_size),
    })
}

fn same_slot(a: &Taint, b: &Taint) -> bool {
    a.key == b.key && a.effect == b.effect
}

/// The single combined update bringing `actual` in line with `spec`
pub fn pool_update(
    cluster_name: &str,
    pool: &str,
    spec: &NodePoolSpec,
    actual: &NodePoolState,
) -> NodegroupConfigUpdate {
    let add_or_update_labels = desired_labels(pool, spec)
        .into_iter()
        .filter(|(key, value)| actual.labels.get(key) != Some(value))
        .collect();

    let want: BTreeSet<&Taint> = spec.taints.iter().collect();
    let have: BTreeSet<&Taint> = actual.taints.iter().collect();
    let (add_or_update_taints, remove_taints) = if want == have {
        (Vec::new(), Vec::new())
    } else {
        let add = spec
            .taints
            .iter()
            .filter(|t| !have.contains(t))
            .cloned()
            .collect();
        let remove = actual
            .taints
            .iter()
            .filter(|t| !spec.taints.iter().any(|d| same_slot(t, d)))
            .cloned()
            .collect();
        (add, remove)
    };

    NodegroupConfigUpdate {
        cluster_name: cluster_name.to_string(),
        nodegroup_name: actual.name.clone(),
        scaling: scaling_update(spec, actual),
        add_or_update_labels,
        remove_labels: Vec::new(),
        add_or_update_taints,
        remove_taints,
    }
}

async fn wait_for_active<C>(
    cloud: &C,
    cluster_name: &str,
    name: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()>
where
    C: NodeGroupApi + ?Sized,
{
    wait_until(
        &format!("node group {name}"),
        timeout,
        poll_interval,
        move || async move {
            Ok(match cloud.describe_nodegroup(cluster_name, name).await? {
                Some(ng) if ng.status == NodegroupStatus::Active => Poll::Ready(()),
                Some(ng) if ng.status.is_failed() => Poll::Failed {
                    status: ng.status.to_string(),
                    reason: failure_reason(&ng.health_issues),
                },
                Some(ng) => Poll::Pending(ng.status.to_string()),
                None => Poll::Pending("not yet visible".to_string()),
            })
        },
    )
    .await
}

fn failure_reason(health_issues: &[String]) -> String {
    if health_issues.is_empty() {
        "no health issues reported".to_string()
    } else {
        health_issues.join(", ")
    }
}

/// Create one pool and wait until it is active
pub async fn create_one<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    network: &NetworkState,
    roles: &IdentityRoles,
    pool: &str,
    spec: &NodePoolSpec,
) -> Result<Change>
where
    C: NodeGroupApi + ?Sized,
{
    let min_size = spec.effective_min();
    let request = CreateNodegroupRequest {
        cluster_name: desired.name.clone(),
        nodegroup_name: physical_name(&desired.name, pool),
        scaling: ScalingConfig {
            min_size,
            max_size: spec.effective_max(),
            desired_size: min_size,
        },
        subnets: network.private_subnet_ids.clone(),
        instance_types: vec![spec.instance_type.clone()],
        ami_type: spec.resolved_ami_type(),
        capacity_type: spec.capacity_type(),
        disk_size: NODE_DISK_SIZE_GIB,
        node_role_arn: roles.node_role.arn.clone(),
        labels: desired_labels(pool, spec),
        taints: spec.taints.clone(),
        tags: node_pool_tags(&desired.name, pool, &desired.tags),
    };

    cloud.create_nodegroup(&request).await?;
    info!(
        pool,
        nodegroup = %request.nodegroup_name,
        instance_type = %spec.instance_type,
        "Creating node pool"
    );
    ctx.progress(
        ResourceKind::NodePool,
        "create",
        format!("Creating node pool {pool} ({})", request.nodegroup_name),
    );

    let timeouts = ctx.timeouts();
    wait_for_active(
        cloud,
        &desired.name,
        &request.nodegroup_name,
        timeouts.node_pool,
        timeouts.poll_interval,
    )
    .await?;
    Ok(Change::Created)
}

/// Bring one existing pool in line with its spec
///
/// # Errors
///
/// [`Error::ImmutableField`] before any API call when the instance type, AMI
/// type or capacity type differ.
pub async fn reconcile_one<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    pool: &str,
    spec: &NodePoolSpec,
    actual: &NodePoolState,
) -> Result<Change>
where
    C: NodeGroupApi + ?Sized,
{
    check_immutable(pool, spec, actual)?;
    let timeouts = ctx.timeouts();

    if actual.status.is_failed() {
        return Err(Error::ResourceFailed {
            resource: format!("node pool {pool}"),
            status: actual.status.to_string(),
            reason: failure_reason(&actual.health_issues),
        });
    }
    if actual.status != NodegroupStatus::Active {
        wait_for_active(
            cloud,
            &actual.cluster_name,
            &actual.name,
            timeouts.node_pool,
            timeouts.poll_interval,
        )
        .await?;
    }

    let update = pool_update(&actual.cluster_name, pool, spec, actual);
    if update.is_empty() {
        return Ok(Change::Unchanged);
    }

    info!(
        pool,
        scaling = update.scaling.is_some(),
        labels = update.add_or_update_labels.len(),
        taints = update.add_or_update_taints.len() + update.remove_taints.len(),
        "Updating node pool"
    );
    cloud.update_nodegroup_config(&update).await?;
    wait_for_active(
        cloud,
        &actual.cluster_name,
        &actual.name,
        timeouts.node_pool,
        timeouts.poll_interval,
    )
    .await?;
    Ok(Change::Updated)
}

/// Delete a pool that failed to create, then create it again
#[allow(clippy::too_many_arguments)]
pub async fn replace_one<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    network: &NetworkState,
    roles: &IdentityRoles,
    pool: &str,
    spec: &NodePoolSpec,
    actual: &NodePoolState,
) -> Result<Change>
where
    C: NodeGroupApi + ?Sized,
{
    warn!(
        pool,
        nodegroup = %actual.name,
        reason = %failure_reason(&actual.health_issues),
        "Replacing node pool that failed to create"
    );
    delete_one(cloud, ctx, actual).await?;
    create_one(cloud, ctx, desired, network, roles, pool, spec).await
}

/// Delete one pool and wait until it is gone
pub async fn delete_one<C>(cloud: &C, ctx: &ReconcileContext, actual: &NodePoolState) -> Result<Change>
where
    C: NodeGroupApi + ?Sized,
{
    let cluster_name = actual.cluster_name.as_str();
    let name = actual.name.as_str();
    if actual.status != NodegroupStatus::Deleting {
        ignore_not_found(cloud.delete_nodegroup(cluster_name, name).await)?;
    }
    info!(pool = %actual.pool, nodegroup = name, "Deleting node pool");
    ctx.progress(
        ResourceKind::NodePool,
        "delete",
        format!("Deleting node pool {} ({name})", actual.pool),
    );

    let timeouts = ctx.timeouts();
    wait_until(
        &format!("node group {name}"),
        timeouts.node_pool_delete,
        timeouts.poll_interval,
        move || async move {
            Ok(match cloud.describe_nodegroup(cluster_name, name).await? {
                None => Poll::Ready(()),
                Some(ng) if ng.status == NodegroupStatus::DeleteFailed => Poll::Failed {
                    status: ng.status.to_string(),
                    reason: failure_reason(&ng.health_issues),
                },
                Some(ng) => Poll::Pending(ng.status.to_string()),
            })
        },
    )
    .await?;
    Ok(Change::Deleted)
}

enum PoolTask<'a> {
    Create(&'a str, &'a NodePoolSpec),
    Update(&'a str, &'a NodePoolSpec, &'a NodePoolState),
    Replace(&'a str, &'a NodePoolSpec, &'a NodePoolState),
    Delete(&'a NodePoolState),
}

impl PoolTask<'_> {
    fn pool(&self) -> &str {
        match self {
            PoolTask::Create(pool, _)
            | PoolTask::Update(pool, _, _)
            | PoolTask::Replace(pool, _, _) => pool,
            PoolTask::Delete(state) => &state.pool,
        }
    }

    fn action(&self) -> PoolAction {
        match self {
            PoolTask::Create(..) => PoolAction::Create,
            PoolTask::Update(..) => PoolAction::Update,
            PoolTask::Replace(..) => PoolAction::Replace,
            PoolTask::Delete(_) => PoolAction::Delete,
        }
    }
}

/// Run every task with bounded fan-out, then aggregate
async fn run_tasks<'a, F, Fut>(
    ctx: &ReconcileContext,
    tasks: Vec<PoolTask<'a>>,
    run: F,
) -> Result<Vec<PoolOutcome>>
where
    F: Fn(PoolTask<'a>) -> Fut,
    Fut: std::future::Future<Output = Result<Change>>,
{
    let parallel = ctx.settings.max_parallel_pools.max(1);
    let results: Vec<(String, PoolAction, Result<Change>)> = futures::stream::iter(tasks)
        .map(|task| {
            let pool = task.pool().to_string();
            let action = task.action();
            let fut = run(task);
            async move { (pool, action, fut.await) }
        })
        .buffer_unordered(parallel)
        .collect()
        .await;

    let mut outcomes = Vec::new();
    let mut failures = Vec::new();
    for (pool, action, result) in results {
        match result {
            Ok(change) => {
                ctx.record(ResourceKind::NodePool, &pool, change);
                outcomes.push(PoolOutcome {
                    pool,
                    action,
                    change,
                });
            }
            Err(e) => {
                warn!(%pool, %action, error = %e, "Node pool operation failed");
                ctx.record(ResourceKind::NodePool, &pool, Change::Failed);
                failures.push(PoolFailure {
                    pool,
                    action: action.to_string(),
                    cause: e.to_string(),
                });
            }
        }
    }

    outcomes.sort_by(|a, b| a.pool.cmp(&b.pool));
    if failures.is_empty() {
        Ok(outcomes)
    } else {
        failures.sort_by(|a, b| a.pool.cmp(&b.pool));
        Err(Error::PartialFailure(failures))
    }
}

/// Create, update and delete pools until the owned set matches `desired`
///
/// # Errors
///
/// [`Error::PartialFailure`] naming every failed pool; pools that succeeded
/// stay applied.
#[instrument(skip_all, fields(cluster = %cluster.name, desired = desired.node_pools.len()))]
pub async fn reconcile_node_pools<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    network: &NetworkState,
    cluster: &ClusterState,
    roles: &IdentityRoles,
    actual: BTreeMap<String, NodePoolState>,
) -> Result<Vec<PoolOutcome>>
where
    C: NodeGroupApi + ?Sized,
{
    let mut tasks = Vec::new();
    for (pool, spec) in &desired.node_pools {
        match actual.get(pool) {
            Some(state) if needs_replacement(state) => {
                tasks.push(PoolTask::Replace(pool, spec, state))
            }
            Some(state) => tasks.push(PoolTask::Update(pool, spec, state)),
            None => tasks.push(PoolTask::Create(pool, spec)),
        }
    }
    tasks.extend(orphans(&desired.node_pools, &actual).into_iter().map(PoolTask::Delete));

    run_tasks(ctx, tasks, |task| async move {
        match task {
            PoolTask::Create(pool, spec) => {
                create_one(cloud, ctx, desired, network, roles, pool, spec).await
            }
            PoolTask::Update(pool, spec, state) => reconcile_one(cloud, ctx, pool, spec, state).await,
            PoolTask::Replace(pool, spec, state) => {
                replace_one(cloud, ctx, desired, network, roles, pool, spec, state).await
            }
            PoolTask::Delete(state) => delete_one(cloud, ctx, state).await,
        }
    })
    .await
}

/// Delete every given pool concurrently (destroy path)
pub async fn delete_node_pools<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    actual: &[NodePoolState],
) -> Result<Vec<PoolOutcome>>
where
    C: NodeGroupApi + ?Sized,
{
    let tasks = actual.iter().map(PoolTask::Delete).collect();
    run_tasks(ctx, tasks, |task| async move {
        match task {
            PoolTask::Delete(state) => delete_one(cloud, ctx, state).await,
            PoolTask::Create(..) | PoolTask::Update(..) | PoolTask::Replace(..) => {
                Ok(Change::Unchanged)
            }
        }
    })
    .await
}
