//! Control-plane reconciler
//!
//! Creates the managed control plane when absent. When present, immutable
//! fields are checked first and any mismatch fails before a single API call;
//! then the version, endpoint access and logging are brought in line.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{info, instrument};

use super::context::ReconcileContext;
use super::summary::Change;
use super::upgrade::validate_upgrade;
use super::waiter::{wait_until, Poll};
use crate::cloud::{
    ignore_not_found, ClusterApi, ClusterConfigUpdate, ClusterStatus, CreateClusterRequest,
    EndpointAccessUpdate, LogType,
};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::state::{ClusterState, IdentityRoles, NetworkState};
use crate::tags::{tags_for, ResourceKind};

fn resource(name: &str) -> String {
    format!("cluster {name}")
}

/// Bring the control plane in line with `desired`
///
/// # Errors
///
/// [`Error::ImmutableField`] for a network or encryption key change,
/// [`Error::UpgradePath`] for a disallowed version change, and any wait or
/// provider failure.
#[instrument(skip_all, fields(cluster = %desired.name))]
pub async fn reconcile_cluster<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    network: &NetworkState,
    roles: &IdentityRoles,
    actual: Option<ClusterState>,
) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    match actual {
        None => create_cluster(cloud, ctx, desired, network, roles).await,
        Some(actual) => update_cluster(cloud, ctx, desired, network, &actual).await,
    }
}

async fn create_cluster<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    network: &NetworkState,
    roles: &IdentityRoles,
) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    let group_id = network.cluster_security_group_id().ok_or_else(|| {
        Error::Discovery(format!("network {} has no cluster security group", network.vpc_id))
    })?;

    let request = CreateClusterRequest {
        name: desired.name.clone(),
        version: desired.kubernetes_version.clone(),
        role_arn: roles.cluster_role.arn.clone(),
        subnet_ids: network.private_subnet_ids.clone(),
        security_group_ids: vec![group_id.to_string()],
        endpoint_public_access: desired.endpoint_access.public(),
        endpoint_private_access: desired.endpoint_access.private(),
        public_access_cidrs: desired.effective_public_access_cidrs(),
        encryption_key_arn: desired.encryption_key_arn.clone(),
        enabled_logs: LogType::ALL.to_vec(),
        tags: tags_for(ResourceKind::Cluster, &desired.name, &desired.tags),
    };

    cloud.create_cluster(&request).await?;
    info!(version = %request.version, "Creating control plane");
    ctx.progress(
        ResourceKind::Cluster,
        "create",
        format!("Creating control plane {} (this usually takes 10-15 minutes)", desired.name),
    );

    wait_for_active(cloud, &desired.name, ctx.timeouts().cluster_create, ctx).await?;
    ctx.record(ResourceKind::Cluster, &desired.name, Change::Created);
    Ok(())
}

/// Fail fast on fields that cannot change in place
pub fn check_immutable(
    desired: &ClusterConfig,
    network: &NetworkState,
    actual: &ClusterState,
) -> Result<()> {
    let what = resource(&actual.name);
    if actual.vpc_id != network.vpc_id {
        return Err(Error::immutable(what, "network", &actual.vpc_id, &network.vpc_id));
    }
    if actual.encryption_key_arn != desired.encryption_key_arn {
        return Err(Error::immutable(
            what,
            "encryptionKeyArn",
            actual.encryption_key_arn.as_deref().unwrap_or("none"),
            desired.encryption_key_arn.as_deref().unwrap_or("none"),
        ));
    }
    Ok(())
}

/// Endpoint and logging changes, combined into a single update
pub fn config_update(desired: &ClusterConfig, actual: &ClusterState) -> ClusterConfigUpdate {
    let public = desired.endpoint_access.public();
    let private = desired.endpoint_access.private();
    let cidrs = desired.effective_public_access_cidrs();

    let current_cidrs: BTreeSet<&String> = actual.public_access_cidrs.iter().collect();
    let desired_cidrs: BTreeSet<&String> = cidrs.iter().collect();

    let endpoint_access = (actual.endpoint_public_access != public
        || actual.endpoint_private_access != private
        || current_cidrs != desired_cidrs)
        .then(|| EndpointAccessUpdate {
            endpoint_public_access: public,
            endpoint_private_access: private,
            public_access_cidrs: cidrs.clone(),
        });

    let enable_logs = LogType::ALL
        .into_iter()
        .filter(|log| !actual.enabled_logs.contains(log))
        .collect();

    ClusterConfigUpdate {
        endpoint_access,
        enable_logs,
    }
}

async fn update_cluster<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    desired: &ClusterConfig,
    network: &NetworkState,
    actual: &ClusterState,
) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    check_immutable(desired, network, actual)?;
    let upgrade = validate_upgrade(&actual.version, &desired.kubernetes_version)?;
    let timeouts = ctx.timeouts();

    if actual.status != ClusterStatus::Active {
        // Left mid-transition by an earlier pass
        ctx.progress(
            ResourceKind::Cluster,
            "wait",
            format!("Control plane is {}; waiting for it to settle", actual.status),
        );
        wait_for_active(cloud, &actual.name, timeouts.cluster_create, ctx).await?;
    }

    let mut changed = false;

    if upgrade {
        info!(from = %actual.version, to = %desired.kubernetes_version, "Upgrading control plane");
        cloud
            .update_cluster_version(&actual.name, &desired.kubernetes_version)
            .await?;
        ctx.progress(
            ResourceKind::Cluster,
            "upgrade",
            format!(
                "Upgrading control plane {} from {} to {}",
                actual.name, actual.version, desired.kubernetes_version
            ),
        );
        wait_for_active(cloud, &actual.name, timeouts.cluster_update, ctx).await?;
        changed = true;
    }

    let update = config_update(desired, actual);
    if !update.is_empty() {
        info!(
            endpoint = update.endpoint_access.is_some(),
            logs = update.enable_logs.len(),
            "Updating control plane configuration"
        );
        cloud.update_cluster_config(&actual.name, &update).await?;
        wait_for_active(cloud, &actual.name, timeouts.cluster_update, ctx).await?;
        changed = true;
    }

    let change = if changed {
        Change::Updated
    } else {
        Change::Unchanged
    };
    ctx.record(ResourceKind::Cluster, &actual.name, change);
    Ok(())
}

async fn wait_for_active<C>(
    cloud: &C,
    name: &str,
    timeout: Duration,
    ctx: &ReconcileContext,
) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    wait_until(
        &resource(name),
        timeout,
        ctx.timeouts().poll_interval,
        move || async move {
            Ok(match cloud.describe_cluster(name).await? {
                Some(c) if c.status == ClusterStatus::Active => Poll::Ready(()),
                Some(c) if c.status == ClusterStatus::Failed => Poll::Failed {
                    status: c.status.to_string(),
                    reason: format!("control plane {name} reported {}", c.status),
                },
                Some(c) => Poll::Pending(c.status.to_string()),
                None => Poll::Pending("not yet visible".to_string()),
            })
        },
    )
    .await
}

/// Delete the control plane and wait until it is gone
#[instrument(skip_all, fields(cluster = %cluster.name))]
pub async fn delete_cluster<C>(cloud: &C, ctx: &ReconcileContext, cluster: &ClusterState) -> Result<()>
where
    C: ClusterApi + ?Sized,
{
    let name = cluster.name.as_str();
    if cluster.status != ClusterStatus::Deleting {
        ignore_not_found(cloud.delete_cluster(name).await)?;
    }
    ctx.progress(
        ResourceKind::Cluster,
        "delete",
        format!("Deleting control plane {name}"),
    );

    let timeouts = ctx.timeouts();
    wait_until(
        &resource(name),
        timeouts.cluster_delete,
        timeouts.poll_interval,
        move || async move {
            Ok(match cloud.describe_cluster(name).await? {
                None => Poll::Ready(()),
                Some(c) => Poll::Pending(c.status.to_string()),
            })
        },
    )
    .await?;

    info!("Deleted control plane");
    ctx.record(ResourceKind::Cluster, name, Change::Deleted);
    Ok(())
}
