//! Identity role provisioner
//!
//! Two roles per cluster: one assumed by the control plane, one by worker
//! nodes. Only missing roles are created; a role already present under an
//! expected name is reused as long as this cluster owns it.

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::context::ReconcileContext;
use super::summary::Change;
use crate::cloud::{ignore_not_found, CloudResult, IamApi, Role, TagSet};
use crate::discovery::{discover_role, role_names, RoleLookup};
use crate::error::{Error, Result};
use crate::state::{IdentityRoles, RoleRef};
use crate::tags::{tags_for, ResourceKind, NAME_KEY};

pub const CLUSTER_SERVICE_PRINCIPAL: &str = "eks.amazonaws.com";
pub const NODE_SERVICE_PRINCIPAL: &str = "ec2.amazonaws.com";

const POLICY_ARN_PREFIX: &str = "arn:aws:iam::aws:policy/";

pub const CLUSTER_ROLE_POLICIES: [&str; 1] = ["AmazonEKSClusterPolicy"];
pub const NODE_ROLE_POLICIES: [&str; 3] = [
    "AmazonEKSWorkerNodePolicy",
    "AmazonEKS_CNI_Policy",
    "AmazonEC2ContainerRegistryReadOnly",
];

pub fn managed_policy_arn(policy: &str) -> String {
    format!("{POLICY_ARN_PREFIX}{policy}")
}

/// Trust document letting `service` assume the role
pub fn trust_policy(service: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }],
    })
    .to_string()
}

struct RoleTemplate<'a> {
    name: &'a str,
    principal: &'static str,
    policies: &'static [&'static str],
}

async fn ensure_role<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    cluster_name: &str,
    tags: &TagSet,
    template: RoleTemplate<'_>,
) -> Result<RoleRef>
where
    C: IamApi + ?Sized,
{
    match discover_role(cloud, template.name, cluster_name).await? {
        RoleLookup::Owned(role) => {
            debug!(role = %role.name, "Role already present");
            ctx.record(ResourceKind::Role, &role.name, Change::Unchanged);
            Ok(RoleRef::from(&role))
        }
        RoleLookup::Foreign(role) => Err(Error::Discovery(format!(
            "role {} exists but is not owned by cluster {cluster_name}; \
             delete or rename it before reconciling",
            role.name
        ))),
        RoleLookup::Missing => {
            let mut role_tags = tags_for(ResourceKind::Role, cluster_name, tags);
            role_tags.insert(NAME_KEY.to_string(), template.name.to_string());
            let role: Role = cloud
                .create_role(template.name, &trust_policy(template.principal), &role_tags)
                .await?;
            if let Err(e) = attach_policies(cloud, &role.name, template.policies).await {
                // Discovered roles are reused as-is, so a partial one must not survive
                warn!(role = %role.name, error = %e, "Attaching policies failed, removing new role");
                if let Err(cleanup) = discard_role(cloud, &role.name).await {
                    warn!(role = %role.name, error = %cleanup, "Could not remove partially created role");
                }
                return Err(e.into());
            }
            info!(role = %role.name, policies = template.policies.len(), "Created role");
            ctx.progress(
                ResourceKind::Role,
                "create",
                format!("Created role {}", role.name),
            );
            ctx.record(ResourceKind::Role, &role.name, Change::Created);
            Ok(RoleRef::from(&role))
        }
    }
}

async fn attach_policies<C>(cloud: &C, role_name: &str, policies: &[&str]) -> CloudResult<()>
where
    C: IamApi + ?Sized,
{
    for policy in policies {
        cloud
            .attach_role_policy(role_name, &managed_policy_arn(policy))
            .await?;
    }
    Ok(())
}

/// Detach every policy, then delete the role
async fn discard_role<C>(cloud: &C, role_name: &str) -> CloudResult<()>
where
    C: IamApi + ?Sized,
{
    for policy_arn in cloud.list_attached_role_policies(role_name).await? {
        ignore_not_found(cloud.detach_role_policy(role_name, &policy_arn).await)?;
    }
    for policy in cloud.list_role_policies(role_name).await? {
        ignore_not_found(cloud.delete_role_policy(role_name, &policy).await)?;
    }
    ignore_not_found(cloud.delete_role(role_name).await)
}

/// Find or create both roles for `cluster_name`
///
/// # Errors
///
/// [`Error::Discovery`] when a role under an expected name is not owned by
/// this cluster.
#[instrument(skip(cloud, ctx, tags))]
pub async fn ensure_roles<C>(
    cloud: &C,
    ctx: &ReconcileContext,
    cluster_name: &str,
    tags: &TagSet,
) -> Result<IdentityRoles>
where
    C: IamApi + ?Sized,
{
    let names = role_names(cluster_name);
    let cluster_role = ensure_role(
        cloud,
        ctx,
        cluster_name,
        tags,
        RoleTemplate {
            name: &names.cluster_role,
            principal: CLUSTER_SERVICE_PRINCIPAL,
            policies: &CLUSTER_ROLE_POLICIES,
        },
    )
    .await?;
    let node_role = ensure_role(
        cloud,
        ctx,
        cluster_name,
        tags,
        RoleTemplate {
            name: &names.node_role,
            principal: NODE_SERVICE_PRINCIPAL,
            policies: &NODE_ROLE_POLICIES,
        },
    )
    .await?;

    Ok(IdentityRoles {
        cluster_role,
        node_role,
    })
}

/// Detach and delete every owned role of `cluster_name`
///
/// Roles that are missing or foreign are left alone.
#[instrument(skip(cloud, ctx))]
pub async fn delete_roles<C>(cloud: &C, ctx: &ReconcileContext, cluster_name: &str) -> Result<usize>
where
    C: IamApi + ?Sized,
{
    let names = role_names(cluster_name);
    let mut deleted = 0;
    for name in [&names.cluster_role, &names.node_role] {
        let RoleLookup::Owned(role) = discover_role(cloud, name, cluster_name).await? else {
            continue;
        };
        discard_role(cloud, &role.name).await?;

        info!(role = %role.name, "Deleted role");
        ctx.record(ResourceKind::Role, &role.name, Change::Deleted);
        deleted += 1;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::InMemoryCloud;
    use crate::cloud::{CloudErrorKind, MockIamApi};
    use crate::discovery::discover_roles;

    fn owned_tags() -> TagSet {
        tags_for(ResourceKind::Role, "demo", &TagSet::new())
    }

    #[test]
    fn test_trust_policy_names_the_service() {
        let doc: serde_json::Value = serde_json::from_str(&trust_policy(NODE_SERVICE_PRINCIPAL)).unwrap();
        assert_eq!(doc["Statement"][0]["Principal"]["Service"], "ec2.amazonaws.com");
        assert_eq!(doc["Statement"][0]["Action"], "sts:AssumeRole");
    }

    #[tokio::test]
    async fn test_creates_both_roles_with_policies() {
        let cloud = InMemoryCloud::default();
        let ctx = ReconcileContext::default();

        let roles = ensure_roles(&cloud, &ctx, "demo", &TagSet::new()).await.unwrap();

        assert_eq!(roles.cluster_role.name, "demo-cluster-role");
        assert_eq!(
            cloud.attached_policies("demo-cluster-role"),
            vec!["arn:aws:iam::aws:policy/AmazonEKSClusterPolicy"]
        );
        let mut node_policies = cloud.attached_policies("demo-node-role");
        node_policies.sort();
        assert_eq!(
            node_policies,
            vec![
                "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
                "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
                "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
            ]
        );
        assert_eq!(discover_roles(&cloud, "demo").await.unwrap(), Some(roles));
        assert_eq!(ctx.summary().count(Change::Created), 2);
    }

    #[tokio::test]
    async fn test_existing_roles_are_reused() {
        let cloud = InMemoryCloud::default();
        ensure_roles(&cloud, &ReconcileContext::default(), "demo", &TagSet::new())
            .await
            .unwrap();
        cloud.reset_counters();

        ensure_roles(&cloud, &ReconcileContext::default(), "demo", &TagSet::new())
            .await
            .unwrap();
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_only_the_missing_role_is_created() {
        let cloud = InMemoryCloud::default();
        cloud.insert_role("demo-cluster-role", owned_tags());

        ensure_roles(&cloud, &ReconcileContext::default(), "demo", &TagSet::new())
            .await
            .unwrap();

        assert_eq!(cloud.calls("CreateRole"), 1);
        assert!(cloud.attached_policies("demo-cluster-role").is_empty());
    }

    #[tokio::test]
    async fn test_role_is_removed_when_attaching_policies_fails() {
        let cloud = InMemoryCloud::default();
        cloud.inject_error("AttachRolePolicy", "demo-node-role", CloudErrorKind::Throttled);

        let err = ensure_roles(&cloud, &ReconcileContext::default(), "demo", &TagSet::new())
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert!(matches!(
            discover_role(&cloud, "demo-node-role", "demo").await.unwrap(),
            RoleLookup::Missing
        ));

        cloud.clear_injected_errors();
        ensure_roles(&cloud, &ReconcileContext::default(), "demo", &TagSet::new())
            .await
            .unwrap();
        assert_eq!(cloud.attached_policies("demo-node-role").len(), NODE_ROLE_POLICIES.len());
        assert_eq!(cloud.attached_policies("demo-cluster-role").len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_role_is_an_error() {
        let mut mock = MockIamApi::new();
        mock.expect_get_role().returning(|name| {
            Ok(Some(Role {
                name: name.to_string(),
                arn: format!("arn:aws:iam::123:role/{name}"),
                assume_role_policy: String::new(),
                tags: TagSet::new(),
                created_at: None,
            }))
        });
        mock.expect_create_role().times(0);

        let err = ensure_roles(&mock, &ReconcileContext::default(), "demo", &TagSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery(ref msg) if msg.contains("demo-cluster-role")));
    }

    #[tokio::test]
    async fn test_delete_detaches_then_deletes() {
        let cloud = InMemoryCloud::default();
        ensure_roles(&cloud, &ReconcileContext::default(), "demo", &TagSet::new())
            .await
            .unwrap();
        cloud.insert_inline_policy("demo-node-role", "extra-s3-access");
        cloud.insert_role("demo-other-role", owned_tags());

        let deleted = delete_roles(&cloud, &ReconcileContext::default(), "demo")
            .await
            .unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(cloud.calls("DetachRolePolicy"), 4);
        assert_eq!(cloud.calls("DeleteRolePolicy"), 1);
        assert_eq!(cloud.inventory_counts()["roles"], 1);
    }

    #[tokio::test]
    async fn test_delete_leaves_foreign_roles() {
        let cloud = InMemoryCloud::default();
        cloud.insert_role("demo-node-role", TagSet::new());

        let deleted = delete_roles(&cloud, &ReconcileContext::default(), "demo")
            .await
            .unwrap();

        assert_eq!(deleted, 0);
        assert_eq!(cloud.mutation_count(), 0);
    }
}
