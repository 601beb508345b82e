//! Identity role discovery

use tracing::instrument;

use crate::cloud::{IamApi, Role};
use crate::error::Result;
use crate::state::{IdentityRoles, RoleRef};
use crate::tags::is_owned;

/// Names of the two roles a cluster needs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleNames {
    pub cluster_role: String,
    pub node_role: String,
}

/// `<cluster>-cluster-role` and `<cluster>-node-role`
pub fn role_names(cluster_name: &str) -> RoleNames {
    RoleNames {
        cluster_role: format!("{cluster_name}-cluster-role"),
        node_role: format!("{cluster_name}-node-role"),
    }
}

/// What lives under an expected role name
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleLookup {
    Missing,
    Owned(Role),
    /// Exists but does not carry this cluster's ownership tags
    Foreign(Role),
}

impl RoleLookup {
    pub fn owned(&self) -> Option<&Role> {
        match self {
            RoleLookup::Owned(role) => Some(role),
            _ => None,
        }
    }
}

pub async fn discover_role<C>(cloud: &C, name: &str, cluster_name: &str) -> Result<RoleLookup>
where
    C: IamApi + ?Sized,
{
    Ok(match cloud.get_role(name).await? {
        None => RoleLookup::Missing,
        Some(role) if is_owned(&role.tags, cluster_name) => RoleLookup::Owned(role),
        Some(role) => RoleLookup::Foreign(role),
    })
}

/// Both roles, only when both exist and are owned
#[instrument(skip(cloud))]
pub async fn discover_roles<C>(cloud: &C, cluster_name: &str) -> Result<Option<IdentityRoles>>
where
    C: IamApi + ?Sized,
{
    let names = role_names(cluster_name);
    let cluster_role = discover_role(cloud, &names.cluster_role, cluster_name).await?;
    let node_role = discover_role(cloud, &names.node_role, cluster_name).await?;

    Ok(match (cluster_role.owned(), node_role.owned()) {
        (Some(c), Some(n)) => Some(IdentityRoles {
            cluster_role: RoleRef::from(c),
            node_role: RoleRef::from(n),
        }),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{MockIamApi, TagSet};
    use crate::tags::{tags_for, ResourceKind};

    fn role(name: &str, tags: TagSet) -> Role {
        Role {
            name: name.to_string(),
            arn: format!("arn:aws:iam::123:role/{name}"),
            assume_role_policy: String::new(),
            tags,
            created_at: None,
        }
    }

    #[test]
    fn test_role_names() {
        let names = role_names("demo");
        assert_eq!(names.cluster_role, "demo-cluster-role");
        assert_eq!(names.node_role, "demo-node-role");
    }

    #[tokio::test]
    async fn test_both_owned_roles_found() {
        let mut mock = MockIamApi::new();
        mock.expect_get_role().returning(|name| {
            Ok(Some(role(name, tags_for(ResourceKind::Role, "demo", &TagSet::new()))))
        });
        let roles = discover_roles(&mock, "demo").await.unwrap().unwrap();
        assert_eq!(roles.node_role.name, "demo-node-role");
        assert_eq!(roles.cluster_role.arn, "arn:aws:iam::123:role/demo-cluster-role");
    }

    #[tokio::test]
    async fn test_foreign_role_is_not_owned() {
        let mut mock = MockIamApi::new();
        mock.expect_get_role()
            .returning(|name| Ok(Some(role(name, TagSet::new()))));
        assert!(matches!(
            discover_role(&mock, "demo-node-role", "demo").await.unwrap(),
            RoleLookup::Foreign(_)
        ));
        assert!(discover_roles(&mock, "demo").await.unwrap().is_none());
    }
}
