//! Control-plane discovery

use futures::{StreamExt, TryStreamExt};
use tracing::{debug, instrument, warn};

use crate::cloud::ClusterApi;
use crate::error::{Error, Result};
use crate::state::ClusterState;
use crate::tags::is_owned;

const DESCRIBE_CONCURRENCY: usize = 8;

/// Find the single owned cluster for `cluster_name`
///
/// Clusters are listed and described in full so that an owned cluster under a
/// different physical name is still found (and flagged as a duplicate).
///
/// # Errors
///
/// [`Error::Discovery`] when more than one owned cluster exists.
#[instrument(skip(cloud))]
pub async fn discover_cluster<C>(cloud: &C, cluster_name: &str) -> Result<Option<ClusterState>>
where
    C: ClusterApi + ?Sized,
{
    let names = cloud.list_clusters().await?;

    let described: Vec<_> = futures::stream::iter(names)
        .map(|name| async move { cloud.describe_cluster(&name).await })
        .buffered(DESCRIBE_CONCURRENCY)
        .try_collect()
        .await?;

    let mut owned = Vec::new();
    for cluster in described.into_iter().flatten() {
        if is_owned(&cluster.tags, cluster_name) {
            owned.push(cluster);
        } else if cluster.name == cluster_name {
            warn!(
                cluster = %cluster.name,
                "A cluster with this name exists but is not owned by eksforge; ignoring it"
            );
        }
    }

    match owned.len() {
        0 => {
            debug!("No owned cluster found");
            Ok(None)
        }
        1 => Ok(owned.pop().map(ClusterState::from)),
        n => {
            let names: Vec<_> = owned.iter().map(|c| c.name.as_str()).collect();
            Err(Error::Discovery(format!(
                "{n} owned clusters found for {cluster_name}: {}",
                names.join(", ")
            )))
        }
    }
}
