//! Node-pool discovery

use std::collections::BTreeMap;

use futures::{StreamExt, TryStreamExt};
use tracing::{instrument, warn};

use crate::cloud::NodeGroupApi;
use crate::error::{Error, Result};
use crate::state::NodePoolState;
use crate::tags::is_owned;

const DESCRIBE_CONCURRENCY: usize = 8;

/// Every owned node pool of the cluster, in provider list order
///
/// Node groups deleted between list and describe are skipped. Owned node
/// groups without a logical pool-name tag are skipped with a warning.
#[instrument(skip(cloud))]
pub async fn discover_node_pools<C>(cloud: &C, cluster_name: &str) -> Result<Vec<NodePoolState>>
where
    C: NodeGroupApi + ?Sized,
{
    let names = cloud.list_nodegroups(cluster_name).await?;

    let described: Vec<_> = futures::stream::iter(names)
        .map(|name| async move { cloud.describe_nodegroup(cluster_name, &name).await })
        .buffered(DESCRIBE_CONCURRENCY)
        .try_collect()
        .await?;

    let pools = described
        .into_iter()
        .flatten()
        .filter(|ng| is_owned(&ng.tags, cluster_name))
        .filter_map(|ng| {
            let name = ng.name.clone();
            let pool = NodePoolState::from_nodegroup(ng);
            if pool.is_none() {
                warn!(nodegroup = %name, "Owned node group has no pool-name tag; ignoring it");
            }
            pool
        })
        .collect();

    Ok(pools)
}

/// Index pools by logical name
///
/// # Errors
///
/// [`Error::Discovery`] when two node groups claim the same logical name.
pub fn index_by_pool(pools: Vec<NodePoolState>) -> Result<BTreeMap<String, NodePoolState>> {
    let mut index: BTreeMap<String, NodePoolState> = BTreeMap::new();
    for pool in pools {
        if let Some(previous) = index.get(&pool.pool) {
            return Err(Error::Discovery(format!(
                "node pool {} is claimed by both {} and {}",
                pool.pool, previous.name, pool.name
            )));
        }
        index.insert(pool.pool.clone(), pool);
    }
    Ok(index)
}
