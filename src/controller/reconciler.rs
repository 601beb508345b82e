//! Reconcile orchestrator
//!
//! One pass walks the stages in a fixed order: network, identity roles,
//! control plane, node pools. Each stage discovers what exists, converges it
//! and hands fresh state to the next. Destroy walks them in reverse.
//!
//! The whole pass runs under the configured deadline; dropping the pass
//! future cancels every in-flight wait.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::cluster::{delete_cluster, reconcile_cluster};
use super::context::ReconcileContext;
use super::events::{Event, EventLevel, EventSink, TracingSink};
use super::iam::{delete_roles, ensure_roles};
#[cfg(feature = "metrics")]
use super::metrics::Metrics;
use super::nodepool::{delete_node_pools, reconcile_node_pools, PoolOutcome};
use super::summary::{Change, SummaryEntry};
use super::topology::{ensure_network, teardown_network};
use crate::cloud::CloudApi;
use crate::config::{ClusterConfig, EngineSettings};
use crate::discovery::{
    discover_cluster, discover_inventory, discover_node_pools, discover_roles, index_by_pool,
};
use crate::error::{Error, Result};
use crate::state::{ClusterState, IdentityRoles, NetworkState, NodePoolState};
use crate::tags::ResourceKind;

/// Which entry point produced a report
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Reconcile,
    Destroy,
}

/// Outcome of one pass
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub cluster_name: String,
    pub operation: Operation,
    pub network: Option<NetworkState>,
    pub roles: Option<IdentityRoles>,
    pub cluster: Option<ClusterState>,
    pub node_pools: Vec<NodePoolState>,
    pub pool_outcomes: Vec<PoolOutcome>,
    pub changes: Vec<SummaryEntry>,
    pub mutations: usize,
    pub elapsed_seconds: f64,
}

impl ReconcileReport {
    fn new(cluster_name: &str, operation: Operation) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            operation,
            network: None,
            roles: None,
            cluster: None,
            node_pools: Vec::new(),
            pool_outcomes: Vec::new(),
            changes: Vec::new(),
            mutations: 0,
            elapsed_seconds: 0.0,
        }
    }

    /// Whether the pass changed nothing
    pub fn is_noop(&self) -> bool {
        self.mutations == 0
    }

    pub fn count(&self, change: Change) -> usize {
        self.changes.iter().filter(|e| e.change == change).count()
    }
}

fn stage_resource(stage: &str) -> ResourceKind {
    match stage {
        "network" => ResourceKind::Vpc,
        "roles" => ResourceKind::Role,
        "node_pools" => ResourceKind::NodePool,
        _ => ResourceKind::Cluster,
    }
}

/// Drives reconcile and destroy passes against one provider
pub struct Reconciler {
    cloud: Arc<dyn CloudApi>,
    settings: EngineSettings,
    events: Arc<dyn EventSink>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl Reconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, settings: EngineSettings) -> Self {
        Self {
            cloud,
            settings,
            events: Arc::new(TracingSink),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn context(&self) -> ReconcileContext {
        let ctx = ReconcileContext::new(self.settings.clone(), self.events.clone());
        #[cfg(feature = "metrics")]
        let ctx = ctx.with_metrics(self.metrics.clone());
        ctx
    }

    /// Converge the provider onto `desired`
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] before any API call when `desired` is invalid,
    /// [`Error::DeadlineExceeded`] when the pass outlives the deadline, and
    /// whatever the failing stage returned otherwise.
    #[instrument(skip_all, fields(cluster = %desired.name))]
    pub async fn reconcile(&self, desired: &ClusterConfig) -> Result<ReconcileReport> {
        desired.ensure_valid()?;
        info!(pools = desired.node_pools.len(), "Starting reconcile");

        let ctx = self.context();
        let mut report = ReconcileReport::new(&desired.name, Operation::Reconcile);
        let started = Instant::now();
        self.bounded(&ctx, self.reconcile_pass(&ctx, desired, &mut report))
            .await?;
        self.finish(&ctx, &mut report, started);
        Ok(report)
    }

    /// Delete everything owned by `cluster_name`, dependents first
    #[instrument(skip(self))]
    pub async fn destroy(&self, cluster_name: &str) -> Result<ReconcileReport> {
        info!("Starting destroy");

        let ctx = self.context();
        let mut report = ReconcileReport::new(cluster_name, Operation::Destroy);
        let started = Instant::now();
        self.bounded(&ctx, self.destroy_pass(&ctx, cluster_name, &mut report))
            .await?;
        self.finish(&ctx, &mut report, started);
        Ok(report)
    }

    async fn bounded<F>(&self, ctx: &ReconcileContext, pass: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let deadline = self.settings.deadline;
        match tokio::time::timeout(deadline, pass).await {
            Ok(result) => result,
            Err(_) => {
                error!(?deadline, "Reconcile deadline exceeded");
                let err = Error::DeadlineExceeded(deadline);
                self.observe_error(ctx, "pass", &err);
                Err(err)
            }
        }
    }

    fn finish(&self, ctx: &ReconcileContext, report: &mut ReconcileReport, started: Instant) {
        report.changes = ctx.summary().snapshot();
        report.mutations = ctx.summary().mutations();
        report.elapsed_seconds = started.elapsed().as_secs_f64();
        info!(
            mutations = report.mutations,
            elapsed_seconds = report.elapsed_seconds,
            "Pass finished"
        );
    }

    async fn reconcile_pass(
        &self,
        ctx: &ReconcileContext,
        desired: &ClusterConfig,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let cloud = self.cloud.as_ref();
        let name = desired.name.as_str();

        let network = self
            .stage(ctx, "network", async {
                let actual = discover_inventory(cloud, name).await?;
                ensure_network(cloud, ctx, desired, actual).await
            })
            .await?;
        report.network = Some(network.clone());

        let roles = self
            .stage(ctx, "roles", async {
                ensure_roles(cloud, ctx, name, &desired.tags).await?;
                discover_roles(cloud, name)
                    .await?
                    .ok_or_else(|| Error::Discovery(format!("roles of {name} vanished after reconcile")))
            })
            .await?;
        report.roles = Some(roles.clone());

        let cluster = self
            .stage(ctx, "cluster", async {
                let actual = discover_cluster(cloud, name).await?;
                reconcile_cluster(cloud, ctx, desired, &network, &roles, actual).await?;
                discover_cluster(cloud, name)
                    .await?
                    .ok_or_else(|| Error::Discovery(format!("cluster {name} vanished after reconcile")))
            })
            .await?;
        report.cluster = Some(cluster.clone());

        let outcomes = self
            .stage(ctx, "node_pools", async {
                let actual = index_by_pool(discover_node_pools(cloud, name).await?)?;
                reconcile_node_pools(cloud, ctx, desired, &network, &cluster, &roles, actual).await
            })
            .await?;
        report.pool_outcomes = outcomes;
        report.node_pools = discover_node_pools(cloud, name).await?;
        Ok(())
    }

    async fn destroy_pass(
        &self,
        ctx: &ReconcileContext,
        cluster_name: &str,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let cloud = self.cloud.as_ref();

        let cluster = discover_cluster(cloud, cluster_name).await?;
        if let Some(cluster) = &cluster {
            let pools = discover_node_pools(cloud, cluster_name).await?;
            if pools.is_empty() {
                debug!("No owned node pools");
            } else {
                report.pool_outcomes = self
                    .stage(ctx, "node_pools", delete_node_pools(cloud, ctx, &pools))
                    .await?;
            }
            self.stage(ctx, "cluster", delete_cluster(cloud, ctx, cluster))
                .await?;
        } else {
            debug!("No owned cluster");
        }

        report.roles = discover_roles(cloud, cluster_name).await?;
        self.stage(ctx, "roles", delete_roles(cloud, ctx, cluster_name))
            .await?;

        match discover_inventory(cloud, cluster_name).await? {
            Some(inventory) => {
                report.network = Some(inventory.to_state());
                self.stage(ctx, "network", teardown_network(cloud, ctx, &inventory))
                    .await?;
            }
            None => debug!("No owned network"),
        }
        report.cluster = cluster;
        Ok(())
    }

    /// Run one stage, timing it and reporting failure
    async fn stage<T, F>(&self, ctx: &ReconcileContext, stage: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        debug!(stage, elapsed_ms = elapsed.as_millis() as u64, "Stage finished");
        self.observe_stage(ctx, stage, elapsed.as_secs_f64());

        if let Err(e) = &result {
            warn!(stage, error = %e, retriable = e.is_retriable(), "Stage failed");
            ctx.emit(
                Event::new(EventLevel::Error, stage_resource(stage), stage, e.to_string())
                    .with("kind", e.kind()),
            );
            self.observe_error(ctx, stage, e);
        }
        result
    }

    #[cfg(feature = "metrics")]
    fn observe_stage(&self, ctx: &ReconcileContext, stage: &str, seconds: f64) {
        if let Some(metrics) = ctx.metrics() {
            metrics.observe_stage(stage, seconds);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn observe_stage(&self, _ctx: &ReconcileContext, _stage: &str, _seconds: f64) {}

    #[cfg(feature = "metrics")]
    fn observe_error(&self, ctx: &ReconcileContext, stage: &str, err: &Error) {
        if let Some(metrics) = ctx.metrics() {
            metrics.inc_error(stage, err.kind());
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn observe_error(&self, _ctx: &ReconcileContext, _stage: &str, _err: &Error) {}
}
