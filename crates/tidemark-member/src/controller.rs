//! Controller wiring for DbCluster and MigrationCluster
//!
//! A reconcile pass works on a local copy of the cluster status: reclaim
//! policies first, then every component through the member pipeline, then
//! deferred-claim reclamation and volume expansion. The status is patched
//! once at the end, and only when it changed.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, instrument, warn};

use tidemark_common::crd::{
    DbCluster, DbClusterStatus, ManagedCluster, MigrationCluster, MigrationClusterStatus,
};
#[cfg(test)]
use tidemark_common::events::NoopEventPublisher;
use tidemark_common::events::{EventPublisher, KubeEventPublisher};
use tidemark_common::kube_utils::FIELD_MANAGER;
use tidemark_common::{Error, UNKNOWN_CONTEXT};

use crate::client::{KubeClient, KubeClientImpl};
use crate::config::MemberConfig;
use crate::membership::{HttpMembershipClientFactory, MembershipClientFactory};
use crate::pipeline::{sync_db_cluster, sync_migration_cluster};
use crate::reclaim::{reclaim_deferred_claims, sync_reclaim_policy};
use crate::resizer::{resize_db_cluster, resize_migration_cluster};
use crate::templates::{DefaultTemplates, MemberTemplates};
use crate::upgrader::{PartitionUpgrader, Upgrader};

/// Shared context for the cluster controllers
///
/// Holds the clients and strategies every pass uses. Build it with
/// [`Context::builder`]; every dependency can be overridden.
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Source of membership API clients
    pub membership: Arc<dyn MembershipClientFactory>,
    /// Desired-object builders
    pub templates: Arc<dyn MemberTemplates>,
    /// Rolling-upgrade driver
    pub upgrader: Arc<dyn Upgrader>,
    /// Kubernetes event sink
    pub events: Arc<dyn EventPublisher>,
    /// Reconciliation tunables
    pub config: MemberConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        membership: Arc<dyn MembershipClientFactory>,
    ) -> Self {
        Self {
            kube,
            membership,
            templates: Arc::new(DefaultTemplates),
            upgrader: Arc::new(PartitionUpgrader),
            events: Arc::new(NoopEventPublisher),
            config: MemberConfig::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .build()?;
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    membership: Option<Arc<dyn MembershipClientFactory>>,
    templates: Option<Arc<dyn MemberTemplates>>,
    upgrader: Option<Arc<dyn Upgrader>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: MemberConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            membership: None,
            templates: None,
            upgrader: None,
            events: None,
            config: MemberConfig::default(),
        }
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the membership client factory
    pub fn membership_factory(mut self, factory: Arc<dyn MembershipClientFactory>) -> Self {
        self.membership = Some(factory);
        self
    }

    /// Override the desired-object builders
    pub fn templates(mut self, templates: Arc<dyn MemberTemplates>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Override the rolling-upgrade driver
    pub fn upgrader(mut self, upgrader: Arc<dyn Upgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    /// Override the event sink
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the reconciliation tunables
    pub fn config(mut self, config: MemberConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let membership: Arc<dyn MembershipClientFactory> = match self.membership {
            Some(factory) => factory,
            None => Arc::new(HttpMembershipClientFactory::new(self.config.membership_timeout)?),
        };
        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            membership,
            templates: self.templates.unwrap_or_else(|| Arc::new(DefaultTemplates)),
            upgrader: self.upgrader.unwrap_or_else(|| Arc::new(PartitionUpgrader)),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, FIELD_MANAGER))),
            config: self.config,
        })
    }
}

/// Turn the outcome of a pass and its status patch into a controller action
fn settle(
    ctx: &Context,
    outcome: Result<(), Error>,
    patched: Result<(), Error>,
) -> Result<Action, Error> {
    match (outcome, patched) {
        (Err(e), patched) if !e.is_requeue() => {
            if let Err(p) = patched {
                warn!(error = %p, "failed to persist status of a failed pass");
            }
            Err(e)
        }
        (_, Err(p)) => Err(p),
        (Err(wait), Ok(())) => {
            info!(reason = %wait, "waiting, requeueing");
            Ok(Action::requeue(ctx.config.requeue_delay))
        }
        (Ok(()), Ok(())) => Ok(Action::requeue(ctx.config.resync_interval)),
    }
}

async fn db_pass(
    ctx: &Context,
    cluster: &DbCluster,
    status: &mut DbClusterStatus,
) -> Result<(), Error> {
    sync_reclaim_policy(ctx, cluster).await?;
    sync_db_cluster(ctx, cluster, status).await?;
    reclaim_deferred_claims(ctx, cluster).await?;
    resize_db_cluster(ctx, cluster).await
}

async fn migration_pass(
    ctx: &Context,
    cluster: &MigrationCluster,
    status: &mut MigrationClusterStatus,
) -> Result<(), Error> {
    sync_reclaim_policy(ctx, cluster).await?;
    sync_migration_cluster(ctx, cluster, status).await?;
    reclaim_deferred_claims(ctx, cluster).await?;
    resize_migration_cluster(ctx, cluster).await
}

/// Reconcile a DbCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.full_name()))]
pub async fn reconcile_db(cluster: Arc<DbCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    info!("reconciling db cluster");
    cluster
        .spec
        .validate()
        .map_err(|e| with_cluster(e, &cluster.full_name()))?;

    let original = cluster.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let outcome = db_pass(&ctx, &cluster, &mut status).await;
    let patched = if status != original {
        ctx.kube
            .patch_db_cluster_status(&cluster.cluster_namespace(), &cluster.name_any(), &status)
            .await
    } else {
        Ok(())
    };
    settle(&ctx, outcome, patched)
}

/// Reconcile a MigrationCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.full_name()))]
pub async fn reconcile_migration(
    cluster: Arc<MigrationCluster>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    info!("reconciling migration cluster");
    cluster
        .spec
        .validate()
        .map_err(|e| with_cluster(e, &cluster.full_name()))?;

    let original = cluster.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let outcome = migration_pass(&ctx, &cluster, &mut status).await;
    let patched = if status != original {
        ctx.kube
            .patch_migration_cluster_status(&cluster.cluster_namespace(), &cluster.name_any(), &status)
            .await
    } else {
        Ok(())
    };
    settle(&ctx, outcome, patched)
}

/// Attach the cluster name to a validation error raised without one
fn with_cluster(error: Error, cluster: &str) -> Error {
    if error.cluster() != Some(UNKNOWN_CONTEXT) {
        return error;
    }
    match error {
        Error::Validation { message, field, .. } => Error::Validation {
            cluster: cluster.to_string(),
            message,
            field,
        },
        other => other,
    }
}

/// Error policy for both controllers
///
/// Logs the failure and requeues after a short delay.
pub fn error_policy<C: ManagedCluster>(cluster: Arc<C>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.full_name(),
        context = error.context().unwrap_or(UNKNOWN_CONTEXT),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
