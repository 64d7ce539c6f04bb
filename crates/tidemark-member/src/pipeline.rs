//! The member reconciliation pipeline
//!
//! [`sync_member`] converges one component: services, status projection,
//! config, StatefulSet creation, then the ordered StatefulSet steps from
//! [`plan_steps`] and a final idempotent apply. [`sync_db_cluster`] and
//! [`sync_migration_cluster`] run it for every component of a cluster in
//! dependency order.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use tidemark_common::crd::{
    ComponentStatus, DbCluster, DbClusterStatus, ManagedCluster, MemberPhase, MemberType,
    MembershipModel, MigrationCluster, MigrationClusterStatus, StatefulSetMirror,
};
use tidemark_common::events::{actions, reasons};
use tidemark_common::Error;

use crate::controller::Context;
use crate::drift::{
    merge_stateful_set, prepare_stateful_set, resolve_config_map, resolve_service,
    template_equal, Resolution,
};
use crate::ordinals::{replicas, reset_replicas, set_partition};
use crate::target::MemberTarget;
use crate::{failover, scaler, status};

// =============================================================================
// Decision table
// =============================================================================

/// One StatefulSet step of a pass, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetStep {
    /// Roll every pod at once; ends the pass
    ForceUpgrade,
    /// Move replicas one ordinal toward the desired count
    Scale,
    /// Clear failure records
    Recover,
    /// Mark or replace a failed member
    Failover,
    /// Advance the rolling upgrade
    Upgrade,
}

/// Facts about a component that decide which steps run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepInputs {
    /// Status projection reached the membership API
    pub synced: bool,
    /// Force-upgrade annotation is set
    pub force_upgrade: bool,
    /// Automatic failover is enabled
    pub auto_failover: bool,
    /// The component has members that can fail over
    pub tracks_membership: bool,
    /// Every desired member is back after a failover
    pub should_recover: bool,
    /// The StatefulSet reports as many pods as desired
    pub all_pods_started: bool,
    /// As many healthy members as desired replicas
    pub all_members_ready: bool,
    /// A recorded failure has not been cleaned up yet
    pub auto_failovering: bool,
    /// The pod template differs from the last applied one
    pub template_changed: bool,
    /// The component is already upgrading
    pub upgrading: bool,
}

/// Steps to run this pass, top to bottom
pub fn plan_steps(inputs: &StepInputs) -> Vec<SetStep> {
    if !inputs.synced && inputs.force_upgrade {
        return vec![SetStep::ForceUpgrade];
    }
    let mut steps = vec![SetStep::Scale];
    if inputs.auto_failover && inputs.tracks_membership {
        if inputs.should_recover {
            steps.push(SetStep::Recover);
        } else if (inputs.all_pods_started && !inputs.all_members_ready)
            || inputs.auto_failovering
        {
            steps.push(SetStep::Failover);
        }
    }
    if inputs.template_changed || inputs.upgrading {
        steps.push(SetStep::Upgrade);
    }
    steps
}

async fn step_inputs(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &ComponentStatus,
    old: &StatefulSet,
    desired: &StatefulSet,
) -> Result<StepInputs, Error> {
    let tracks_membership = target.member.membership_model() == MembershipModel::Members;
    let auto_failover = ctx.config.auto_failover;
    let should_recover = if auto_failover && tracks_membership {
        failover::should_recover(ctx, target, status).await?
    } else {
        false
    };
    let wanted = replicas(desired);
    Ok(StepInputs {
        synced: status.synced,
        force_upgrade: target.force_upgrade,
        auto_failover,
        tracks_membership,
        should_recover,
        all_pods_started: status.observed_replicas() == wanted,
        all_members_ready: status.members.len() == wanted as usize
            && status.members.values().all(|m| m.health),
        auto_failovering: status.auto_failovering(),
        template_changed: !template_equal(desired, old),
        upgrading: status.phase == MemberPhase::Upgrade,
    })
}

// =============================================================================
// Component sync
// =============================================================================

/// Converge one component of a cluster
///
/// Returns [`Error::Requeue`] while the component waits on pods, stores or
/// members; any other error is fatal for the pass.
pub async fn sync_member(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &mut ComponentStatus,
) -> Result<(), Error> {
    let ns = &target.namespace;
    sync_service(ctx, target, ctx.templates.client_service(target), true).await?;
    sync_service(ctx, target, ctx.templates.peer_service(target), false).await?;

    let old = ctx.kube.get_stateful_set(ns, &target.set_name()).await?;
    if let Err(e) = status::project(ctx, target, old.as_ref(), status).await {
        warn!(cluster = %target.full_name(), component = %target.member, error = %e,
            "failed to project status");
    }

    if target.paused {
        info!(cluster = %target.full_name(), component = %target.member, "cluster is paused, skipping");
        return Ok(());
    }
    if target.member.holds_data() {
        status::label_store_pods(ctx, target, status).await;
    }

    let config_map = sync_config_map(ctx, target).await?;
    let desired = ctx.templates.stateful_set(target, status, &config_map)?;

    let Some(old) = old else {
        let set = prepare_stateful_set(desired)?;
        ctx.kube.create_stateful_set(ns, &set).await?;
        info!(cluster = %target.full_name(), statefulset = %set.name_any(), "created statefulset");
        status.stateful_set = Some(StatefulSetMirror::default());
        return Err(Error::requeue(format!(
            "waiting for {ns}/{} to be running",
            target.set_name()
        )));
    };

    let inputs = step_inputs(ctx, target, status, &old, &desired).await?;
    let mut desired = desired;
    for step in plan_steps(&inputs) {
        debug!(component = %target.member, ?step, "running step");
        desired = match step {
            SetStep::ForceUpgrade => return force_upgrade(ctx, target, status, &old, desired).await,
            SetStep::Scale => scaler::scale(ctx, target, status, &old, desired).await?,
            SetStep::Recover => {
                failover::recover(ctx, target, status).await;
                desired
            }
            SetStep::Failover => {
                failover::failover(ctx, target, status).await?;
                desired
            }
            SetStep::Upgrade => {
                ctx.upgrader
                    .upgrade(ctx, target, status, &old, desired)
                    .await?
            }
        };
    }

    apply(ctx, target, &old, &desired).await
}

async fn sync_service(
    ctx: &Context,
    target: &MemberTarget<'_>,
    desired: Service,
    preserve_cluster_ip: bool,
) -> Result<(), Error> {
    let name = desired.name_any();
    let existing = ctx.kube.get_service(&target.namespace, &name).await?;
    match resolve_service(desired, existing.as_ref(), preserve_cluster_ip)? {
        Resolution::Create(svc) => {
            ctx.kube.create_service(&target.namespace, &svc).await?;
            info!(cluster = %target.full_name(), service = %name, "created service");
        }
        Resolution::Update(svc) => {
            ctx.kube.update_service(&target.namespace, &svc).await?;
            info!(cluster = %target.full_name(), service = %name, "updated service");
        }
        Resolution::Unchanged => {}
    }
    Ok(())
}

/// Converge the ConfigMap and return its name
async fn sync_config_map(ctx: &Context, target: &MemberTarget<'_>) -> Result<String, Error> {
    let desired = ctx.templates.config_map(target);
    let name = desired.name_any();
    let existing = ctx.kube.get_config_map(&target.namespace, &name).await?;
    match resolve_config_map(desired, existing.as_ref()) {
        Resolution::Create(cm) => {
            ctx.kube.create_config_map(&target.namespace, &cm).await?;
            info!(cluster = %target.full_name(), configmap = %name, "created configmap");
        }
        Resolution::Update(cm) => {
            ctx.kube.update_config_map(&target.namespace, &cm).await?;
            info!(cluster = %target.full_name(), configmap = %name, "updated configmap");
        }
        Resolution::Unchanged => {}
    }
    Ok(name)
}

async fn force_upgrade(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &mut ComponentStatus,
    old: &StatefulSet,
    desired: StatefulSet,
) -> Result<(), Error> {
    status.phase = MemberPhase::Upgrade;
    let mut desired = reset_replicas(desired, old);
    set_partition(&mut desired, 0);
    apply(ctx, target, old, &desired).await?;

    warn!(cluster = %target.full_name(), component = %target.member,
        "status is not synced and force upgrade is requested, rolling every pod");
    ctx.events
        .publish(
            &target.event_ref,
            EventType::Warning,
            reasons::FORCE_UPGRADE,
            actions::UPGRADE,
            Some(format!("{} force upgraded", target.set_name())),
        )
        .await;
    Err(Error::requeue(format!(
        "{}/{} needs force upgrade",
        target.namespace,
        target.set_name()
    )))
}

async fn apply(
    ctx: &Context,
    target: &MemberTarget<'_>,
    old: &StatefulSet,
    desired: &StatefulSet,
) -> Result<(), Error> {
    match merge_stateful_set(desired, old)? {
        Some(set) => {
            ctx.kube.update_stateful_set(&target.namespace, &set).await?;
            info!(cluster = %target.full_name(), statefulset = %set.name_any(),
                replicas = replicas(&set), "updated statefulset");
        }
        None => debug!(statefulset = %target.set_name(), "statefulset unchanged"),
    }
    Ok(())
}

// =============================================================================
// Cluster sync
// =============================================================================

/// Per-component status of a cluster kind
trait ComponentStatuses {
    fn component_mut(&mut self, member: MemberType) -> Option<&mut ComponentStatus>;
}

impl ComponentStatuses for DbClusterStatus {
    fn component_mut(&mut self, member: MemberType) -> Option<&mut ComponentStatus> {
        DbClusterStatus::component_mut(self, member)
    }
}

impl ComponentStatuses for MigrationClusterStatus {
    fn component_mut(&mut self, member: MemberType) -> Option<&mut ComponentStatus> {
        MigrationClusterStatus::component_mut(self, member)
    }
}

/// Component that must be available before `member` is reconciled
fn depends_on(member: MemberType) -> Option<MemberType> {
    match member {
        MemberType::Store => Some(MemberType::Pd),
        MemberType::Worker => Some(MemberType::Master),
        MemberType::Pd | MemberType::Master => None,
    }
}

/// Whether a membership component has a healthy, ready majority
fn available(replicas: i32, status: &ComponentStatus) -> bool {
    let majority = replicas / 2 + 1;
    let healthy = status.members.values().filter(|m| m.health).count() as i32;
    let ready = status.stateful_set.as_ref().map_or(0, |s| s.ready_replicas);
    status.members.len() as i32 >= majority && healthy >= majority && ready >= majority
}

async fn sync_cluster<C, S>(ctx: &Context, cluster: &C, status: &mut S) -> Result<(), Error>
where
    C: ManagedCluster,
    S: ComponentStatuses + Send,
{
    for &member in cluster.cluster_kind().components() {
        let Some(target) = MemberTarget::new(cluster, member) else {
            debug!(cluster = %cluster.full_name(), component = %member, "component not deployed");
            continue;
        };
        if let Some(dependency) = depends_on(member) {
            let replicas = cluster.component(dependency).map_or(0, |s| s.replicas);
            let ready = status
                .component_mut(dependency)
                .is_some_and(|s| available(replicas, s));
            if !ready {
                return Err(Error::requeue(format!(
                    "{}: {member} waiting for {dependency} to be running",
                    cluster.full_name()
                )));
            }
        }
        let Some(component) = status.component_mut(member) else {
            continue;
        };
        sync_member(ctx, &target, component).await?;
    }
    Ok(())
}

/// Converge every component of a DbCluster
pub async fn sync_db_cluster(
    ctx: &Context,
    cluster: &DbCluster,
    status: &mut DbClusterStatus,
) -> Result<(), Error> {
    sync_cluster(ctx, cluster, status).await
}

/// Converge every component of a MigrationCluster
pub async fn sync_migration_cluster(
    ctx: &Context,
    cluster: &MigrationCluster,
    status: &mut MigrationClusterStatus,
) -> Result<(), Error> {
    sync_cluster(ctx, cluster, status).await
}
