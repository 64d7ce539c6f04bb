//! Persistent volume reclaim handling
//!
//! [`sync_reclaim_policy`] keeps the reclaim policy of every volume bound to a
//! cluster claim in line with the cluster spec. [`reclaim_deferred_claims`]
//! removes claims that scale-in marked for deferred deletion once their pod
//! is gone for good, deleting the volume with them.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use tidemark_common::crd::{ManagedCluster, MemberType, PvReclaimPolicy};
use tidemark_common::kube_utils::{pod_ordinal, DEFER_DELETING_ANNOTATION};
use tidemark_common::labels::COMPONENT_LABEL;
use tidemark_common::Error;

use crate::controller::Context;
use crate::ordinals::{pod_ordinals, replicas};
use crate::target::MemberTarget;

fn component_of<C: ManagedCluster>(cluster: &C, pvc: &PersistentVolumeClaim) -> Option<MemberType> {
    let member = MemberType::from_label(pvc.labels().get(COMPONENT_LABEL)?)?;
    cluster
        .cluster_kind()
        .owns_component(member)
        .then_some(member)
}

fn bound_volume(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()?
        .volume_name
        .as_deref()
        .filter(|v| !v.is_empty())
}

fn deferred(pvc: &PersistentVolumeClaim) -> bool {
    pvc.annotations().contains_key(DEFER_DELETING_ANNOTATION)
}

/// Align the reclaim policy of every bound volume of `cluster`
pub async fn sync_reclaim_policy<C: ManagedCluster>(ctx: &Context, cluster: &C) -> Result<(), Error> {
    if !ctx.config.pv_access {
        debug!(cluster = %cluster.full_name(), "persistent volume access disabled, skipping reclaim policy");
        return Ok(());
    }
    let ns = cluster.cluster_namespace();
    let selector = cluster
        .cluster_kind()
        .instance_selector(&cluster.name_any())
        .selector();
    let want = cluster.pv_reclaim_policy();

    for pvc in ctx.kube.list_pvcs(&ns, &selector).await? {
        let Some(volume) = bound_volume(&pvc) else {
            continue;
        };
        if cluster.pv_reclaim_enabled() && deferred(&pvc) {
            continue;
        }
        if component_of(cluster, &pvc).is_none() {
            debug!(pvc = %pvc.name_any(), "claim of unknown component, skipping");
            continue;
        }
        let Some(pv) = ctx.kube.get_pv(volume).await? else {
            warn!(cluster = %cluster.full_name(), namespace = %ns, pvc = %pvc.name_any(), pv = %volume,
                "bound volume not found, skipping its reclaim policy");
            continue;
        };
        let current = pv
            .spec
            .as_ref()
            .and_then(|s| s.persistent_volume_reclaim_policy.as_deref());
        if current == Some(want.as_str()) {
            continue;
        }
        ctx.kube.set_pv_reclaim_policy(volume, want.as_str()).await?;
        info!(cluster = %cluster.full_name(), pv = %volume, policy = want.as_str(),
            "updated volume reclaim policy");
    }
    Ok(())
}

/// Delete claims left behind by scale-in, along with their volumes
///
/// Only claims marked for deferred deletion whose ordinal is outside the
/// live range and whose pod no longer exists are touched.
pub async fn reclaim_deferred_claims<C: ManagedCluster>(
    ctx: &Context,
    cluster: &C,
) -> Result<(), Error> {
    if !cluster.pv_reclaim_enabled() {
        return Ok(());
    }
    if !ctx.config.pv_access {
        debug!(cluster = %cluster.full_name(), "persistent volume access disabled, skipping reclaim");
        return Ok(());
    }
    let ns = cluster.cluster_namespace();
    let selector = cluster
        .cluster_kind()
        .instance_selector(&cluster.name_any())
        .selector();

    for pvc in ctx.kube.list_pvcs(&ns, &selector).await? {
        if !deferred(&pvc) {
            continue;
        }
        let name = pvc.name_any();
        let Some(member) = component_of(cluster, &pvc) else {
            continue;
        };
        let Some(target) = MemberTarget::new(cluster, member) else {
            continue;
        };
        let Some(ordinal) = pod_ordinal(&name) else {
            continue;
        };
        let Some(set) = ctx.kube.get_stateful_set(&ns, &target.set_name()).await? else {
            continue;
        };
        if pod_ordinals(replicas(&set), &set).contains(&ordinal) {
            debug!(pvc = %name, ordinal, "claim belongs to a live ordinal, keeping");
            continue;
        }
        let pod = target.pod_name(ordinal);
        if ctx.kube.get_pod(&ns, &pod).await?.is_some() {
            debug!(pvc = %name, pod = %pod, "pod still exists, keeping claim");
            continue;
        }

        if let Some(volume) = bound_volume(&pvc) {
            let delete = PvReclaimPolicy::Delete.as_str();
            if let Some(pv) = ctx.kube.get_pv(volume).await? {
                let current = pv
                    .spec
                    .as_ref()
                    .and_then(|s| s.persistent_volume_reclaim_policy.as_deref());
                if current != Some(delete) {
                    ctx.kube.set_pv_reclaim_policy(volume, delete).await?;
                }
            }
        }
        ctx.kube.delete_pvc(&ns, &name).await?;
        info!(cluster = %cluster.full_name(), pvc = %name, "reclaimed deferred claim");
    }
    Ok(())
}
