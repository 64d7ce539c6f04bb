//! Status projection
//!
//! Folds the live StatefulSet, its pods and the cluster's membership API into
//! a component's [`ComponentStatus`]. The projector only reads; the one write
//! it owns is the best-effort store-id pod label of [`label_store_pods`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use tidemark_common::crd::{
    ComponentStatus, MemberPhase, MemberStatus, MemberType, MembershipModel, StatefulSetMirror,
    StoreState, StoreStatus, UnjoinedMember,
};
use tidemark_common::kube_utils::{is_pod_ready, CONTROLLER_REVISION_HASH_LABEL, STORE_ID_LABEL};
use tidemark_common::Error;

use crate::controller::Context;
use crate::membership::{Member, MembershipClient};
use crate::ordinals;
use crate::target::MemberTarget;

/// Project the observed state of `target` into `status`
///
/// A missing StatefulSet leaves `status` untouched. When the membership API
/// cannot be reached `synced` is cleared and the error is returned; the
/// StatefulSet mirror and phase are still updated.
pub async fn project(
    ctx: &Context,
    target: &MemberTarget<'_>,
    set: Option<&StatefulSet>,
    status: &mut ComponentStatus,
) -> Result<(), Error> {
    let Some(set) = set else {
        debug!(component = %target.member, "no statefulset yet, skipping status projection");
        return Ok(());
    };

    let pods = ctx
        .kube
        .list_pods(&target.namespace, &target.selector())
        .await?;
    status.phase = phase(target, status, set, &pods);
    status.stateful_set = Some(mirror(set));
    status.image = container_image(set, target.member);

    let joined = match target.member.membership_model() {
        MembershipModel::Members => project_members(ctx, target, status).await?,
        MembershipModel::Stores => project_stores(ctx, target, status).await?,
        MembershipModel::Workload => {
            project_workload(&pods, status);
            return Ok(());
        }
    };
    track_unjoined(ctx, target, &pods, &joined, status).await
}

/// Whether the StatefulSet controller is still rolling out a revision
pub fn stateful_set_upgrading(set: &StatefulSet) -> bool {
    let Some(observed) = set.status.as_ref() else {
        return false;
    };
    if observed.current_revision != observed.update_revision {
        return true;
    }
    let generation = set.metadata.generation.unwrap_or_default();
    generation > observed.observed_generation.unwrap_or_default()
        && ordinals::replicas(set) == observed.replicas
}

fn pods_behind_update_revision(set: &StatefulSet, pods: &[Pod]) -> bool {
    let Some(update) = set
        .status
        .as_ref()
        .and_then(|s| s.update_revision.as_deref())
    else {
        return false;
    };
    pods.iter().any(|pod| {
        pod.labels()
            .get(CONTROLLER_REVISION_HASH_LABEL)
            .map(String::as_str)
            != Some(update)
    })
}

fn phase(
    target: &MemberTarget<'_>,
    status: &ComponentStatus,
    set: &StatefulSet,
    pods: &[Pod],
) -> MemberPhase {
    if target.desired_replicas(status.failure_replicas()) != ordinals::replicas(set) {
        MemberPhase::Scale
    } else if stateful_set_upgrading(set) || pods_behind_update_revision(set, pods) {
        MemberPhase::Upgrade
    } else {
        MemberPhase::Normal
    }
}

fn mirror(set: &StatefulSet) -> StatefulSetMirror {
    let observed = set.status.clone().unwrap_or_default();
    StatefulSetMirror {
        replicas: observed.replicas,
        ready_replicas: observed.ready_replicas.unwrap_or_default(),
        current_replicas: observed.current_replicas.unwrap_or_default(),
        updated_replicas: observed.updated_replicas.unwrap_or_default(),
        current_revision: observed.current_revision,
        update_revision: observed.update_revision,
        observed_generation: observed.observed_generation,
    }
}

fn container_image(set: &StatefulSet, member: MemberType) -> Option<String> {
    set.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == member.as_str())
        .and_then(|c| c.image.clone())
}

pub(crate) fn membership_client(
    ctx: &Context,
    target: &MemberTarget<'_>,
) -> Option<Arc<dyn MembershipClient>> {
    let endpoint = target.member.membership_endpoint()?;
    Some(
        ctx.membership
            .client(&target.namespace, &target.cluster, endpoint, target.tls),
    )
}

/// Attach the state of the membership service's endpoints to `err`
async fn explain_unreachable(ctx: &Context, target: &MemberTarget<'_>, err: Error) -> Error {
    let Some(service) = target.membership_service_name() else {
        return err;
    };
    match ctx.kube.get_endpoints(&target.namespace, &service).await {
        Err(lookup) => Error::membership(
            &service,
            format!("{err}; endpoints lookup failed: {lookup}"),
        ),
        Ok(Some(endpoints))
            if endpoints.subsets.as_ref().map_or(true, Vec::is_empty) =>
        {
            Error::membership(
                &service,
                format!("{err}, service {}/{service} has no endpoints", target.namespace),
            )
        }
        Ok(_) => err,
    }
}

fn transition_time(
    unchanged: Option<Option<DateTime<Utc>>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match unchanged {
        Some(previous) => previous,
        None => Some(now),
    }
}

fn member_status(
    member: &Member,
    health: bool,
    previous: Option<&MemberStatus>,
    now: DateTime<Utc>,
) -> MemberStatus {
    let unchanged = previous
        .filter(|p| p.health == health)
        .map(|p| p.last_transition_time);
    MemberStatus {
        name: member.name.clone(),
        id: member.id.clone(),
        client_url: member.client_urls.first().cloned().unwrap_or_default(),
        health,
        last_transition_time: transition_time(unchanged, now),
    }
}

async fn project_members(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &mut ComponentStatus,
) -> Result<BTreeSet<String>, Error> {
    let Some(client) = membership_client(ctx, target) else {
        return Ok(BTreeSet::new());
    };
    let members = match client.get_members().await {
        Ok(members) => members,
        Err(e) => {
            status.synced = false;
            return Err(explain_unreachable(ctx, target, e).await);
        }
    };
    let leader = match client.get_leader().await {
        Ok(leader) => leader,
        Err(e) => {
            status.synced = false;
            return Err(e);
        }
    };

    let now = Utc::now();
    let mut projected = BTreeMap::new();
    for member in &members {
        if member.name.is_empty() {
            warn!(component = %target.member, member_id = %member.id,
                "member has no name yet, skipping");
            continue;
        }
        let previous = status.members.get(&member.name);
        projected.insert(
            member.name.clone(),
            member_status(member, member.alive, previous, now),
        );
    }

    status.synced = true;
    status.leader = Some(member_status(&leader, true, status.leader.as_ref(), now));
    status.members = projected;
    Ok(status.members.keys().cloned().collect())
}

async fn project_stores(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &mut ComponentStatus,
) -> Result<BTreeSet<String>, Error> {
    let Some(client) = membership_client(ctx, target) else {
        return Ok(BTreeSet::new());
    };
    let stores = match client.get_stores().await {
        Ok(stores) => stores,
        Err(e) => {
            status.synced = false;
            return Err(explain_unreachable(ctx, target, e).await);
        }
    };

    let prefix = format!("{}-", target.set_name());
    let now = Utc::now();
    let mut live = BTreeMap::new();
    let mut tombstones = BTreeMap::new();
    for store in stores {
        let pod_name = store.pod_name().to_string();
        if !pod_name.starts_with(&prefix) {
            continue;
        }
        let Some(state) = StoreState::parse(&store.state) else {
            warn!(store_id = store.id, state = %store.state, "store in unknown state, skipping");
            continue;
        };
        let id = store.id.to_string();
        let unchanged = status
            .stores
            .get(&id)
            .or_else(|| status.tombstone_stores.get(&id))
            .filter(|p| p.state == state)
            .map(|p| p.last_transition_time);
        let projected = StoreStatus {
            id: id.clone(),
            pod_name,
            address: store.address,
            state,
            last_transition_time: transition_time(unchanged, now),
        };
        if state == StoreState::Tombstone {
            tombstones.insert(id, projected);
        } else {
            live.insert(id, projected);
        }
    }

    status.synced = true;
    status.stores = live;
    status.tombstone_stores = tombstones;
    Ok(status.stores.values().map(|s| s.pod_name.clone()).collect())
}

fn project_workload(pods: &[Pod], status: &mut ComponentStatus) {
    let now = Utc::now();
    let members: BTreeMap<String, MemberStatus> = pods
        .iter()
        .map(|pod| {
            let name = pod.name_any();
            let health = is_pod_ready(pod);
            let unchanged = status
                .members
                .get(&name)
                .filter(|p| p.health == health)
                .map(|p| p.last_transition_time);
            let projected = MemberStatus {
                name: name.clone(),
                id: pod.uid().unwrap_or_default(),
                client_url: String::new(),
                health,
                last_transition_time: transition_time(unchanged, now),
            };
            (name, projected)
        })
        .collect();
    status.members = members;
    status.leader = None;
    status.synced = true;
}

async fn claim_uids(
    ctx: &Context,
    target: &MemberTarget<'_>,
    pod: &Pod,
) -> Result<BTreeSet<String>, Error> {
    let claims = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|c| c.claim_name.clone());
    let mut uids = BTreeSet::new();
    for claim in claims {
        if let Some(uid) = ctx
            .kube
            .get_pvc(&target.namespace, &claim)
            .await?
            .and_then(|pvc| pvc.uid())
        {
            uids.insert(uid);
        }
    }
    Ok(uids)
}

async fn track_unjoined(
    ctx: &Context,
    target: &MemberTarget<'_>,
    pods: &[Pod],
    joined: &BTreeSet<String>,
    status: &mut ComponentStatus,
) -> Result<(), Error> {
    let joined: BTreeSet<String> = joined.iter().map(|n| n.to_lowercase()).collect();
    let now = Utc::now();
    let mut unjoined = BTreeMap::new();
    for pod in pods {
        let name = pod.name_any();
        if joined.contains(&name.to_lowercase()) {
            continue;
        }
        let created_at = status
            .unjoined_members
            .get(&name)
            .map_or(now, |m| m.created_at);
        let pvc_uids = claim_uids(ctx, target, pod).await?;
        unjoined.insert(
            name.clone(),
            UnjoinedMember {
                pod_name: name,
                pvc_uids,
                created_at,
            },
        );
    }
    status.unjoined_members = unjoined;
    Ok(())
}

/// Label each pod with the id of the store it owns
///
/// Failures are logged and skipped; the label is retried on the next pass.
pub async fn label_store_pods(ctx: &Context, target: &MemberTarget<'_>, status: &ComponentStatus) {
    if status.stores.is_empty() {
        return;
    }
    let pods = match ctx
        .kube
        .list_pods(&target.namespace, &target.selector())
        .await
    {
        Ok(pods) => pods,
        Err(e) => {
            warn!(component = %target.member, error = %e, "failed to list pods for store labels");
            return;
        }
    };
    let pods: BTreeMap<String, Pod> = pods.into_iter().map(|p| (p.name_any(), p)).collect();
    for store in status.stores.values() {
        let Some(pod) = pods.get(&store.pod_name) else {
            continue;
        };
        if pod.labels().get(STORE_ID_LABEL) == Some(&store.id) {
            continue;
        }
        if let Err(e) = ctx
            .kube
            .label_pod(&target.namespace, &store.pod_name, STORE_ID_LABEL, &store.id)
            .await
        {
            warn!(pod = %store.pod_name, store_id = %store.id, error = %e,
                "failed to label pod with its store id");
        }
    }
}
