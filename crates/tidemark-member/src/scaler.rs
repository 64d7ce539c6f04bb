//! Scaling state machine
//!
//! Each pass moves a StatefulSet by at most one ordinal. Growth is committed
//! immediately; shrinking a data-holding component first drains the store of
//! the departing pod and only commits once the store is a tombstone or the
//! pod provably never joined.

use std::collections::BTreeSet;

use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use tidemark_common::crd::{ComponentStatus, StoreState};
use tidemark_common::events::{actions, reasons};
use tidemark_common::kube_utils::{is_pod_ready, DEFER_DELETING_ANNOTATION, STORE_ID_LABEL};
use tidemark_common::Error;

use crate::controller::Context;
use crate::ordinals::{
    delete_slots, pod_ordinals, replicas, reset_replicas, set_replicas_and_delete_slots,
};
use crate::status::membership_client;
use crate::target::MemberTarget;

/// Direction of a single scaling step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleDirection {
    /// Add one ordinal
    Out,
    /// Remove one ordinal
    In,
    /// Ordinal sets already match
    None,
}

/// The one-ordinal step from an observed set toward a desired one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleStep {
    /// Which way to move
    pub direction: ScaleDirection,
    /// Ordinal added or removed; -1 when not scaling
    pub ordinal: i32,
    /// Replica count after the step
    pub replicas: i32,
    /// Delete slots after the step
    pub delete_slots: BTreeSet<i32>,
}

/// Compute the next step from `old` toward `desired`
///
/// Additions win over deletions so capacity never dips during a reshuffle of
/// delete slots; the lowest addition and the highest deletion go first.
pub fn scale_one(old: &StatefulSet, desired: &StatefulSet) -> ScaleStep {
    let observed = pod_ordinals(replicas(old), old);
    let wanted = pod_ordinals(replicas(desired), desired);
    let mut slots = delete_slots(old);
    let desired_slots = delete_slots(desired);

    if let Some(&ordinal) = wanted.difference(&observed).next() {
        if !desired_slots.contains(&ordinal) {
            slots.remove(&ordinal);
        }
        return ScaleStep {
            direction: ScaleDirection::Out,
            ordinal,
            replicas: replicas(old) + 1,
            delete_slots: slots,
        };
    }
    if let Some(&ordinal) = observed.difference(&wanted).last() {
        if desired_slots.contains(&ordinal) {
            slots.insert(ordinal);
        }
        return ScaleStep {
            direction: ScaleDirection::In,
            ordinal,
            replicas: replicas(old) - 1,
            delete_slots: slots,
        };
    }
    ScaleStep {
        direction: ScaleDirection::None,
        ordinal: -1,
        replicas: replicas(old),
        delete_slots: slots,
    }
}

/// Adjust `desired` so the set moves at most one ordinal this pass
///
/// Returns [`Error::Requeue`] while a store is draining or a pod is inside
/// its join grace window.
pub async fn scale(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &ComponentStatus,
    old: &StatefulSet,
    desired: StatefulSet,
) -> Result<StatefulSet, Error> {
    let step = scale_one(old, &desired);
    match step.direction {
        ScaleDirection::None => Ok(desired),
        ScaleDirection::Out => scale_out(ctx, target, old, desired, step).await,
        ScaleDirection::In => scale_in(ctx, target, status, old, desired, step).await,
    }
}

async fn scale_out(
    ctx: &Context,
    target: &MemberTarget<'_>,
    old: &StatefulSet,
    desired: StatefulSet,
    step: ScaleStep,
) -> Result<StatefulSet, Error> {
    let mut set = reset_replicas(desired, old);
    delete_deferred_claims(ctx, target, step.ordinal).await?;
    set_replicas_and_delete_slots(&mut set, step.replicas, &step.delete_slots);

    info!(cluster = %target.full_name(), component = %target.member, ordinal = step.ordinal,
        replicas = step.replicas, "scaling out");
    ctx.events
        .publish(
            &target.event_ref,
            EventType::Normal,
            reasons::SCALE_OUT,
            actions::SCALE,
            Some(format!(
                "{} scaled out to {} replicas, adding {}",
                target.set_name(),
                step.replicas,
                target.pod_name(step.ordinal)
            )),
        )
        .await;
    Ok(set)
}

async fn scale_in(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &ComponentStatus,
    old: &StatefulSet,
    desired: StatefulSet,
    step: ScaleStep,
) -> Result<StatefulSet, Error> {
    let mut set = reset_replicas(desired, old);
    if target.member.holds_data() {
        drain_store(ctx, target, status, step.ordinal).await?;
    }
    mark_deferred_deletion(ctx, target, step.ordinal).await?;
    set_replicas_and_delete_slots(&mut set, step.replicas, &step.delete_slots);

    info!(cluster = %target.full_name(), component = %target.member, ordinal = step.ordinal,
        replicas = step.replicas, "scaling in");
    ctx.events
        .publish(
            &target.event_ref,
            EventType::Normal,
            reasons::SCALE_IN,
            actions::SCALE,
            Some(format!(
                "{} scaled in to {} replicas, removing {}",
                target.set_name(),
                step.replicas,
                target.pod_name(step.ordinal)
            )),
        )
        .await;
    Ok(set)
}

/// Gate the removal of a data-holding pod on its store
///
/// `Ok` means the ordinal may leave the live range.
async fn drain_store(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &ComponentStatus,
    ordinal: i32,
) -> Result<(), Error> {
    let pod_name = target.pod_name(ordinal);
    if !status.synced {
        return Err(Error::requeue(format!(
            "{}/{pod_name}: store status is not synced, cannot scale in",
            target.namespace
        )));
    }
    let pod = ctx
        .kube
        .get_pod(&target.namespace, &pod_name)
        .await?
        .ok_or_else(|| Error::not_found("Pod", format!("{}/{pod_name}", target.namespace)))?;

    if let Some(store) = status.stores.values().find(|s| s.pod_name == pod_name) {
        if store.state != StoreState::Offline {
            let id: u64 = store.id.parse().map_err(|_| {
                Error::internal_with_context("scaler", format!("store id {:?} is not numeric", store.id))
            })?;
            let client = membership_client(ctx, target).ok_or_else(|| {
                Error::internal_with_context("scaler", format!("{} has no membership API", target.member))
            })?;
            client.delete_store(id).await?;
            info!(pod = %pod_name, store_id = id, "requested store deletion");
            ctx.events
                .publish(
                    &target.event_ref,
                    EventType::Normal,
                    reasons::STORE_DELETE_REQUESTED,
                    actions::SCALE,
                    Some(format!("draining store {id} of {pod_name}")),
                )
                .await;
        }
        return Err(Error::requeue(format!(
            "{}/{pod_name} store {} is still in cluster, state: {:?}",
            target.namespace, store.id, store.state
        )));
    }

    let labelled = pod.labels().get(STORE_ID_LABEL);
    let tombstoned = status
        .tombstone_stores
        .values()
        .any(|s| s.pod_name == pod_name && labelled == Some(&s.id));
    if tombstoned {
        debug!(pod = %pod_name, "store is a tombstone, committing scale in");
        return Ok(());
    }

    if !is_pod_ready(&pod) {
        if within_grace(ctx, &pod) {
            return Err(Error::requeue(format!(
                "{}/{pod_name} is not ready, waiting for it to join or time out",
                target.namespace
            )));
        }
        info!(pod = %pod_name, "pod never joined within its grace window, removing");
        return Ok(());
    }

    Err(Error::internal_with_context(
        "scaler",
        format!("{}/{pod_name} is ready but no store was found for it", target.namespace),
    ))
}

fn within_grace(ctx: &Context, pod: &Pod) -> bool {
    let Some(created) = pod.metadata.creation_timestamp.as_ref() else {
        warn!(pod = %pod.name_any(), "pod has no creation timestamp, treating its grace window as over");
        return false;
    };
    match created.0.checked_add_signed(ctx.config.unjoined_grace()) {
        Some(end) => Utc::now() < end,
        None => true,
    }
}

/// Mark every claim of `ordinal` for deferred deletion
pub(crate) async fn mark_deferred_deletion(
    ctx: &Context,
    target: &MemberTarget<'_>,
    ordinal: i32,
) -> Result<(), Error> {
    let now = Utc::now().to_rfc3339();
    for volume in target.claim_volume_names() {
        let name = target.pvc_name(&volume, ordinal);
        let Some(pvc) = ctx.kube.get_pvc(&target.namespace, &name).await? else {
            debug!(pvc = %name, "claim not found, nothing to mark");
            continue;
        };
        if pvc.annotations().contains_key(DEFER_DELETING_ANNOTATION) {
            continue;
        }
        ctx.kube
            .annotate_pvc(&target.namespace, &name, DEFER_DELETING_ANNOTATION, &now)
            .await?;
        info!(pvc = %name, "marked claim for deferred deletion");
    }
    Ok(())
}

/// Delete claims of `ordinal` left over from an earlier scale in
async fn delete_deferred_claims(
    ctx: &Context,
    target: &MemberTarget<'_>,
    ordinal: i32,
) -> Result<(), Error> {
    for volume in target.claim_volume_names() {
        let name = target.pvc_name(&volume, ordinal);
        let Some(pvc) = ctx.kube.get_pvc(&target.namespace, &name).await? else {
            continue;
        };
        if pvc.annotations().contains_key(DEFER_DELETING_ANNOTATION) {
            ctx.kube.delete_pvc(&target.namespace, &name).await?;
            info!(pvc = %name, "deleted deferred claim before scaling out");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MockMembershipClient;
    use crate::ordinals::set_delete_slots;
    use crate::testing::{context, db_cluster, pod, seed_component, SharedWorld};
    use chrono::Duration;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use tidemark_common::crd::{MemberType, StoreStatus};

    fn set(replicas: i32, slots: &[i32]) -> StatefulSet {
        let mut s = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        };
        set_delete_slots(&mut s, &slots.iter().copied().collect());
        s
    }

    fn store_status(id: &str, pod: &str, state: StoreState) -> StoreStatus {
        StoreStatus {
            id: id.to_string(),
            pod_name: pod.to_string(),
            state,
            ..Default::default()
        }
    }

    mod step {
        use super::*;

        #[test]
        fn equal_sets_do_not_scale() {
            let step = scale_one(&set(3, &[]), &set(3, &[]));
            assert_eq!(step.direction, ScaleDirection::None);
            assert_eq!(step.replicas, 3);
        }

        #[test]
        fn scale_out_adds_the_lowest_missing_ordinal() {
            let step = scale_one(&set(3, &[]), &set(5, &[]));
            assert_eq!(step.direction, ScaleDirection::Out);
            assert_eq!(step.ordinal, 3);
            assert_eq!(step.replicas, 4);
        }

        #[test]
        fn scale_in_removes_the_highest_ordinal() {
            let step = scale_one(&set(5, &[]), &set(3, &[]));
            assert_eq!(step.direction, ScaleDirection::In);
            assert_eq!(step.ordinal, 4);
            assert_eq!(step.replicas, 4);
        }

        #[test]
        fn new_delete_slot_removes_that_ordinal_and_records_it() {
            // {0,1,2} -> {0,2,3}: adding 3 comes first.
            let step = scale_one(&set(3, &[]), &set(3, &[1]));
            assert_eq!(step.direction, ScaleDirection::Out);
            assert_eq!(step.ordinal, 3);
            assert!(step.delete_slots.is_empty());

            // {0,1,2,3} -> {0,2,3}: then 1 leaves and becomes a slot.
            let step = scale_one(&set(4, &[]), &set(3, &[1]));
            assert_eq!(step.direction, ScaleDirection::In);
            assert_eq!(step.ordinal, 1);
            assert_eq!(step.delete_slots, BTreeSet::from([1]));
        }

        #[test]
        fn dropping_a_delete_slot_re_adds_the_ordinal() {
            let step = scale_one(&set(3, &[1]), &set(3, &[]));
            assert_eq!(step.direction, ScaleDirection::Out);
            assert_eq!(step.ordinal, 1);
            assert!(step.delete_slots.is_empty());
            assert_eq!(step.replicas, 4);
        }
    }

    mod data_scale_in {
        use super::*;

        struct Fixture {
            world: SharedWorld,
            old: StatefulSet,
            desired: StatefulSet,
        }

        fn fixture(target: &MemberTarget<'_>) -> Fixture {
            let world = SharedWorld::default();
            seed_component(&world, target, &ComponentStatus::default());
            let old = world.set(&target.set_name());
            let mut desired = old.clone();
            desired.spec.as_mut().unwrap().replicas = Some(2);
            Fixture {
                world,
                old,
                desired,
            }
        }

        fn synced(stores: Vec<StoreStatus>, tombstones: Vec<StoreStatus>) -> ComponentStatus {
            ComponentStatus {
                synced: true,
                stores: stores.into_iter().map(|s| (s.id.clone(), s)).collect(),
                tombstone_stores: tombstones.into_iter().map(|s| (s.id.clone(), s)).collect(),
                ..Default::default()
            }
        }

        /// Story: the departing pod's store is Up, so the scaler asks the
        /// placement driver to drain it and keeps the replicas.
        #[tokio::test]
        async fn story_up_store_is_drained_before_removal() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            let mut membership = MockMembershipClient::new();
            membership
                .expect_delete_store()
                .withf(|id| *id == 12)
                .times(1)
                .returning(|_| Ok(()));
            let ctx = context(&f.world, membership);
            let status = synced(
                vec![store_status("12", "basic-store-2", StoreState::Up)],
                vec![],
            );

            let err = scale(&ctx, &target, &status, &f.old, f.desired)
                .await
                .unwrap_err();
            assert!(err.is_requeue());
            assert!(err.to_string().contains("still in cluster"));
            assert_eq!(replicas(&f.world.set("basic-store")), 3);
            assert!(f.world.writes().is_empty());
        }

        /// Story: an Offline store is already draining; no second delete.
        #[tokio::test]
        async fn story_offline_store_is_not_deleted_again() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            let ctx = context(&f.world, MockMembershipClient::new());
            let status = synced(
                vec![store_status("12", "basic-store-2", StoreState::Offline)],
                vec![],
            );

            let err = scale(&ctx, &target, &status, &f.old, f.desired)
                .await
                .unwrap_err();
            assert!(err.is_requeue());
        }

        /// Story: once the store is a tombstone and the pod carries its id,
        /// the claims are marked and the shrink is committed.
        #[tokio::test]
        async fn story_tombstone_store_commits_the_shrink() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            f.world
                .lock()
                .pods
                .get_mut("basic-store-2")
                .unwrap()
                .labels_mut()
                .insert(STORE_ID_LABEL.into(), "12".into());
            let ctx = context(&f.world, MockMembershipClient::new());
            let status = synced(
                vec![],
                vec![store_status("12", "basic-store-2", StoreState::Tombstone)],
            );

            let set = scale(&ctx, &target, &status, &f.old, f.desired)
                .await
                .unwrap();
            assert_eq!(replicas(&set), 2);
            let claim = f.world.pvc("store-basic-store-2").unwrap();
            assert!(claim.annotations().contains_key(DEFER_DELETING_ANNOTATION));
        }

        /// Story: a tombstone whose id does not match the pod's label belongs
        /// to an earlier incarnation; a ready pod then has no store at all.
        #[tokio::test]
        async fn story_stale_tombstone_does_not_release_a_ready_pod() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            f.world
                .lock()
                .pods
                .get_mut("basic-store-2")
                .unwrap()
                .labels_mut()
                .insert(STORE_ID_LABEL.into(), "30".into());
            let ctx = context(&f.world, MockMembershipClient::new());
            let status = synced(
                vec![],
                vec![store_status("12", "basic-store-2", StoreState::Tombstone)],
            );

            let err = scale(&ctx, &target, &status, &f.old, f.desired)
                .await
                .unwrap_err();
            assert!(!err.is_requeue());
            assert!(err.to_string().contains("no store was found"));
        }

        /// Story: a pod that is not ready and still young may yet join.
        #[tokio::test]
        async fn story_young_unready_pod_is_waited_for() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            let mut young = pod(&target, 2, false);
            young.metadata.creation_timestamp = Some(Time(Utc::now()));
            f.world.lock().pods.insert("basic-store-2".into(), young);
            let ctx = context(&f.world, MockMembershipClient::new());

            let err = scale(&ctx, &target, &synced(vec![], vec![]), &f.old, f.desired)
                .await
                .unwrap_err();
            assert!(err.is_requeue());
        }

        /// Story: a pod that never became ready within the grace window is
        /// removed without a store.
        #[tokio::test]
        async fn story_old_unready_pod_is_removed() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            let mut stuck = pod(&target, 2, false);
            stuck.metadata.creation_timestamp = Some(Time(Utc::now() - Duration::hours(2)));
            f.world.lock().pods.insert("basic-store-2".into(), stuck);
            let ctx = context(&f.world, MockMembershipClient::new());

            let set = scale(&ctx, &target, &synced(vec![], vec![]), &f.old, f.desired)
                .await
                .unwrap();
            assert_eq!(replicas(&set), 2);
        }

        /// Story: a not-ready pod without a creation timestamp cannot wait
        /// forever; it is removed like one whose window has passed.
        #[tokio::test]
        async fn story_unready_pod_without_timestamp_is_removed() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            let mut stuck = pod(&target, 2, false);
            stuck.metadata.creation_timestamp = None;
            f.world.lock().pods.insert("basic-store-2".into(), stuck);
            let ctx = context(&f.world, MockMembershipClient::new());

            let set = scale(&ctx, &target, &synced(vec![], vec![]), &f.old, f.desired)
                .await
                .unwrap();
            assert_eq!(replicas(&set), 2);
        }

        #[tokio::test]
        async fn unbounded_grace_window_keeps_waiting() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            let mut stuck = pod(&target, 2, false);
            stuck.metadata.creation_timestamp = Some(Time(Utc::now() - Duration::hours(2)));
            f.world.lock().pods.insert("basic-store-2".into(), stuck);
            let mut ctx = context(&f.world, MockMembershipClient::new());
            ctx.config.resync_interval = std::time::Duration::from_secs(u64::MAX / 2);

            let err = scale(&ctx, &target, &synced(vec![], vec![]), &f.old, f.desired)
                .await
                .unwrap_err();
            assert!(err.is_requeue());
        }

        /// Story: without a synced store view the scaler refuses to guess.
        #[tokio::test]
        async fn story_unsynced_status_blocks_scale_in() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            let ctx = context(&f.world, MockMembershipClient::new());

            let err = scale(&ctx, &target, &ComponentStatus::default(), &f.old, f.desired)
                .await
                .unwrap_err();
            assert!(err.is_requeue());
        }

        /// Story: the departing pod is gone from the API; that is fatal.
        #[tokio::test]
        async fn story_missing_pod_is_fatal() {
            let cluster = db_cluster("basic", 3, Some(3));
            let target = MemberTarget::new(&cluster, MemberType::Store).unwrap();
            let f = fixture(&target);
            f.world.lock().pods.remove("basic-store-2");
            let ctx = context(&f.world, MockMembershipClient::new());

            let err = scale(&ctx, &target, &synced(vec![], vec![]), &f.old, f.desired)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::NotFound { .. }));
        }
    }

    mod other_components {
        use super::*;

        /// Story: shrinking a membership component commits immediately and
        /// marks the departing claims.
        #[tokio::test]
        async fn story_membership_scale_in_marks_and_commits() {
            let cluster = db_cluster("basic", 3, None);
            let target = MemberTarget::new(&cluster, MemberType::Pd).unwrap();
            let world = SharedWorld::default();
            seed_component(&world, &target, &ComponentStatus::default());
            let old = world.set("basic-pd");
            let mut desired = old.clone();
            desired.spec.as_mut().unwrap().replicas = Some(1);
            let ctx = context(&world, MockMembershipClient::new());

            let set = scale(&ctx, &target, &ComponentStatus::default(), &old, desired)
                .await
                .unwrap();
            assert_eq!(replicas(&set), 2);
            assert_eq!(world.writes(), vec!["annotate pvc pd-basic-pd-2 tidemark.io/defer-deleting"]);
        }

        /// Story: scaling out over a previously removed ordinal deletes its
        /// stale claim so the new pod starts from a fresh volume.
        #[tokio::test]
        async fn story_scale_out_deletes_the_stale_claim() {
            let cluster = db_cluster("basic", 3, None);
            let target = MemberTarget::new(&cluster, MemberType::Pd).unwrap();
            let world = SharedWorld::default();
            seed_component(&world, &target, &ComponentStatus::default());
            let ctx = context(&world, MockMembershipClient::new());

            // Shrink to 2, then grow back to 3.
            let old = world.set("basic-pd");
            let mut two = old.clone();
            two.spec.as_mut().unwrap().replicas = Some(2);
            let shrunk = scale(&ctx, &target, &ComponentStatus::default(), &old, two)
                .await
                .unwrap();
            let grown = scale(&ctx, &target, &ComponentStatus::default(), &shrunk, old.clone())
                .await
                .unwrap();

            assert_eq!(replicas(&grown), 3);
            assert!(world.pvc("pd-basic-pd-2").is_none());
            assert!(world.wrote("delete pvc pd-basic-pd-2"));
        }

        /// Story: growing by two only adds one ordinal per pass.
        #[tokio::test]
        async fn story_scale_out_moves_one_ordinal() {
            let cluster = db_cluster("basic", 3, None);
            let target = MemberTarget::new(&cluster, MemberType::Pd).unwrap();
            let world = SharedWorld::default();
            seed_component(&world, &target, &ComponentStatus::default());
            let ctx = context(&world, MockMembershipClient::new());

            let old = world.set("basic-pd");
            let mut five = old.clone();
            five.spec.as_mut().unwrap().replicas = Some(5);
            let set = scale(&ctx, &target, &ComponentStatus::default(), &old, five)
                .await
                .unwrap();
            assert_eq!(replicas(&set), 4);
        }
    }
}
