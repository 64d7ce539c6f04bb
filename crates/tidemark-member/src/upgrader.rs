//! Rolling upgrades driven through the StatefulSet partition
//!
//! The StatefulSet controller only replaces pods whose ordinal is at or above
//! the partition. [`PartitionUpgrader`] lowers the partition one pod at a
//! time, from the highest ordinal down, and only after every pod already on
//! the new revision is healthy again.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use tidemark_common::crd::{ComponentStatus, MemberPhase, MembershipModel};
use tidemark_common::kube_utils::{is_pod_ready, CONTROLLER_REVISION_HASH_LABEL};
use tidemark_common::Error;

use crate::controller::Context;
use crate::drift::template_equal;
use crate::ordinals::{partition, pod_ordinals, replicas, set_partition};
use crate::target::MemberTarget;

/// Drives a template change through the pods of a component
#[async_trait]
pub trait Upgrader: Send + Sync {
    /// Return `desired` with the update strategy for this pass
    async fn upgrade(
        &self,
        ctx: &Context,
        target: &MemberTarget<'_>,
        status: &mut ComponentStatus,
        old: &StatefulSet,
        desired: StatefulSet,
    ) -> Result<StatefulSet, Error>;
}

/// Default upgrader: one pod per pass, highest ordinal first
#[derive(Clone, Debug, Default)]
pub struct PartitionUpgrader;

#[async_trait]
impl Upgrader for PartitionUpgrader {
    async fn upgrade(
        &self,
        ctx: &Context,
        target: &MemberTarget<'_>,
        status: &mut ComponentStatus,
        old: &StatefulSet,
        mut desired: StatefulSet,
    ) -> Result<StatefulSet, Error> {
        let workload = target.member.membership_model() == MembershipModel::Workload;
        if !status.synced && !workload {
            return Err(Error::requeue(format!(
                "{}/{} status is not synced, cannot upgrade",
                target.namespace,
                target.set_name()
            )));
        }

        if status.phase == MemberPhase::Scale {
            debug!(component = %target.member, "scaling in progress, holding the rollout");
            if let Some(p) = partition(old) {
                set_partition(&mut desired, p);
            }
            return Ok(desired);
        }

        status.phase = MemberPhase::Upgrade;
        if !template_equal(&desired, old) {
            return Ok(desired);
        }

        let (current, update) = status
            .stateful_set
            .as_ref()
            .map(|m| (m.current_revision.clone(), m.update_revision.clone()))
            .unwrap_or_default();
        if current == update {
            return Ok(desired);
        }

        let strategy = old.spec.as_ref().and_then(|s| s.update_strategy.clone());
        let Some(old_partition) = partition(old) else {
            warn!(cluster = %target.full_name(), component = %target.member,
                "statefulset is not partitioned, leaving the rollout to its own strategy");
            if let Some(spec) = desired.spec.as_mut() {
                spec.update_strategy = strategy;
            }
            return Ok(desired);
        };
        if strategy.as_ref().and_then(|s| s.type_.as_deref()) == Some("OnDelete") {
            warn!(cluster = %target.full_name(), component = %target.member,
                "statefulset uses OnDelete, leaving the rollout to its own strategy");
            if let Some(spec) = desired.spec.as_mut() {
                spec.update_strategy = strategy;
            }
            return Ok(desired);
        }
        set_partition(&mut desired, old_partition);

        for ordinal in pod_ordinals(replicas(old), old).into_iter().rev() {
            let name = target.pod_name(ordinal);
            let pod = ctx
                .kube
                .get_pod(&target.namespace, &name)
                .await?
                .ok_or_else(|| {
                    Error::requeue(format!("{}/{name} not found, waiting to upgrade", target.namespace))
                })?;
            let Some(revision) = pod.labels().get(CONTROLLER_REVISION_HASH_LABEL) else {
                return Err(Error::requeue(format!(
                    "{}/{name} has no {CONTROLLER_REVISION_HASH_LABEL} label",
                    target.namespace
                )));
            };

            if update.as_ref() == Some(revision) {
                let healthy = if workload {
                    is_pod_ready(&pod)
                } else {
                    status.member_healthy(&name)
                };
                if !healthy {
                    return Err(Error::requeue(format!(
                        "{}/{name} is upgraded but not healthy yet",
                        target.namespace
                    )));
                }
                continue;
            }

            info!(cluster = %target.full_name(), pod = %name, ordinal, "upgrading pod");
            set_partition(&mut desired, ordinal);
            return Ok(desired);
        }
        Ok(desired)
    }
}
