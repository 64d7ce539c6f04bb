//! Automatic replacement of failed membership members
//!
//! A member that stays unhealthy for longer than the failover period is
//! recorded as a failure. On the next pass it is removed from the group
//! together with its pod and claims, and the desired replica count grows by
//! one so the StatefulSet controller brings up a replacement. Failures are
//! handled one at a time.

use chrono::Utc;
use kube::runtime::events::EventType;
use tracing::{info, warn};

use tidemark_common::crd::{ComponentStatus, FailureMember};
use tidemark_common::events::{actions, reasons};
use tidemark_common::kube_utils::{is_pod_ready, pod_ordinal};
use tidemark_common::Error;

use crate::controller::Context;
use crate::ordinals::ordinals_for;
use crate::status::membership_client;
use crate::target::MemberTarget;

/// Whether every desired member is back and the failure records can go
pub async fn should_recover(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &ComponentStatus,
) -> Result<bool, Error> {
    if status.failure_members.is_empty() {
        return Ok(false);
    }
    for ordinal in ordinals_for(target.spec.replicas, &target.delete_slots) {
        let name = target.pod_name(ordinal);
        let Some(pod) = ctx.kube.get_pod(&target.namespace, &name).await? else {
            return Ok(false);
        };
        if !is_pod_ready(&pod) || !status.member_healthy(&name) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Forget every failure record
pub async fn recover(ctx: &Context, target: &MemberTarget<'_>, status: &mut ComponentStatus) {
    if status.failure_members.is_empty() {
        return;
    }
    let recovered: Vec<String> = status.failure_members.keys().cloned().collect();
    status.failure_members.clear();
    info!(cluster = %target.full_name(), component = %target.member, ?recovered,
        "all members healthy, clearing failure records");
    ctx.events
        .publish(
            &target.event_ref,
            EventType::Normal,
            reasons::FAILOVER_RECOVERED,
            actions::FAILOVER,
            Some(format!("{} recovered: {}", target.set_name(), recovered.join(", "))),
        )
        .await;
}

/// Advance failover by one step
///
/// Either records a new failure (returning [`Error::Requeue`]) or cleans up
/// the oldest failure that has not been deleted yet.
pub async fn failover(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &mut ComponentStatus,
) -> Result<(), Error> {
    if !status.synced {
        return Err(Error::requeue(format!(
            "{}/{} status is not synced, cannot fail over",
            target.namespace,
            target.set_name()
        )));
    }

    let healthy = status.members.values().filter(|m| m.health).count();
    if healthy <= status.members.len() / 2 {
        return Err(Error::requeue(format!(
            "{}/{} has lost quorum ({healthy}/{} healthy), waiting",
            target.namespace,
            target.set_name(),
            status.members.len()
        )));
    }

    let max = target
        .spec
        .max_failover_count
        .unwrap_or(ctx.config.max_failover_count);
    if status.failure_replicas() >= max {
        warn!(cluster = %target.full_name(), component = %target.member, max,
            "failover limit reached, not replacing more members");
        return Ok(());
    }

    if status.auto_failovering() {
        delete_failure_member(ctx, target, status).await
    } else {
        mark_failure(ctx, target, status).await
    }
}

async fn mark_failure(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &mut ComponentStatus,
) -> Result<(), Error> {
    let desired = ordinals_for(target.spec.replicas, &target.delete_slots);
    let Some(deadline) = Utc::now().checked_sub_signed(ctx.config.failover_period()) else {
        return Ok(());
    };

    let candidate = status.members.values().find(|m| {
        !m.health
            && pod_ordinal(&m.name).is_some_and(|o| desired.contains(&o))
            && !status.failure_members.contains_key(&m.name)
            && m.last_transition_time.is_some_and(|t| t < deadline)
    });
    let Some(member) = candidate.cloned() else {
        return Ok(());
    };

    status.failure_members.insert(
        member.name.clone(),
        FailureMember {
            pod_name: member.name.clone(),
            member_id: member.id.clone(),
            member_deleted: false,
            created_at: Utc::now(),
        },
    );
    warn!(cluster = %target.full_name(), pod = %member.name, member_id = %member.id,
        "member unhealthy past the failover period, marking as failure");
    ctx.events
        .publish(
            &target.event_ref,
            EventType::Warning,
            reasons::MEMBER_FAILED,
            actions::FAILOVER,
            Some(format!("{} member {} marked as failure", member.name, member.id)),
        )
        .await;
    Err(Error::requeue(format!(
        "marking {}/{} member {} as failure",
        target.namespace, member.name, member.id
    )))
}

async fn delete_failure_member(
    ctx: &Context,
    target: &MemberTarget<'_>,
    status: &mut ComponentStatus,
) -> Result<(), Error> {
    let Some(failure) = status
        .failure_members
        .values_mut()
        .find(|m| !m.member_deleted)
    else {
        return Ok(());
    };
    let pod_name = failure.pod_name.clone();

    let client = membership_client(ctx, target).ok_or_else(|| {
        Error::internal_with_context("failover", format!("{} has no membership API", target.member))
    })?;
    client.delete_member(&pod_name).await?;

    ctx.kube.delete_pod(&target.namespace, &pod_name).await?;
    if let Some(ordinal) = pod_ordinal(&pod_name) {
        for volume in target.claim_volume_names() {
            let claim = target.pvc_name(&volume, ordinal);
            if ctx.kube.get_pvc(&target.namespace, &claim).await?.is_some() {
                ctx.kube.delete_pvc(&target.namespace, &claim).await?;
            }
        }
    }

    failure.member_deleted = true;
    info!(cluster = %target.full_name(), pod = %pod_name, "failed member removed, replacement will follow");
    ctx.events
        .publish(
            &target.event_ref,
            EventType::Normal,
            reasons::MEMBER_REPLACED,
            actions::FAILOVER,
            Some(format!("{pod_name} removed from the group with its claims")),
        )
        .await;
    Ok(())
}
