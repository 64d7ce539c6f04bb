//! Ordinal bookkeeping for StatefulSets
//!
//! A component's replica range is `replicas` ordinals counted from 0 while
//! skipping reserved delete slots, so `replicas=3, slots={1}` means pods 0, 2
//! and 3. Slots at or beyond the range do not widen it and are dropped.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetUpdateStrategy,
};

use tidemark_common::kube_utils::DELETE_SLOTS_ANNOTATION;
use tidemark_common::Error;

/// Parse a JSON array of ordinals; a missing value is the empty set
pub fn parse_delete_slots(raw: Option<&str>) -> Result<BTreeSet<i32>, Error> {
    match raw {
        None => Ok(BTreeSet::new()),
        Some(raw) if raw.trim().is_empty() => Ok(BTreeSet::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            Error::serialization_for_kind("StatefulSet", format!("delete slots {raw:?}: {e}"))
        }),
    }
}

/// Delete slots recorded on a StatefulSet; malformed values read as empty
pub fn delete_slots(set: &StatefulSet) -> BTreeSet<i32> {
    let raw = set
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DELETE_SLOTS_ANNOTATION))
        .map(String::as_str);
    parse_delete_slots(raw).unwrap_or_default()
}

/// Record delete slots on a StatefulSet, removing the annotation when empty
pub fn set_delete_slots(set: &mut StatefulSet, slots: &BTreeSet<i32>) {
    let annotations = set.metadata.annotations.get_or_insert_with(Default::default);
    if slots.is_empty() {
        annotations.remove(DELETE_SLOTS_ANNOTATION);
    } else {
        let ordinals: Vec<i32> = slots.iter().copied().collect();
        annotations.insert(
            DELETE_SLOTS_ANNOTATION.to_string(),
            serde_json::Value::from(ordinals).to_string(),
        );
    }
}

/// `spec.replicas`, defaulting to 1 as the API server does
pub fn replicas(set: &StatefulSet) -> i32 {
    set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// The live ordinals of `replicas` pods given reserved `slots`
pub fn ordinals_for(replicas: i32, slots: &BTreeSet<i32>) -> BTreeSet<i32> {
    let mut range = replicas.max(0);
    let mut reserved = BTreeSet::new();
    for &slot in slots {
        if slot >= 0 && slot < range {
            range += 1;
            reserved.insert(slot);
        }
    }
    (0..range).filter(|o| !reserved.contains(o)).collect()
}

/// The live ordinals of `set` when it runs `replicas` pods
pub fn pod_ordinals(replicas: i32, set: &StatefulSet) -> BTreeSet<i32> {
    ordinals_for(replicas, &delete_slots(set))
}

/// Set the replica count and delete slots in one step
pub fn set_replicas_and_delete_slots(set: &mut StatefulSet, replicas: i32, slots: &BTreeSet<i32>) {
    set.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
    set_delete_slots(set, slots);
}

/// Copy replicas and delete slots from `old` into `set`
pub fn reset_replicas(mut set: StatefulSet, old: &StatefulSet) -> StatefulSet {
    let slots = delete_slots(old);
    set_replicas_and_delete_slots(&mut set, replicas(old), &slots);
    set
}

/// Rolling-update partition, if the set uses one
pub fn partition(set: &StatefulSet) -> Option<i32> {
    set.spec
        .as_ref()?
        .update_strategy
        .as_ref()?
        .rolling_update
        .as_ref()?
        .partition
}

/// Switch the set to partitioned rolling updates at `partition`
pub fn set_partition(set: &mut StatefulSet, partition: i32) {
    let spec = set.spec.get_or_insert_with(Default::default);
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateStatefulSetStrategy {
            partition: Some(partition),
            ..Default::default()
        }),
    });
}
