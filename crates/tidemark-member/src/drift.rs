//! Drift resolution between desired and observed objects
//!
//! Comparisons run against the last-applied-configuration annotation rather
//! than the live spec, so fields the API server fills in (cluster IPs,
//! defaulted probes, revision history) never register as drift.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use tidemark_common::kube_utils::{last_applied, set_last_applied, LAST_APPLIED_ANNOTATION};
use tidemark_common::Error;

/// What to do with an object after comparing desired and observed
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution<T> {
    /// Create the object
    Create(T),
    /// Replace the observed object with this merged value
    Update(T),
    /// Desired equals observed
    Unchanged,
}

// =============================================================================
// Services
// =============================================================================

/// Whether `existing` was last applied with the spec of `desired`
pub fn service_equal(desired: &Service, existing: &Service) -> bool {
    match last_applied::<ServiceSpec>(&existing.metadata) {
        Some(applied) => Some(applied) == desired.spec,
        None => false,
    }
}

/// Decide how to converge a Service
///
/// `preserve_cluster_ip` keeps the IP the API server assigned; it must be off
/// for headless services.
pub fn resolve_service(
    desired: Service,
    existing: Option<&Service>,
    preserve_cluster_ip: bool,
) -> Result<Resolution<Service>, Error> {
    let Some(existing) = existing else {
        let mut created = desired;
        let spec = created.spec.clone();
        set_last_applied(&mut created.metadata, &spec)?;
        return Ok(Resolution::Create(created));
    };
    if service_equal(&desired, existing) {
        return Ok(Resolution::Unchanged);
    }

    let mut merged = existing.clone();
    merged.spec = desired.spec.clone();
    set_last_applied(&mut merged.metadata, &desired.spec)?;
    if preserve_cluster_ip {
        let observed = existing.spec.as_ref();
        let spec = merged.spec.get_or_insert_with(Default::default);
        spec.cluster_ip = observed.and_then(|s| s.cluster_ip.clone());
        spec.cluster_ips = observed.and_then(|s| s.cluster_ips.clone());
    }
    if let Some(annotations) = desired.metadata.annotations {
        merged
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .extend(annotations);
    }
    Ok(Resolution::Update(merged))
}

// =============================================================================
// ConfigMaps
// =============================================================================

/// Decide how to converge a ConfigMap
pub fn resolve_config_map(
    desired: ConfigMap,
    existing: Option<&ConfigMap>,
) -> Resolution<ConfigMap> {
    let Some(existing) = existing else {
        return Resolution::Create(desired);
    };
    let labels_match = desired
        .metadata
        .labels
        .as_ref()
        .map_or(true, |want| {
            let have = existing.metadata.labels.clone().unwrap_or_default();
            want.iter().all(|(k, v)| have.get(k) == Some(v))
        });
    if existing.data == desired.data && existing.binary_data == desired.binary_data && labels_match
    {
        return Resolution::Unchanged;
    }
    let mut merged = existing.clone();
    merged.data = desired.data;
    merged.binary_data = desired.binary_data;
    if let Some(labels) = desired.metadata.labels {
        merged
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels);
    }
    Resolution::Update(merged)
}

// =============================================================================
// StatefulSets
// =============================================================================

fn annotations_without_last_applied(meta: &ObjectMeta) -> BTreeMap<String, String> {
    let mut annotations = meta.annotations.clone().unwrap_or_default();
    annotations.remove(LAST_APPLIED_ANNOTATION);
    annotations
}

fn applied_spec(set: &StatefulSet) -> Option<StatefulSetSpec> {
    last_applied(&set.metadata)
}

/// Whether the pod template of `desired` equals the one last applied to `existing`
pub fn template_equal(desired: &StatefulSet, existing: &StatefulSet) -> bool {
    match (applied_spec(existing), desired.spec.as_ref()) {
        (Some(applied), Some(spec)) => applied.template == spec.template,
        _ => false,
    }
}

/// Whether applying `desired` over `existing` would change anything we own
///
/// Compares annotations, replicas, pod template and update strategy.
pub fn stateful_set_equal(desired: &StatefulSet, existing: &StatefulSet) -> bool {
    if annotations_without_last_applied(&desired.metadata)
        != annotations_without_last_applied(&existing.metadata)
    {
        return false;
    }
    match (applied_spec(existing), desired.spec.as_ref()) {
        (Some(applied), Some(spec)) => {
            applied.replicas == spec.replicas
                && applied.template == spec.template
                && applied.update_strategy == spec.update_strategy
        }
        _ => false,
    }
}

/// Merge `desired` into `existing`, or `None` when no update is needed
///
/// Server-managed fields of `existing` are kept; orphaned sets are adopted by
/// taking over the desired owner references and labels.
pub fn merge_stateful_set(
    desired: &StatefulSet,
    existing: &StatefulSet,
) -> Result<Option<StatefulSet>, Error> {
    let orphan = existing
        .metadata
        .owner_references
        .as_ref()
        .map_or(true, |refs| !refs.iter().any(|r| r.controller == Some(true)));
    if stateful_set_equal(desired, existing) && !orphan {
        return Ok(None);
    }

    let mut merged = existing.clone();
    let want = desired.spec.clone().unwrap_or_default();
    {
        let spec = merged.spec.get_or_insert_with(Default::default);
        spec.template = want.template;
        spec.replicas = want.replicas;
        spec.update_strategy = want.update_strategy;
    }
    merged.metadata.annotations = Some(annotations_without_last_applied(&desired.metadata));
    if orphan {
        merged.metadata.owner_references = desired.metadata.owner_references.clone();
        merged.metadata.labels = desired.metadata.labels.clone();
    }
    let spec = merged.spec.clone();
    set_last_applied(&mut merged.metadata, &spec)?;
    Ok(Some(merged))
}

/// Prepare a brand-new StatefulSet for creation
pub fn prepare_stateful_set(mut desired: StatefulSet) -> Result<StatefulSet, Error> {
    let spec = desired.spec.clone();
    set_last_applied(&mut desired.metadata, &spec)?;
    Ok(desired)
}
