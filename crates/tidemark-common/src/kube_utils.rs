//! Kubernetes helpers shared by the reconciliation core and the operator
//!
//! Annotation and label keys, the last-applied-configuration record used for
//! drift detection, storage quantity parsing and a stable content digest.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Error;

/// Field manager used for every write the operator issues
pub const FIELD_MANAGER: &str = "tidemark-controller";

/// JSON of the spec the operator last applied to an object
pub const LAST_APPLIED_ANNOTATION: &str = "tidemark.io/last-applied-configuration";

/// Set on a claim whose replica was scaled in; value is the RFC 3339 mark time
pub const DEFER_DELETING_ANNOTATION: &str = "tidemark.io/defer-deleting";

/// Cluster annotation that forces a rollout of every ordinal
pub const FORCE_UPGRADE_ANNOTATION: &str = "tidemark.io/force-upgrade";

/// StatefulSet annotation holding the JSON array of reserved ordinals
pub const DELETE_SLOTS_ANNOTATION: &str = "tidemark.io/delete-slots";

/// Suffix of the per-component cluster annotation, `<component>.tidemark.io/delete-slots`
pub const DELETE_SLOTS_ANNOTATION_SUFFIX: &str = "tidemark.io/delete-slots";

/// Pod label carrying the id of the store the pod owns
pub const STORE_ID_LABEL: &str = "tidemark.io/store-id";

/// Label the StatefulSet controller puts on each pod
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";

// =============================================================================
// Last-applied configuration
// =============================================================================

/// Record `applied` as the last-applied configuration of `meta`
pub fn set_last_applied<T: Serialize>(meta: &mut ObjectMeta, applied: &T) -> Result<(), Error> {
    let json = serde_json::to_string(applied)?;
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), json);
    Ok(())
}

/// Decode the last-applied configuration of `meta`
///
/// Returns `None` when the annotation is missing or unreadable; callers treat
/// both as "differs from desired".
pub fn last_applied<T: DeserializeOwned>(meta: &ObjectMeta) -> Option<T> {
    meta.annotations
        .as_ref()?
        .get(LAST_APPLIED_ANNOTATION)
        .and_then(|raw| serde_json::from_str(raw).ok())
}

// =============================================================================
// Pods
// =============================================================================

/// Whether the pod has a `Ready=True` condition
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Name of the pod at `ordinal` of the StatefulSet `set_name`
pub fn ordinal_pod_name(set_name: &str, ordinal: i32) -> String {
    format!("{set_name}-{ordinal}")
}

/// Ordinal encoded in a StatefulSet pod name
pub fn pod_ordinal(pod_name: &str) -> Option<i32> {
    pod_name
        .rsplit_once('-')
        .and_then(|(_, ordinal)| ordinal.parse().ok())
}

// =============================================================================
// Quantities
// =============================================================================

/// Parse a Kubernetes storage quantity into bytes
///
/// Supports binary (`Ki`..`Ei`) and decimal (`k`..`E`) suffixes and
/// fractional values such as `1.5Gi`.
pub fn parse_quantity(value: &str) -> Result<f64, Error> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let unparsable = || Error::validation(format!("unparsable storage quantity {value:?}"));

    let number: f64 = number.parse().map_err(|_| unparsable())?;
    let multiplier = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => return Err(unparsable()),
    };
    Ok(number * multiplier)
}

// =============================================================================
// Digests and status
// =============================================================================

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so the value is stable across toolchains; it is
/// persisted in object names.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Patch the status sub-resource of a namespaced resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl Serialize,
) -> Result<(), Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
