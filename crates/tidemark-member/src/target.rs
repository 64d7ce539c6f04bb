//! One component of one cluster, as seen by a reconciliation pass
//!
//! [`MemberTarget`] snapshots everything the pipeline needs from the cluster
//! object so the downstream stages never touch the concrete CRD type.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::warn;

use tidemark_common::crd::{ComponentSpec, ManagedCluster, MemberType};
use tidemark_common::kube_utils::ordinal_pod_name;
use tidemark_common::labels::{ClusterKind, Labels};

use crate::ordinals::parse_delete_slots;

/// A component of a cluster under reconciliation
#[derive(Clone, Debug)]
pub struct MemberTarget<'a> {
    /// Kind of the owning cluster
    pub kind: ClusterKind,
    /// Namespace of the owning cluster
    pub namespace: String,
    /// Name of the owning cluster
    pub cluster: String,
    /// The component
    pub member: MemberType,
    /// Desired state of the component
    pub spec: &'a ComponentSpec,
    /// Whether the cluster is paused
    pub paused: bool,
    /// Whether the membership API uses TLS
    pub tls: bool,
    /// Whether the force-upgrade annotation is set
    pub force_upgrade: bool,
    /// Ordinals reserved by the cluster's delete-slots annotation
    pub delete_slots: BTreeSet<i32>,
    /// Owner reference stamped on created objects
    pub owner: Option<OwnerReference>,
    /// Reference used for events
    pub event_ref: ObjectReference,
}

impl<'a> MemberTarget<'a> {
    /// Snapshot `member` of `cluster`; `None` when the component is not deployed
    pub fn new<C: ManagedCluster>(cluster: &'a C, member: MemberType) -> Option<Self> {
        let spec = cluster.component(member)?;
        let delete_slots = match parse_delete_slots(cluster.delete_slots_annotation(member)) {
            Ok(slots) => slots,
            Err(e) => {
                warn!(cluster = %cluster.full_name(), component = %member, error = %e,
                    "ignoring malformed delete-slots annotation");
                BTreeSet::new()
            }
        };
        Some(Self {
            kind: cluster.cluster_kind(),
            namespace: cluster.cluster_namespace(),
            cluster: cluster.name_any(),
            member,
            spec,
            paused: cluster.paused(),
            tls: cluster.tls_enabled(),
            force_upgrade: cluster.force_upgrade_requested(),
            delete_slots,
            owner: cluster.owner_reference(),
            event_ref: cluster.event_reference(),
        })
    }

    /// `namespace/cluster` for logs and error context
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.cluster)
    }

    /// StatefulSet and client Service name
    pub fn set_name(&self) -> String {
        format!("{}-{}", self.cluster, self.member)
    }

    /// Headless peer Service name
    pub fn peer_service_name(&self) -> String {
        format!("{}-peer", self.set_name())
    }

    /// Client Service of the component answering membership queries
    pub fn membership_service_name(&self) -> Option<String> {
        self.member
            .membership_endpoint()
            .map(|m| format!("{}-{}", self.cluster, m))
    }

    /// Name of the pod at `ordinal`
    pub fn pod_name(&self, ordinal: i32) -> String {
        ordinal_pod_name(&self.set_name(), ordinal)
    }

    /// Name of the primary data volume claim template
    pub fn data_volume_name(&self) -> String {
        self.member.as_str().to_string()
    }

    /// Name of a secondary volume claim template
    pub fn secondary_volume_name(&self, volume: &str) -> String {
        format!("{}-{}", self.member, volume)
    }

    /// Claim template names: the primary volume first, then secondary ones
    pub fn claim_volume_names(&self) -> Vec<String> {
        std::iter::once(self.data_volume_name())
            .chain(
                self.spec
                    .storage_volumes
                    .iter()
                    .map(|v| self.secondary_volume_name(&v.name)),
            )
            .collect()
    }

    /// Name of the claim created from template `volume` for `ordinal`
    pub fn pvc_name(&self, volume: &str, ordinal: i32) -> String {
        format!("{volume}-{}-{ordinal}", self.set_name())
    }

    /// Labels of every object belonging to the component
    pub fn labels(&self) -> Labels {
        Labels::for_component(self.kind, &self.cluster, self.member)
    }

    /// Label selector string for the component's pods and claims
    pub fn selector(&self) -> String {
        self.labels().selector()
    }

    /// Replicas including replacements for deleted failure members
    pub fn desired_replicas(&self, failure_replicas: i32) -> i32 {
        self.spec.replicas + failure_replicas
    }
}
