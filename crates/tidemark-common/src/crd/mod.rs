//! Custom Resource Definitions for tidemark
//!
//! Both cluster kinds share the component model in [`types`] and expose it to
//! the reconciliation core through [`ManagedCluster`].

mod db_cluster;
mod migration_cluster;
mod types;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

pub use db_cluster::{DbCluster, DbClusterSpec, DbClusterStatus};
pub use migration_cluster::{MigrationCluster, MigrationClusterSpec, MigrationClusterStatus};
pub use types::{
    ComponentSpec, ComponentStatus, FailureMember, MemberPhase, MemberStatus, MemberType,
    MembershipModel, PvReclaimPolicy, ServiceOverride, StatefulSetMirror, StorageVolume,
    StoreState, StoreStatus, UnjoinedMember,
};

use crate::kube_utils::{DELETE_SLOTS_ANNOTATION_SUFFIX, FORCE_UPGRADE_ANNOTATION};
use crate::labels::ClusterKind;

/// Read access to a cluster object for the reconciliation core
///
/// Implemented by every cluster CRD. The core never branches on the concrete
/// type; kind-specific behaviour lives on [`ClusterKind`].
pub trait ManagedCluster: Resource<DynamicType = ()> + Sized + Send + Sync {
    /// Kind of this cluster
    fn cluster_kind(&self) -> ClusterKind;

    /// Whether mutation is administratively paused
    fn paused(&self) -> bool;

    /// Whether the membership API is served over TLS
    fn tls_enabled(&self) -> bool;

    /// Desired state of a component, `None` when not deployed
    fn component(&self, member: MemberType) -> Option<&ComponentSpec>;

    /// Reclaim policy for bound volumes
    fn pv_reclaim_policy(&self) -> PvReclaimPolicy;

    /// Whether deferred-deletion claims are reclaimed after scale-in
    fn pv_reclaim_enabled(&self) -> bool;

    /// Namespace of the cluster object
    fn cluster_namespace(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// `namespace/name`, used in logs and error context
    fn full_name(&self) -> String {
        format!("{}/{}", self.cluster_namespace(), self.name_any())
    }

    /// Whether the force-upgrade annotation is set to "true"
    fn force_upgrade_requested(&self) -> bool {
        self.annotations()
            .get(FORCE_UPGRADE_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// Raw delete-slots annotation for a component
    fn delete_slots_annotation(&self, member: MemberType) -> Option<&str> {
        self.annotations()
            .get(&format!("{member}.{DELETE_SLOTS_ANNOTATION_SUFFIX}"))
            .map(String::as_str)
    }

    /// Controller owner reference for objects created on behalf of the cluster
    fn owner_reference(&self) -> Option<OwnerReference> {
        self.controller_owner_ref(&())
    }

    /// Reference used when publishing events about the cluster
    fn event_reference(&self) -> ObjectReference {
        self.object_ref(&())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn cluster(annotations: BTreeMap<String, String>) -> DbCluster {
        DbCluster {
            metadata: ObjectMeta {
                name: Some("basic".into()),
                namespace: Some("prod".into()),
                uid: Some("uid-1".into()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: DbClusterSpec {
                pd: ComponentSpec {
                    replicas: 3,
                    image: "db/pd:v1".into(),
                    ..Default::default()
                },
                store: None,
                paused: false,
                tls_cluster: false,
                pv_reclaim_policy: PvReclaimPolicy::Retain,
                enable_pv_reclaim: false,
            },
            status: None,
        }
    }

    #[test]
    fn force_upgrade_requires_literal_true() {
        let c = cluster(BTreeMap::from([(
            FORCE_UPGRADE_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        assert!(c.force_upgrade_requested());

        let c = cluster(BTreeMap::from([(
            FORCE_UPGRADE_ANNOTATION.to_string(),
            "yes".to_string(),
        )]));
        assert!(!c.force_upgrade_requested());
    }

    #[test]
    fn delete_slots_are_read_per_component() {
        let c = cluster(BTreeMap::from([(
            "store.tidemark.io/delete-slots".to_string(),
            "[1]".to_string(),
        )]));
        assert_eq!(c.delete_slots_annotation(MemberType::Store), Some("[1]"));
        assert_eq!(c.delete_slots_annotation(MemberType::Pd), None);
    }

    #[test]
    fn owner_reference_points_at_the_cluster() {
        let c = cluster(BTreeMap::new());
        let owner = c.owner_reference().expect("cluster has a uid");
        assert_eq!(owner.kind, "DbCluster");
        assert_eq!(owner.name, "basic");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(c.full_name(), "prod/basic");
    }

    fn owner_name<C: ManagedCluster>(cluster: &C) -> Option<String> {
        cluster.owner_reference().map(|o| o.name)
    }

    #[test]
    fn trait_methods_work_through_generics() {
        let c = cluster(BTreeMap::new());
        assert_eq!(owner_name(&c).as_deref(), Some("basic"));
    }

    #[test]
    fn absent_store_component_is_none() {
        let c = cluster(BTreeMap::new());
        assert!(c.component(MemberType::Store).is_none());
        assert!(c.component(MemberType::Master).is_none());
        assert_eq!(c.cluster_kind(), ClusterKind::Db);
    }
}
