//! DbCluster Custom Resource Definition
//!
//! A DbCluster is a distributed database made of placement-driver members
//! (`pd`) and optional data-holding stores (`store`).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComponentSpec, ComponentStatus, MemberType, PvReclaimPolicy};
use super::ManagedCluster;
use crate::labels::ClusterKind;

/// Specification for a DbCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tidemark.io",
    version = "v1alpha1",
    kind = "DbCluster",
    plural = "dbclusters",
    shortname = "dbc",
    status = "DbClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"PD","type":"string","jsonPath":".status.pd.phase"}"#,
    printcolumn = r#"{"name":"Store","type":"string","jsonPath":".status.store.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DbClusterSpec {
    /// Placement driver members
    pub pd: ComponentSpec,

    /// Data-holding stores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<ComponentSpec>,

    /// Stop all mutation after services and status
    #[serde(default)]
    pub paused: bool,

    /// Serve the membership API over TLS
    #[serde(default)]
    pub tls_cluster: bool,

    /// Reclaim policy for bound persistent volumes
    #[serde(default)]
    pub pv_reclaim_policy: PvReclaimPolicy,

    /// Reclaim claims marked for deferred deletion after scale-in
    #[serde(default)]
    pub enable_pv_reclaim: bool,
}

impl DbClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.pd.validate(MemberType::Pd)?;
        if let Some(store) = &self.store {
            store.validate(MemberType::Store)?;
        }
        Ok(())
    }
}

/// Observed state of a DbCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbClusterStatus {
    /// Placement driver status
    #[serde(default)]
    pub pd: ComponentStatus,
    /// Store status
    #[serde(default)]
    pub store: ComponentStatus,
}

impl DbClusterStatus {
    /// Status of a component, if it belongs to this kind
    pub fn component_mut(&mut self, member: MemberType) -> Option<&mut ComponentStatus> {
        match member {
            MemberType::Pd => Some(&mut self.pd),
            MemberType::Store => Some(&mut self.store),
            _ => None,
        }
    }
}

impl ManagedCluster for DbCluster {
    fn cluster_kind(&self) -> ClusterKind {
        ClusterKind::Db
    }

    fn paused(&self) -> bool {
        self.spec.paused
    }

    fn tls_enabled(&self) -> bool {
        self.spec.tls_cluster
    }

    fn component(&self, member: MemberType) -> Option<&ComponentSpec> {
        match member {
            MemberType::Pd => Some(&self.spec.pd),
            MemberType::Store => self.spec.store.as_ref(),
            _ => None,
        }
    }

    fn pv_reclaim_policy(&self) -> PvReclaimPolicy {
        self.spec.pv_reclaim_policy
    }

    fn pv_reclaim_enabled(&self) -> bool {
        self.spec.enable_pv_reclaim
    }
}
