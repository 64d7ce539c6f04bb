//! MigrationCluster Custom Resource Definition
//!
//! The data-migration variant: Raft-replicated `master` members and an
//! optional pool of `worker`s that run migration tasks.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComponentSpec, ComponentStatus, MemberType, PvReclaimPolicy};
use super::ManagedCluster;
use crate::labels::ClusterKind;

/// Specification for a MigrationCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tidemark.io",
    version = "v1alpha1",
    kind = "MigrationCluster",
    plural = "migrationclusters",
    shortname = "mgc",
    status = "MigrationClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Master","type":"string","jsonPath":".status.master.phase"}"#,
    printcolumn = r#"{"name":"Worker","type":"string","jsonPath":".status.worker.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationClusterSpec {
    /// Master members
    pub master: ComponentSpec,

    /// Migration workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<ComponentSpec>,

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

impl MigrationClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.master.validate(MemberType::Master)?;
        if let Some(worker) = &self.worker {
            worker.validate(MemberType::Worker)?;
        }
        Ok(())
    }
}

/// Observed state of a MigrationCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationClusterStatus {
    /// Master status
    #[serde(default)]
    pub master: ComponentStatus,
    /// Worker status
    #[serde(default)]
    pub worker: ComponentStatus,
}

impl MigrationClusterStatus {
    /// Status of a component, if it belongs to this kind
    pub fn component_mut(&mut self, member: MemberType) -> Option<&mut ComponentStatus> {
        match member {
            MemberType::Master => Some(&mut self.master),
            MemberType::Worker => Some(&mut self.worker),
            _ => None,
        }
    }
}

impl ManagedCluster for MigrationCluster {
    fn cluster_kind(&self) -> ClusterKind {
        ClusterKind::Migration
    }

    fn paused(&self) -> bool {
        self.spec.paused
    }

    fn tls_enabled(&self) -> bool {
        self.spec.tls_cluster
    }

    fn component(&self, member: MemberType) -> Option<&ComponentSpec> {
        match member {
            MemberType::Master => Some(&self.spec.master),
            MemberType::Worker => self.spec.worker.as_ref(),
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
