//! Shared types used by both cluster CRDs
//!
//! A cluster is made of components (membership, data-holding and
//! workload-only), each running as one StatefulSet. The spec side of a
//! component is [`ComponentSpec`]; the observed side is [`ComponentStatus`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::kube_utils::parse_quantity;
use crate::Error;

// =============================================================================
// Member types
// =============================================================================

/// A component of a managed cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemberType {
    /// Placement driver: Raft-replicated metadata members of a `DbCluster`
    Pd,
    /// Data-holding stores of a `DbCluster`
    Store,
    /// Raft-replicated masters of a `MigrationCluster`
    Master,
    /// Stateless-ish workers of a `MigrationCluster`
    Worker,
}

/// How a component's membership is observed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipModel {
    /// The component exposes a member list and a leader
    Members,
    /// The component registers stores with the placement driver
    Stores,
    /// No membership API; readiness comes from pods alone
    Workload,
}

impl MemberType {
    /// Name used in object names, labels and the component label value
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberType::Pd => "pd",
            MemberType::Store => "store",
            MemberType::Master => "master",
            MemberType::Worker => "worker",
        }
    }

    /// Parse the component label value back into a member type
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "pd" => Some(MemberType::Pd),
            "store" => Some(MemberType::Store),
            "master" => Some(MemberType::Master),
            "worker" => Some(MemberType::Worker),
            _ => None,
        }
    }

    /// Whether removing a replica requires draining its store first
    pub fn holds_data(&self) -> bool {
        matches!(self, MemberType::Store)
    }

    /// How the status projector learns who is in the cluster
    pub fn membership_model(&self) -> MembershipModel {
        match self {
            MemberType::Pd | MemberType::Master => MembershipModel::Members,
            MemberType::Store => MembershipModel::Stores,
            MemberType::Worker => MembershipModel::Workload,
        }
    }

    /// The component whose API answers membership queries for this one
    ///
    /// Stores register with the placement driver, so their membership is
    /// served by `Pd`. Workers have no membership API.
    pub fn membership_endpoint(&self) -> Option<MemberType> {
        match self {
            MemberType::Pd | MemberType::Store => Some(MemberType::Pd),
            MemberType::Master => Some(MemberType::Master),
            MemberType::Worker => None,
        }
    }

    /// Client-facing port
    pub fn client_port(&self) -> i32 {
        match self {
            MemberType::Pd => 2379,
            MemberType::Store => 20160,
            MemberType::Master => 8261,
            MemberType::Worker => 8262,
        }
    }

    /// Peer port published on the headless service
    pub fn peer_port(&self) -> i32 {
        match self {
            MemberType::Pd => 2380,
            MemberType::Store => 20180,
            MemberType::Master => 8291,
            MemberType::Worker => 8292,
        }
    }
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Spec types
// =============================================================================

/// Reclaim policy applied to persistent volumes bound to cluster claims
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PvReclaimPolicy {
    /// Keep the volume when the claim is deleted
    #[default]
    Retain,
    /// Delete the volume with the claim
    Delete,
}

impl PvReclaimPolicy {
    /// Value as written to `spec.persistentVolumeReclaimPolicy`
    pub fn as_str(&self) -> &'static str {
        match self {
            PvReclaimPolicy::Retain => "Retain",
            PvReclaimPolicy::Delete => "Delete",
        }
    }
}

/// A secondary volume mounted next to the primary data volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageVolume {
    /// Volume name, e.g. "log"
    pub name: String,
    /// Requested capacity, e.g. "2Gi"
    pub storage_size: String,
    /// Storage class; falls back to the component's class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Mount path inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

/// Overrides for the component's client service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOverride {
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Extra annotations merged into the service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Desired state of one component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Desired replica count
    pub replicas: i32,
    /// Container image including tag
    pub image: String,
    /// Requested capacity of the primary data volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
    /// Storage class of the primary data volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Secondary volumes, resized independently of the primary one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_volumes: Vec<StorageVolume>,
    /// Configuration file content rendered into the component's ConfigMap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Client service overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceOverride>,
    /// Upper bound on failure members recorded by auto-failover
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failover_count: Option<i32>,
}

impl ComponentSpec {
    /// Validate replica count, image and storage quantities
    pub fn validate(&self, member: MemberType) -> Result<(), Error> {
        if self.replicas < 0 {
            return Err(Error::validation_for_field(
                crate::UNKNOWN_CONTEXT,
                format!("spec.{member}.replicas"),
                "replicas must not be negative",
            ));
        }
        if self.image.trim().is_empty() {
            return Err(Error::validation_for_field(
                crate::UNKNOWN_CONTEXT,
                format!("spec.{member}.image"),
                "image must be set",
            ));
        }
        if let Some(size) = &self.storage_size {
            parse_quantity(size)?;
        }
        let mut names = BTreeSet::new();
        for volume in &self.storage_volumes {
            parse_quantity(&volume.storage_size)?;
            if !names.insert(volume.name.as_str()) {
                return Err(Error::validation_for_field(
                    crate::UNKNOWN_CONTEXT,
                    format!("spec.{member}.storageVolumes"),
                    format!("duplicate storage volume {}", volume.name),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Status types
// =============================================================================

/// Which reconciliation concern currently dominates a component
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MemberPhase {
    /// Steady state
    #[default]
    Normal,
    /// Replica count is converging
    Scale,
    /// Pod template is rolling out
    Upgrade,
}

impl fmt::Display for MemberPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberPhase::Normal => write!(f, "Normal"),
            MemberPhase::Scale => write!(f, "Scale"),
            MemberPhase::Upgrade => write!(f, "Upgrade"),
        }
    }
}

/// Mirror of the StatefulSet status fields the operator reasons about
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSetMirror {
    /// Pods created by the StatefulSet controller
    #[serde(default)]
    pub replicas: i32,
    /// Pods with a Ready condition
    #[serde(default)]
    pub ready_replicas: i32,
    /// Pods at the current revision
    #[serde(default)]
    pub current_replicas: i32,
    /// Pods at the update revision
    #[serde(default)]
    pub updated_replicas: i32,
    /// Revision pods were created from before the rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    /// Revision the rollout is moving pods to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,
    /// Generation observed by the StatefulSet controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Health of one cluster member as reported by the membership API
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Member name; equals the pod name
    pub name: String,
    /// Member id assigned by the cluster
    pub id: String,
    /// First advertised client URL
    #[serde(default)]
    pub client_url: String,
    /// Whether the member is alive
    pub health: bool,
    /// Last time `health` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// A member that failed health checks and is being replaced
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailureMember {
    /// Pod of the failed member
    pub pod_name: String,
    /// Member id at the time of failure
    pub member_id: String,
    /// Whether the member, its pod and claims have been removed
    #[serde(default)]
    pub member_deleted: bool,
    /// When the failure was recorded
    pub created_at: DateTime<Utc>,
}

/// A pod that exists but never joined the cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnjoinedMember {
    /// Pod name
    pub pod_name: String,
    /// UIDs of the claims mounted by the pod
    #[serde(default)]
    pub pvc_uids: BTreeSet<String>,
    /// First time the pod was seen unjoined
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a store
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum StoreState {
    /// Serving
    #[default]
    Up,
    /// Draining after a deletion request
    Offline,
    /// Unreachable
    Down,
    /// Fully drained; its data has been relocated
    Tombstone,
}

impl StoreState {
    /// Parse the state name reported by the placement driver
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Up" => Some(StoreState::Up),
            "Offline" => Some(StoreState::Offline),
            "Down" | "Disconnected" => Some(StoreState::Down),
            "Tombstone" => Some(StoreState::Tombstone),
            _ => None,
        }
    }
}

/// A store registered with the placement driver
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    /// Store id
    pub id: String,
    /// Pod owning the store, derived from its advertised address
    pub pod_name: String,
    /// Advertised address
    #[serde(default)]
    pub address: String,
    /// Lifecycle state
    pub state: StoreState,
    /// Last time `state` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Observed state of one component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Dominant reconciliation concern
    #[serde(default)]
    pub phase: MemberPhase,
    /// Whether the last projection reached the membership API
    #[serde(default)]
    pub synced: bool,
    /// Mirror of the StatefulSet status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<StatefulSetMirror>,
    /// Members keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, MemberStatus>,
    /// Current leader, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<MemberStatus>,
    /// Failed members keyed by pod name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_members: BTreeMap<String, FailureMember>,
    /// Pods that have not joined, keyed by pod name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unjoined_members: BTreeMap<String, UnjoinedMember>,
    /// Live stores keyed by id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stores: BTreeMap<String, StoreStatus>,
    /// Tombstone stores keyed by id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tombstone_stores: BTreeMap<String, StoreStatus>,
    /// Image of the running container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ComponentStatus {
    /// Replicas added on top of the desired count to replace deleted members
    pub fn failure_replicas(&self) -> i32 {
        self.failure_members
            .values()
            .filter(|m| m.member_deleted)
            .count() as i32
    }

    /// Whether a recorded failure still awaits cleanup
    pub fn auto_failovering(&self) -> bool {
        self.failure_members.values().any(|m| !m.member_deleted)
    }

    /// Replicas last reported by the StatefulSet controller
    pub fn observed_replicas(&self) -> i32 {
        self.stateful_set.as_ref().map_or(0, |s| s.replicas)
    }

    /// Whether the member named `name` is known and healthy
    pub fn member_healthy(&self, name: &str) -> bool {
        self.members.get(name).is_some_and(|m| m.health)
    }
}
