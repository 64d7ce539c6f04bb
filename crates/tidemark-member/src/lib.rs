//! Member reconciliation for tidemark clusters
//!
//! Every component of a cluster (placement drivers, stores, migration
//! masters and workers) is a StatefulSet plus services and a ConfigMap. This
//! crate converges those objects one pass at a time: project the observed
//! status, then run force-upgrade, scaling, failover and rolling upgrade in
//! a fixed order, and finally apply the result. Volume expansion and
//! reclaim-policy handling run alongside at the cluster level.

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod drift;
pub mod failover;
pub mod membership;
pub mod ordinals;
pub mod pipeline;
pub mod reclaim;
pub mod resizer;
pub mod scaler;
pub mod status;
pub mod target;
pub mod templates;
pub mod upgrader;

#[cfg(test)]
mod testing;

pub use client::{KubeClient, KubeClientImpl};
pub use config::MemberConfig;
pub use controller::{error_policy, reconcile_db, reconcile_migration, Context, ContextBuilder};
pub use membership::{HttpMembershipClientFactory, MembershipClient, MembershipClientFactory};
pub use target::MemberTarget;
pub use upgrader::{PartitionUpgrader, Upgrader};
