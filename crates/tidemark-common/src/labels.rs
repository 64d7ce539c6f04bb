//! Labels, selectors and cluster kinds
//!
//! Every object the operator creates carries the four recommended
//! `app.kubernetes.io` labels; selectors over them are how claims, pods and
//! volumes are found again.

use std::collections::BTreeMap;

use crate::crd::MemberType;

/// `app.kubernetes.io/name`
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
/// `app.kubernetes.io/managed-by`
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// `app.kubernetes.io/instance`
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// `app.kubernetes.io/component`
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// Value of the managed-by label
pub const MANAGED_BY: &str = "tidemark-operator";

/// The closed set of cluster kinds the operator manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterKind {
    /// `DbCluster`
    Db,
    /// `MigrationCluster`
    Migration,
}

impl ClusterKind {
    /// Value of the name label for objects of this kind
    pub fn name_label(&self) -> &'static str {
        match self {
            ClusterKind::Db => "db-cluster",
            ClusterKind::Migration => "migration-cluster",
        }
    }

    /// Components a cluster of this kind may run
    pub fn components(&self) -> &'static [MemberType] {
        match self {
            ClusterKind::Db => &[MemberType::Pd, MemberType::Store],
            ClusterKind::Migration => &[MemberType::Master, MemberType::Worker],
        }
    }

    /// Whether `member` belongs to this kind
    pub fn owns_component(&self, member: MemberType) -> bool {
        self.components().contains(&member)
    }

    /// Selector over everything belonging to one cluster instance
    pub fn instance_selector(&self, instance: &str) -> Labels {
        Labels::new(*self).instance(instance)
    }
}

/// Label set builder
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Name and managed-by labels for a kind
    pub fn new(kind: ClusterKind) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(NAME_LABEL.to_string(), kind.name_label().to_string());
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
        Self(labels)
    }

    /// Add the instance label
    pub fn instance(mut self, name: &str) -> Self {
        self.0.insert(INSTANCE_LABEL.to_string(), name.to_string());
        self
    }

    /// Add the component label
    pub fn component(mut self, member: MemberType) -> Self {
        self.0
            .insert(COMPONENT_LABEL.to_string(), member.as_str().to_string());
        self
    }

    /// Labels of one component of one cluster
    pub fn for_component(kind: ClusterKind, instance: &str, member: MemberType) -> Self {
        Self::new(kind).instance(instance).component(member)
    }

    /// Equality-based selector string, e.g. `a=b,c=d`
    pub fn selector(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether every label in this set is present with the same value
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// The labels as a map
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    /// Borrow the labels
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}
