//! Desired-object builders
//!
//! [`MemberTemplates`] produces the Services, ConfigMap and StatefulSet a
//! component should have. The pipeline treats the output as already correct
//! and only decides whether and how to apply it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use tidemark_common::crd::ComponentStatus;
use tidemark_common::kube_utils::deterministic_hash;
use tidemark_common::Error;

use crate::ordinals::{set_delete_slots, set_partition};
use crate::target::MemberTarget;

/// Capacity of the primary data volume when the spec leaves it unset
pub const DEFAULT_STORAGE_SIZE: &str = "10Gi";

/// Key of the configuration file inside the ConfigMap
pub const CONFIG_FILE_KEY: &str = "config-file";

/// Builds the desired objects of a component
pub trait MemberTemplates: Send + Sync {
    /// The client-facing Service
    fn client_service(&self, target: &MemberTarget<'_>) -> Service;

    /// The headless peer-discovery Service
    fn peer_service(&self, target: &MemberTarget<'_>) -> Service;

    /// The configuration artifact; its name embeds a digest of its content
    fn config_map(&self, target: &MemberTarget<'_>) -> ConfigMap;

    /// The StatefulSet referencing `config_map_name`
    fn stateful_set(
        &self,
        target: &MemberTarget<'_>,
        status: &ComponentStatus,
        config_map_name: &str,
    ) -> Result<StatefulSet, Error>;
}

/// Default templates used by the operator
#[derive(Clone, Debug, Default)]
pub struct DefaultTemplates;

impl DefaultTemplates {
    fn meta(target: &MemberTarget<'_>, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(target.namespace.clone()),
            labels: Some(target.labels().into_map()),
            owner_references: target.owner.clone().map(|o| vec![o]),
            ..Default::default()
        }
    }

    fn claim(target: &MemberTarget<'_>, name: String, size: &str, class: Option<&String>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(target.labels().into_map()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: class.cloned(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(size.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl MemberTemplates for DefaultTemplates {
    fn client_service(&self, target: &MemberTarget<'_>) -> Service {
        let overrides = target.spec.service.clone().unwrap_or_default();
        let mut metadata = Self::meta(target, target.set_name());
        if !overrides.annotations.is_empty() {
            metadata.annotations = Some(overrides.annotations);
        }
        Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some(overrides.type_.unwrap_or_else(|| "ClusterIP".to_string())),
                selector: Some(target.labels().into_map()),
                ports: Some(vec![ServicePort {
                    name: Some("client".to_string()),
                    port: target.member.client_port(),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn peer_service(&self, target: &MemberTarget<'_>) -> Service {
        Service {
            metadata: Self::meta(target, target.peer_service_name()),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(target.labels().into_map()),
                publish_not_ready_addresses: Some(true),
                ports: Some(vec![ServicePort {
                    name: Some("peer".to_string()),
                    port: target.member.peer_port(),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config_map(&self, target: &MemberTarget<'_>) -> ConfigMap {
        let content = target.spec.config.clone().unwrap_or_default();
        let digest = deterministic_hash(&content);
        let name = format!("{}-{}", target.set_name(), &digest[..8]);
        ConfigMap {
            metadata: Self::meta(target, name),
            data: Some(BTreeMap::from([(CONFIG_FILE_KEY.to_string(), content)])),
            ..Default::default()
        }
    }

    fn stateful_set(
        &self,
        target: &MemberTarget<'_>,
        status: &ComponentStatus,
        config_map_name: &str,
    ) -> Result<StatefulSet, Error> {
        let spec = target.spec;
        let member = target.member;
        let data_volume = target.data_volume_name();

        let mut mounts = vec![
            VolumeMount {
                name: data_volume.clone(),
                mount_path: format!("/var/lib/{member}"),
                ..Default::default()
            },
            VolumeMount {
                name: "config".to_string(),
                mount_path: format!("/etc/{member}"),
                read_only: Some(true),
                ..Default::default()
            },
        ];
        let mut claims = vec![Self::claim(
            target,
            data_volume,
            spec.storage_size.as_deref().unwrap_or(DEFAULT_STORAGE_SIZE),
            spec.storage_class_name.as_ref(),
        )];
        for volume in &spec.storage_volumes {
            let name = target.secondary_volume_name(&volume.name);
            mounts.push(VolumeMount {
                name: name.clone(),
                mount_path: volume
                    .mount_path
                    .clone()
                    .unwrap_or_else(|| format!("/var/lib/{name}")),
                ..Default::default()
            });
            claims.push(Self::claim(
                target,
                name,
                &volume.storage_size,
                volume
                    .storage_class_name
                    .as_ref()
                    .or(spec.storage_class_name.as_ref()),
            ));
        }

        let container = Container {
            name: member.as_str().to_string(),
            image: Some(spec.image.clone()),
            ports: Some(vec![
                ContainerPort {
                    name: Some("client".to_string()),
                    container_port: member.client_port(),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("peer".to_string()),
                    container_port: member.peer_port(),
                    ..Default::default()
                },
            ]),
            env: Some(vec![
                EnvVar {
                    name: "POD_NAME".to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.name".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                EnvVar {
                    name: "PEER_SERVICE_NAME".to_string(),
                    value: Some(target.peer_service_name()),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(mounts),
            ..Default::default()
        };

        let replicas = target.desired_replicas(status.failure_replicas());
        let mut set = StatefulSet {
            metadata: Self::meta(target, target.set_name()),
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(target.labels().into_map()),
                    ..Default::default()
                },
                service_name: Some(target.peer_service_name()),
                pod_management_policy: Some("Parallel".to_string()),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(target.labels().into_map()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![Volume {
                            name: "config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: config_map_name.to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(claims),
                ..Default::default()
            }),
            ..Default::default()
        };
        set_delete_slots(&mut set, &target.delete_slots);
        set_partition(&mut set, replicas + target.delete_slots.len() as i32);
        Ok(set)
    }
}
