//! Fixtures shared by the unit tests of this crate
//!
//! [`SharedWorld`] is a tiny in-memory API server: [`mock_kube`] wires every
//! `KubeClient` method of a `MockKubeClient` to it and records each write,
//! so tests can run whole passes and assert on the resulting objects.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration, Utc};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod,
    PodCondition, PodSpec, PodStatus, Service, Volume, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;

use tidemark_common::crd::{
    ComponentSpec, ComponentStatus, DbCluster, DbClusterSpec, DbClusterStatus, FailureMember,
    MemberStatus, MigrationCluster, MigrationClusterSpec, MigrationClusterStatus,
    PvReclaimPolicy,
};
use tidemark_common::kube_utils::CONTROLLER_REVISION_HASH_LABEL;
use tidemark_common::Error;

use crate::client::MockKubeClient;
use crate::controller::Context;
use crate::drift::prepare_stateful_set;
use crate::membership::{Member, MembershipClient, MockMembershipClient, MockMembershipClientFactory};
use crate::ordinals;
use crate::target::MemberTarget;
use crate::templates::{DefaultTemplates, MemberTemplates};

/// Namespace every fixture lives in
pub const NAMESPACE: &str = "prod";

/// Revision label stamped on fixture pods and sets
pub const REVISION: &str = "rev-1";

// =============================================================================
// In-memory API server
// =============================================================================

/// Objects known to the fake API server, keyed by name
#[derive(Default)]
pub struct World {
    pub services: BTreeMap<String, Service>,
    pub endpoints: BTreeMap<String, Endpoints>,
    pub config_maps: BTreeMap<String, ConfigMap>,
    pub sets: BTreeMap<String, StatefulSet>,
    pub pods: BTreeMap<String, Pod>,
    pub pvcs: BTreeMap<String, PersistentVolumeClaim>,
    pub pvs: BTreeMap<String, PersistentVolume>,
    pub storage_classes: BTreeMap<String, StorageClass>,
    pub db_statuses: Vec<DbClusterStatus>,
    pub migration_statuses: Vec<MigrationClusterStatus>,
    /// Every write, as `"<verb> <kind> <name>[ <detail>]"`
    pub writes: Vec<String>,
}

impl World {
    fn log(&mut self, entry: String) {
        self.writes.push(entry);
    }
}

/// Handle to a [`World`] shared with mock closures
#[derive(Clone, Default)]
pub struct SharedWorld(Arc<Mutex<World>>);

impl SharedWorld {
    pub fn lock(&self) -> MutexGuard<'_, World> {
        self.0.lock().expect("world mutex should not be poisoned")
    }

    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Whether any write starts with `prefix`
    pub fn wrote(&self, prefix: &str) -> bool {
        self.lock().writes.iter().any(|w| w.starts_with(prefix))
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn set(&self, name: &str) -> StatefulSet {
        self.lock()
            .sets
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("statefulset {name} should exist"))
    }

    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.lock().pvcs.get(name).cloned()
    }
}

fn selected(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|pair| !pair.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|have| have == v),
            None => false,
        })
}

/// A `MockKubeClient` backed by `world`
pub fn mock_kube(world: &SharedWorld) -> MockKubeClient {
    let mut mock = MockKubeClient::new();

    let w = world.clone();
    mock.expect_get_service()
        .returning(move |_, name| Ok(w.lock().services.get(name).cloned()));
    let w = world.clone();
    mock.expect_create_service().returning(move |_, svc| {
        let mut world = w.lock();
        world.log(format!("create service {}", svc.name_any()));
        world.services.insert(svc.name_any(), svc.clone());
        Ok(())
    });
    let w = world.clone();
    mock.expect_update_service().returning(move |_, svc| {
        let mut world = w.lock();
        world.log(format!("update service {}", svc.name_any()));
        world.services.insert(svc.name_any(), svc.clone());
        Ok(())
    });

    let w = world.clone();
    mock.expect_get_endpoints()
        .returning(move |_, name| Ok(w.lock().endpoints.get(name).cloned()));

    let w = world.clone();
    mock.expect_get_config_map()
        .returning(move |_, name| Ok(w.lock().config_maps.get(name).cloned()));
    let w = world.clone();
    mock.expect_create_config_map().returning(move |_, cm| {
        let mut world = w.lock();
        world.log(format!("create configmap {}", cm.name_any()));
        world.config_maps.insert(cm.name_any(), cm.clone());
        Ok(())
    });
    let w = world.clone();
    mock.expect_update_config_map().returning(move |_, cm| {
        let mut world = w.lock();
        world.log(format!("update configmap {}", cm.name_any()));
        world.config_maps.insert(cm.name_any(), cm.clone());
        Ok(())
    });

    let w = world.clone();
    mock.expect_get_stateful_set()
        .returning(move |_, name| Ok(w.lock().sets.get(name).cloned()));
    let w = world.clone();
    mock.expect_create_stateful_set().returning(move |_, set| {
        let mut world = w.lock();
        world.log(format!("create statefulset {}", set.name_any()));
        world.sets.insert(set.name_any(), set.clone());
        Ok(())
    });
    let w = world.clone();
    mock.expect_update_stateful_set().returning(move |_, set| {
        let mut world = w.lock();
        world.log(format!("update statefulset {}", set.name_any()));
        // Replace leaves the status subresource alone.
        let mut updated = set.clone();
        updated.status = world.sets.get(&set.name_any()).and_then(|s| s.status.clone());
        world.sets.insert(set.name_any(), updated);
        Ok(())
    });

    let w = world.clone();
    mock.expect_get_pod()
        .returning(move |_, name| Ok(w.lock().pods.get(name).cloned()));
    let w = world.clone();
    mock.expect_list_pods().returning(move |_, selector| {
        Ok(w.lock()
            .pods
            .values()
            .filter(|p| selected(p.labels(), selector))
            .cloned()
            .collect())
    });
    let w = world.clone();
    mock.expect_delete_pod().returning(move |_, name| {
        let mut world = w.lock();
        world.log(format!("delete pod {name}"));
        world.pods.remove(name);
        Ok(())
    });
    let w = world.clone();
    mock.expect_label_pod().returning(move |_, name, key, value| {
        let mut world = w.lock();
        world.log(format!("label pod {name} {key}={value}"));
        let pod = world
            .pods
            .get_mut(name)
            .ok_or_else(|| Error::not_found("Pod", name))?;
        pod.labels_mut().insert(key.to_string(), value.to_string());
        Ok(())
    });

    let w = world.clone();
    mock.expect_get_pvc()
        .returning(move |_, name| Ok(w.lock().pvcs.get(name).cloned()));
    let w = world.clone();
    mock.expect_list_pvcs().returning(move |_, selector| {
        Ok(w.lock()
            .pvcs
            .values()
            .filter(|p| selected(p.labels(), selector))
            .cloned()
            .collect())
    });
    let w = world.clone();
    mock.expect_annotate_pvc().returning(move |_, name, key, value| {
        let mut world = w.lock();
        world.log(format!("annotate pvc {name} {key}"));
        let pvc = world
            .pvcs
            .get_mut(name)
            .ok_or_else(|| Error::not_found("PersistentVolumeClaim", name))?;
        pvc.annotations_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    });
    let w = world.clone();
    mock.expect_delete_pvc().returning(move |_, name| {
        let mut world = w.lock();
        world.log(format!("delete pvc {name}"));
        world.pvcs.remove(name);
        Ok(())
    });
    let w = world.clone();
    mock.expect_resize_pvc().returning(move |_, name, storage| {
        let mut world = w.lock();
        world.log(format!("resize pvc {name} {storage}"));
        if let Some(pvc) = world.pvcs.get_mut(name) {
            pvc.spec
                .get_or_insert_with(Default::default)
                .resources
                .get_or_insert_with(Default::default)
                .requests
                .get_or_insert_with(Default::default)
                .insert("storage".to_string(), Quantity(storage.to_string()));
        }
        Ok(())
    });

    let w = world.clone();
    mock.expect_get_pv()
        .returning(move |name| Ok(w.lock().pvs.get(name).cloned()));
    let w = world.clone();
    mock.expect_set_pv_reclaim_policy()
        .returning(move |name, policy| {
            let mut world = w.lock();
            world.log(format!("reclaim pv {name} {policy}"));
            if let Some(pv) = world.pvs.get_mut(name) {
                pv.spec
                    .get_or_insert_with(Default::default)
                    .persistent_volume_reclaim_policy = Some(policy.to_string());
            }
            Ok(())
        });

    let w = world.clone();
    mock.expect_get_storage_class()
        .returning(move |name| Ok(w.lock().storage_classes.get(name).cloned()));

    let w = world.clone();
    mock.expect_patch_db_cluster_status()
        .returning(move |_, name, status| {
            let mut world = w.lock();
            world.log(format!("patch status {name}"));
            world.db_statuses.push(status.clone());
            Ok(())
        });
    let w = world.clone();
    mock.expect_patch_migration_cluster_status()
        .returning(move |_, name, status| {
            let mut world = w.lock();
            world.log(format!("patch status {name}"));
            world.migration_statuses.push(status.clone());
            Ok(())
        });

    mock
}

// =============================================================================
// Membership
// =============================================================================

/// A member named after its pod
pub fn member(name: &str, alive: bool) -> Member {
    Member {
        id: format!("id-{name}"),
        name: name.to_string(),
        client_urls: vec![format!("http://{name}:2379")],
        alive,
    }
}

/// A membership client reporting `members`, the first one being leader
pub fn members_client(members: Vec<Member>) -> MockMembershipClient {
    let mut client = MockMembershipClient::new();
    let leader = members.first().cloned().unwrap_or_default();
    client
        .expect_get_members()
        .returning(move || Ok(members.clone()));
    client
        .expect_get_leader()
        .returning(move || Ok(leader.clone()));
    client
}

/// A factory handing out `client` for every component
pub fn membership_factory(client: MockMembershipClient) -> Arc<MockMembershipClientFactory> {
    let client: Arc<dyn MembershipClient> = Arc::new(client);
    let mut factory = MockMembershipClientFactory::new();
    factory
        .expect_client()
        .returning(move |_, _, _, _| client.clone());
    Arc::new(factory)
}

/// A context over `world` and `membership`
pub fn context(world: &SharedWorld, membership: MockMembershipClient) -> Context {
    Context::for_testing(Arc::new(mock_kube(world)), membership_factory(membership))
}

// =============================================================================
// Clusters
// =============================================================================

fn cluster_meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(format!("uid-{name}")),
        ..Default::default()
    }
}

fn component(image: &str, replicas: i32) -> ComponentSpec {
    ComponentSpec {
        replicas,
        image: image.to_string(),
        storage_size: Some("1Gi".to_string()),
        storage_class_name: Some("standard".to_string()),
        ..Default::default()
    }
}

/// A DbCluster with `pd_replicas` placement drivers and optional stores
pub fn db_cluster(name: &str, pd_replicas: i32, store_replicas: Option<i32>) -> DbCluster {
    DbCluster {
        metadata: cluster_meta(name),
        spec: DbClusterSpec {
            pd: component("db/pd:v1", pd_replicas),
            store: store_replicas.map(|r| component("db/store:v1", r)),
            paused: false,
            tls_cluster: false,
            pv_reclaim_policy: PvReclaimPolicy::Retain,
            enable_pv_reclaim: false,
        },
        status: None,
    }
}

/// A MigrationCluster with `master_replicas` masters and one worker
pub fn migration_cluster(name: &str, master_replicas: i32) -> MigrationCluster {
    MigrationCluster {
        metadata: cluster_meta(name),
        spec: MigrationClusterSpec {
            master: component("dm/master:v1", master_replicas),
            worker: Some(component("dm/worker:v1", 1)),
            paused: false,
            tls_cluster: false,
            pv_reclaim_policy: PvReclaimPolicy::Retain,
            enable_pv_reclaim: false,
        },
        status: None,
    }
}

pub fn failure_member(pod: &str, deleted: bool) -> FailureMember {
    FailureMember {
        pod_name: pod.to_string(),
        member_id: format!("id-{pod}"),
        member_deleted: deleted,
        created_at: Utc::now(),
    }
}

/// A synced status where every ordinal below `replicas` is a healthy member
pub fn healthy_status(target: &MemberTarget<'_>, replicas: i32) -> ComponentStatus {
    let since = Some(Utc::now() - Duration::hours(1));
    let members = (0..replicas)
        .map(|o| {
            let name = target.pod_name(o);
            let status = MemberStatus {
                name: name.clone(),
                id: format!("id-{name}"),
                client_url: format!("http://{name}:2379"),
                health: true,
                last_transition_time: since,
            };
            (name, status)
        })
        .collect();
    ComponentStatus {
        synced: true,
        members,
        ..Default::default()
    }
}

// =============================================================================
// Workload objects
// =============================================================================

/// A pod of `target` at `ordinal`, mounting its claims, created an hour ago
pub fn pod(target: &MemberTarget<'_>, ordinal: i32, ready: bool) -> Pod {
    let name = target.pod_name(ordinal);
    let mut labels = target.labels().into_map();
    labels.insert(CONTROLLER_REVISION_HASH_LABEL.to_string(), REVISION.to_string());
    let volumes = target
        .claim_volume_names()
        .into_iter()
        .map(|volume| Volume {
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: target.pvc_name(&volume, ordinal),
                ..Default::default()
            }),
            name: volume,
            ..Default::default()
        })
        .collect();
    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(target.namespace.clone()),
            uid: Some(format!("uid-{name}")),
            labels: Some(labels),
            creation_timestamp: Some(Time(Utc::now() - Duration::hours(1))),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(volumes),
            ..Default::default()
        }),
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// A bound claim of `target` created from template `volume`
pub fn pvc(target: &MemberTarget<'_>, volume: &str, ordinal: i32, size: &str) -> PersistentVolumeClaim {
    let name = target.pvc_name(volume, ordinal);
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(target.namespace.clone()),
            uid: Some(format!("uid-{name}")),
            labels: Some(target.labels().into_map()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some("standard".to_string()),
            volume_name: Some(format!("pv-{name}")),
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

pub fn pv(name: &str, policy: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some(policy.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn storage_class(name: &str, expandable: bool) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: "csi.example.com".to_string(),
        allow_volume_expansion: Some(expandable),
        ..Default::default()
    }
}

/// The set the templates produce for `target`, as if created and fully rolled out
pub fn running_set(target: &MemberTarget<'_>, status: &ComponentStatus) -> StatefulSet {
    let config_map = DefaultTemplates.config_map(target).name_any();
    let desired = DefaultTemplates
        .stateful_set(target, status, &config_map)
        .expect("templates should build");
    let mut set = prepare_stateful_set(desired).expect("last-applied should record");
    let replicas = ordinals::replicas(&set);
    set.metadata.generation = Some(1);
    set.status = Some(StatefulSetStatus {
        replicas,
        ready_replicas: Some(replicas),
        current_replicas: Some(replicas),
        updated_replicas: Some(replicas),
        current_revision: Some(REVISION.to_string()),
        update_revision: Some(REVISION.to_string()),
        observed_generation: Some(1),
        ..Default::default()
    });
    set
}

/// Seed `world` with a running component: set, ready pods and their claims
pub fn seed_component(world: &SharedWorld, target: &MemberTarget<'_>, status: &ComponentStatus) {
    let set = running_set(target, status);
    let live = ordinals::pod_ordinals(ordinals::replicas(&set), &set);
    let mut w = world.lock();
    for ordinal in live {
        let p = pod(target, ordinal, true);
        w.pods.insert(p.name_any(), p);
        for volume in target.claim_volume_names() {
            let claim = pvc(target, &volume, ordinal, "1Gi");
            w.pvcs.insert(claim.name_any(), claim);
        }
    }
    w.sets.insert(set.name_any(), set);
}
