//! Kubernetes client abstraction for member reconciliation
//!
//! Every platform read and write the core issues goes through [`KubeClient`],
//! so tests can drive the pipeline against mocks.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use tidemark_common::crd::{DbCluster, DbClusterStatus, MigrationCluster, MigrationClusterStatus};
use tidemark_common::kube_utils::{patch_resource_status, FIELD_MANAGER};
use tidemark_common::Error;

/// Trait abstracting Kubernetes client operations for member reconciliation
///
/// Getters return `Ok(None)` for objects that do not exist so callers can
/// branch on absence without inspecting error codes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Replace a Service
    async fn update_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Get the Endpoints backing a Service
    async fn get_endpoints(&self, namespace: &str, name: &str)
        -> Result<Option<Endpoints>, Error>;

    /// Get a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<(), Error>;

    /// Replace a ConfigMap
    async fn update_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<(), Error>;

    /// Get a StatefulSet
    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error>;

    /// Create a StatefulSet
    async fn create_stateful_set(&self, namespace: &str, set: &StatefulSet) -> Result<(), Error>;

    /// Replace a StatefulSet
    async fn update_stateful_set(&self, namespace: &str, set: &StatefulSet) -> Result<(), Error>;

    /// Get a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// List Pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Delete a Pod; absent pods are not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Set one label on a Pod
    async fn label_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Get a PersistentVolumeClaim
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// List PersistentVolumeClaims matching a label selector
    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error>;

    /// Set one annotation on a PersistentVolumeClaim
    async fn annotate_pvc(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Delete a PersistentVolumeClaim; absent claims are not an error
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Raise the storage request of a PersistentVolumeClaim
    async fn resize_pvc(&self, namespace: &str, name: &str, storage: &str) -> Result<(), Error>;

    /// Get a PersistentVolume
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>, Error>;

    /// Set the reclaim policy of a PersistentVolume
    async fn set_pv_reclaim_policy(&self, name: &str, policy: &str) -> Result<(), Error>;

    /// Get a StorageClass
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error>;

    /// Patch the status of a DbCluster
    async fn patch_db_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DbClusterStatus,
    ) -> Result<(), Error>;

    /// Patch the status of a MigrationCluster
    async fn patch_migration_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MigrationClusterStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ns<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn ignore_not_found<T: Default>(result: Result<T, kube::Error>) -> Result<T, Error> {
    match result.map_err(Error::from) {
        Err(e) if e.is_kube_not_found() => Ok(T::default()),
        other => other,
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.ns::<Service>(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        self.ns::<Service>(namespace)
            .create(&PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn update_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        self.ns::<Service>(namespace)
            .replace(&service.name_any(), &PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, Error> {
        Ok(self.ns::<Endpoints>(namespace).get_opt(name).await?)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self.ns::<ConfigMap>(namespace).get_opt(name).await?)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        self.ns::<ConfigMap>(namespace)
            .create(&PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn update_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        self.ns::<ConfigMap>(namespace)
            .replace(&config_map.name_any(), &PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error> {
        Ok(self.ns::<StatefulSet>(namespace).get_opt(name).await?)
    }

    async fn create_stateful_set(&self, namespace: &str, set: &StatefulSet) -> Result<(), Error> {
        self.ns::<StatefulSet>(namespace)
            .create(&PostParams::default(), set)
            .await?;
        Ok(())
    }

    async fn update_stateful_set(&self, namespace: &str, set: &StatefulSet) -> Result<(), Error> {
        self.ns::<StatefulSet>(namespace)
            .replace(&set.name_any(), &PostParams::default(), set)
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.ns::<Pod>(namespace).get_opt(name).await?)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let pods = self
            .ns::<Pod>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        debug!(namespace, pod = name, "deleting pod");
        let result = self
            .ns::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn label_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "metadata": { "labels": { key: value } } });
        self.ns::<Pod>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        Ok(self
            .ns::<PersistentVolumeClaim>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error> {
        let pvcs = self
            .ns::<PersistentVolumeClaim>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(pvcs.items)
    }

    async fn annotate_pvc(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "metadata": { "annotations": { key: value } } });
        self.ns::<PersistentVolumeClaim>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error> {
        debug!(namespace, pvc = name, "deleting persistent volume claim");
        let result = self
            .ns::<PersistentVolumeClaim>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn resize_pvc(&self, namespace: &str, name: &str, storage: &str) -> Result<(), Error> {
        let patch = serde_json::json!({
            "spec": { "resources": { "requests": { "storage": storage } } }
        });
        self.ns::<PersistentVolumeClaim>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>, Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn set_pv_reclaim_policy(&self, name: &str, policy: &str) -> Result<(), Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "persistentVolumeReclaimPolicy": policy } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn patch_db_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DbClusterStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<DbCluster>(&self.client, name, namespace, status).await
    }

    async fn patch_migration_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MigrationClusterStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<MigrationCluster>(&self.client, name, namespace, status).await
    }
}
