//! Online expansion of persistent volume claims
//!
//! Claims created from a StatefulSet's volume claim templates never follow
//! later template changes. The resizer patches each claim's storage request
//! up to the size in the cluster spec when its storage class allows volume
//! expansion. Claims are never shrunk.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use tidemark_common::crd::{DbCluster, ManagedCluster, MigrationCluster};
use tidemark_common::events::{actions, reasons};
use tidemark_common::kube_utils::parse_quantity;
use tidemark_common::Error;

use crate::controller::Context;
use crate::target::MemberTarget;

/// One claim template of a component and the size it should have
#[derive(Clone, Debug, PartialEq, Eq)]
struct VolumeRequest {
    volume: String,
    size: String,
    storage_class: Option<String>,
}

fn volume_requests(target: &MemberTarget<'_>) -> Vec<VolumeRequest> {
    let spec = target.spec;
    let primary = spec.storage_size.as_ref().map(|size| VolumeRequest {
        volume: target.data_volume_name(),
        size: size.clone(),
        storage_class: spec.storage_class_name.clone(),
    });
    let secondary = spec.storage_volumes.iter().map(|v| VolumeRequest {
        volume: target.secondary_volume_name(&v.name),
        size: v.storage_size.clone(),
        storage_class: v
            .storage_class_name
            .clone()
            .or_else(|| spec.storage_class_name.clone()),
    });
    primary.into_iter().chain(secondary).collect()
}

fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.as_str())
}

/// Expand the claims of every DbCluster component
pub async fn resize_db_cluster(ctx: &Context, cluster: &DbCluster) -> Result<(), Error> {
    resize_cluster(ctx, cluster).await
}

/// Expand the claims of every MigrationCluster component
pub async fn resize_migration_cluster(
    ctx: &Context,
    cluster: &MigrationCluster,
) -> Result<(), Error> {
    resize_cluster(ctx, cluster).await
}

async fn resize_cluster<C: ManagedCluster>(ctx: &Context, cluster: &C) -> Result<(), Error> {
    let mut classes = BTreeMap::new();
    let mut errors = Vec::new();
    for &member in cluster.cluster_kind().components() {
        let Some(target) = MemberTarget::new(cluster, member) else {
            continue;
        };
        let requests = volume_requests(&target);
        if requests.is_empty() {
            continue;
        }
        let claims = ctx
            .kube
            .list_pvcs(&target.namespace, &target.selector())
            .await?;
        for request in &requests {
            let prefix = format!("{}-{}-", request.volume, target.set_name());
            for pvc in claims.iter().filter(|c| c.name_any().starts_with(&prefix)) {
                if let Err(e) = resize_claim(ctx, &target, request, pvc, &mut classes).await {
                    match e {
                        Error::NotFound { .. } => {
                            warn!(pvc = %pvc.name_any(), error = %e, "cannot resize claim");
                            errors.push(e);
                        }
                        fatal => return Err(fatal),
                    }
                }
            }
        }
    }
    match errors.into_iter().next() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Whether a storage class allows expansion; `None` when it does not exist
async fn expandable(
    ctx: &Context,
    name: &str,
    classes: &mut BTreeMap<String, Option<bool>>,
) -> Result<Option<bool>, Error> {
    if let Some(known) = classes.get(name) {
        return Ok(*known);
    }
    let found = ctx
        .kube
        .get_storage_class(name)
        .await?
        .map(|sc| sc.allow_volume_expansion.unwrap_or(false));
    classes.insert(name.to_string(), found);
    Ok(found)
}

async fn resize_claim(
    ctx: &Context,
    target: &MemberTarget<'_>,
    request: &VolumeRequest,
    pvc: &PersistentVolumeClaim,
    classes: &mut BTreeMap<String, Option<bool>>,
) -> Result<(), Error> {
    let name = pvc.name_any();
    let Some(current) = requested_storage(pvc) else {
        debug!(pvc = %name, "claim has no storage request, skipping");
        return Ok(());
    };
    if parse_quantity(&request.size)? <= parse_quantity(current)? {
        return Ok(());
    }

    let class = pvc
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.clone())
        .or_else(|| request.storage_class.clone());
    let Some(class) = class else {
        debug!(pvc = %name, "claim has no storage class, skipping");
        return Ok(());
    };
    match expandable(ctx, &class, classes).await? {
        None => return Err(Error::not_found("StorageClass", class)),
        Some(false) => {
            debug!(pvc = %name, storage_class = %class, "storage class does not allow expansion");
            return Ok(());
        }
        Some(true) => {}
    }

    ctx.kube
        .resize_pvc(&target.namespace, &name, &request.size)
        .await?;
    info!(cluster = %target.full_name(), pvc = %name, from = %current, to = %request.size,
        "resized claim");
    ctx.events
        .publish(
            &target.event_ref,
            EventType::Normal,
            reasons::VOLUME_RESIZED,
            actions::RESIZE,
            Some(format!("{name} resized from {current} to {}", request.size)),
        )
        .await;
    Ok(())
}
