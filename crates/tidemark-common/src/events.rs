//! Kubernetes Event recording for tidemark controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that scaling, drain, failover and resize decisions are visible via
//! `kubectl describe`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ScaleIn")
    /// * `action` - What action was taken (e.g. "Scale")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish kubernetes event");
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// One ordinal was added to a component
    pub const SCALE_OUT: &str = "ScaleOut";
    /// One ordinal was removed from a component
    pub const SCALE_IN: &str = "ScaleIn";
    /// A store deletion was requested before scale-in
    pub const STORE_DELETE_REQUESTED: &str = "StoreDeleteRequested";
    /// Every ordinal is being rolled because of the force-upgrade annotation
    pub const FORCE_UPGRADE: &str = "ForceUpgrade";
    /// A member was marked failed
    pub const MEMBER_FAILED: &str = "MemberFailed";
    /// A failed member was removed and will be replaced
    pub const MEMBER_REPLACED: &str = "MemberReplaced";
    /// All failure markers were cleared
    pub const FAILOVER_RECOVERED: &str = "FailoverRecovered";
    /// A volume claim was expanded
    pub const VOLUME_RESIZED: &str = "VolumeResized";
}

/// Well-known event action strings.
pub mod actions {
    /// Changing the replica count
    pub const SCALE: &str = "Scale";
    /// Rolling a new pod template
    pub const UPGRADE: &str = "Upgrade";
    /// Replacing failed members
    pub const FAILOVER: &str = "Failover";
    /// Expanding storage
    pub const RESIZE: &str = "Resize";
}
