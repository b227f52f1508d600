//! Kubernetes Event recording for the CSV controller.
//!
//! Phase transitions and install failures are surfaced as Events on the
//! ClusterServiceVersion so `kubectl describe csv` shows the history.
//! Publishing is fire-and-forget: a failed event is logged, never returned.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about an object.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`.
    ///
    /// * `reason` - machine-readable reason (see [`reasons`])
    /// * `action` - what the controller was doing (see [`actions`])
    /// * `note` - optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`.
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
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops everything. Used in tests and dry runs.
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

/// Event reasons. These appear under the REASON column of `kubectl get events`.
pub mod reasons {
    /// Requirements are not met; the CSV waits in Pending
    pub const REQUIREMENTS_NOT_MET: &str = "RequirementsNotMet";
    /// All requirements met; install may start
    pub const ALL_REQUIREMENTS_MET: &str = "AllRequirementsMet";
    /// The install executor wrote resources
    pub const INSTALL_APPLIED: &str = "InstallApplied";
    /// Install verified; the CSV is Succeeded
    pub const INSTALL_SUCCEEDED: &str = "InstallSucceeded";
    /// A resource write was rejected
    pub const INSTALL_COMPONENT_FAILED: &str = "InstallComponentFailed";
    /// The install strategy cannot be executed
    pub const INVALID_STRATEGY: &str = "InvalidStrategy";
    /// A successor has taken over; this CSV is being replaced
    pub const BEING_REPLACED: &str = "BeingReplaced";
    /// The replaced CSV is being deleted
    pub const REPLACED: &str = "Replaced";
}

/// Event actions. These appear under the ACTION column of `kubectl get events`.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Writing install resources
    pub const INSTALL: &str = "Install";
    /// Handing off to a successor
    pub const REPLACE: &str = "Replace";
    /// Deleting a replaced CSV
    pub const DELETE: &str = "Delete";
}
