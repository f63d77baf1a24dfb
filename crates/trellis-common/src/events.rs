//! Kubernetes Event recording for Trellis controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that the broker and trigger controllers can emit standard Kubernetes
//! Events visible via `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "TriggerReconciled")
    /// * `action` - What action was taken (e.g. "Reconcile")
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
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "trellis-broker-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
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
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// An event captured by [`RecordingEventPublisher`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Name of the object the event was published on
    pub object: Option<String>,
    /// Normal or Warning
    pub warning: bool,
    /// Reason string
    pub reason: String,
    /// Note, if any
    pub note: Option<String>,
}

/// In-memory implementation that keeps every event in publish order.
///
/// Used by controller tests to assert on event ordering and content.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Reasons of all events published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: resource_ref.name.clone(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Broker lifecycle events
    /// Broker status converged
    pub const BROKER_RECONCILED: &str = "BrokerReconciled";
    /// Broker finalizers were added or removed
    pub const FINALIZER_UPDATE: &str = "FinalizerUpdate";
    /// Broker spec could not be turned into a trigger channel
    pub const INTERNAL_ERROR: &str = "InternalError";
    /// Writing the broker status failed
    pub const UPDATE_FAILED: &str = "UpdateFailed";

    // Trigger lifecycle events
    /// Trigger status converged
    pub const TRIGGER_RECONCILED: &str = "TriggerReconciled";
    /// Trigger reconciliation returned an error
    pub const TRIGGER_RECONCILE_FAILED: &str = "TriggerReconcileFailed";
    /// Writing the trigger status failed
    pub const TRIGGER_UPDATE_STATUS_FAILED: &str = "TriggerUpdateStatusFailed";

    // Subscription events
    /// A subscription under a deprecated name was removed
    pub const SUBSCRIPTION_DELETED: &str = "SubscriptionDeleted";
    /// Creating the trigger's subscription failed
    pub const SUBSCRIPTION_CREATE_FAILED: &str = "SubscriptionCreateFailed";
    /// Deleting the trigger's subscription failed
    pub const SUBSCRIPTION_DELETE_FAILED: &str = "SubscriptionDeleteFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a child object
    pub const CREATE: &str = "Create";
    /// Deleting a child object
    pub const DELETE: &str = "Delete";
    /// Writing status or metadata
    pub const UPDATE: &str = "Update";
}
