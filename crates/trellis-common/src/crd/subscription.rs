//! Subscription CRD
//!
//! A Subscription connects a channel to a subscriber URI with an optional
//! reply destination. Trigger-owned subscriptions are created and replaced
//! by the trigger controller only.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, DeliverySpec, Destination};

/// Label carrying the broker name on trigger-owned objects
pub const BROKER_LABEL: &str = "eventing.trellis.dev/broker";
/// Label carrying the trigger name on trigger-owned subscriptions
pub const TRIGGER_LABEL: &str = "eventing.trellis.dev/trigger";

/// Subscription delivers events from a channel to a subscriber.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "messaging.trellis.dev",
    version = "v1",
    kind = "Subscription",
    namespaced,
    status = "SubscriptionStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// Channel the subscription reads from
    pub channel: ObjectReference,

    /// Where events are pushed
    pub subscriber: Destination,

    /// Where subscriber responses are sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Destination>,

    /// Delivery options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliverySpec>,
}

/// Observed state of a Subscription
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    /// Generation the conditions were computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Subscription {
    /// The subscription's Ready condition, if its controller has reported one
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == "Ready"))
    }
}
