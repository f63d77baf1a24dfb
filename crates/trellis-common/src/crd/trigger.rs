//! Trigger CRD
//!
//! A Trigger is a filtered subscription to one Broker's events. It is realized
//! as a Subscription from the broker's trigger channel to the resolved
//! subscriber address.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, DeliverySpec, Destination};

/// Annotation naming an object whose readiness gates the Trigger
///
/// Value is JSON: `{"kind":"<Kind>","name":"<name>","apiVersion":"<group>/<version>"}`.
pub const DEPENDENCY_ANNOTATION: &str = "eventing.trellis.dev/dependency";

/// Trigger routes matching events from a Broker to a subscriber.
///
/// Example:
/// ```yaml
/// apiVersion: eventing.trellis.dev/v1
/// kind: Trigger
/// metadata:
///   name: orders
///   namespace: tenant-a
/// spec:
///   broker: default
///   filter:
///     attributes:
///       type: order.created
///   subscriber:
///     ref:
///       apiVersion: v1
///       kind: Service
///       name: order-handler
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "eventing.trellis.dev",
    version = "v1",
    kind = "Trigger",
    namespaced,
    status = "TriggerStatus",
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.broker"}"#,
    printcolumn = r#"{"name":"Subscriber_URI","type":"string","jsonPath":".status.subscriberUri"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Name of the Broker in the same namespace
    pub broker: String,

    /// Attribute filter applied by the dataplane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<TriggerFilter>,

    /// Where matching events are delivered
    pub subscriber: Destination,

    /// Delivery options for the subscription
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliverySpec>,
}

/// Exact-match attribute filter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TriggerFilter {
    /// CloudEvent attribute name to required value
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Observed state of a Trigger
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    /// Generation the conditions were computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Resolved subscriber address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_uri: Option<String>,
}

impl Trigger {
    /// Whether the trigger is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Raw dependency annotation value, if present
    pub fn dependency_annotation(&self) -> Option<&str> {
        self.annotations()
            .get(DEPENDENCY_ANNOTATION)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_with_service_subscriber_yaml() {
        let yaml = r#"
broker: default
filter:
  attributes:
    type: order.created
subscriber:
  ref:
    apiVersion: v1
    kind: Service
    name: order-handler
  uri: /events
"#;
        let spec: TriggerSpec = serde_yaml::from_str(yaml).expect("trigger spec should parse");
        assert_eq!(spec.broker, "default");
        assert_eq!(
            spec.filter
                .as_ref()
                .and_then(|f| f.attributes.get("type"))
                .map(String::as_str),
            Some("order.created")
        );
        let reference = spec.subscriber.ref_.expect("ref should be set");
        assert_eq!(reference.kind, "Service");
        assert_eq!(spec.subscriber.uri.as_deref(), Some("/events"));
    }

    #[test]
    fn dependency_annotation_lookup() {
        let mut trigger = Trigger::new(
            "orders",
            TriggerSpec {
                broker: "default".to_string(),
                subscriber: Destination::uri("http://example.com/"),
                ..Default::default()
            },
        );
        assert!(trigger.dependency_annotation().is_none());

        trigger.metadata.annotations = Some(BTreeMap::from([(
            DEPENDENCY_ANNOTATION.to_string(),
            r#"{"kind":"PingSource","name":"ping","apiVersion":"sources.trellis.dev/v1"}"#
                .to_string(),
        )]));
        assert!(trigger
            .dependency_annotation()
            .is_some_and(|v| v.contains("PingSource")));
    }
}
