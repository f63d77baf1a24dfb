//! Broker CRD
//!
//! A Broker is the per-namespace ingress point for events. Each Broker is
//! backed by a trigger channel created from its channel template and fronted
//! by the shared filter and ingress services in the system namespace.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AddressStatus, Condition};

/// Finalizer the broker controller places on every Broker it reconciles
pub const BROKER_FINALIZER: &str = "brokers.eventing.trellis.dev";

/// Broker accepts events and fans them out to Triggers.
///
/// Example:
/// ```yaml
/// apiVersion: eventing.trellis.dev/v1
/// kind: Broker
/// metadata:
///   name: default
///   namespace: tenant-a
/// spec:
///   channelTemplate:
///     apiVersion: messaging.trellis.dev/v1
///     kind: InMemoryChannel
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "eventing.trellis.dev",
    version = "v1",
    kind = "Broker",
    namespaced,
    status = "BrokerStatus",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.address.url"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// Template for the trigger channel backing this broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_template: Option<ChannelTemplateSpec>,
}

/// Kind and spec of the channel to create for a Broker
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTemplateSpec {
    /// API version of the channel kind (e.g., "messaging.trellis.dev/v1")
    pub api_version: String,
    /// Channel kind (e.g., "InMemoryChannel")
    pub kind: String,
    /// Opaque spec copied into the channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
}

/// Observed state of a Broker
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    /// Generation the conditions were computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Public address of the broker ingress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<AddressStatus>,

    /// Trigger channel backing this broker, set once it is addressable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ObjectReference>,
}

impl Broker {
    /// Whether the broker is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The broker's Ready condition, if status has been written
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == "Ready"))
    }

    /// The trigger channel recorded in status, if any
    pub fn channel_ref(&self) -> Option<&ObjectReference> {
        self.status.as_ref().and_then(|s| s.channel.as_ref())
    }
}
