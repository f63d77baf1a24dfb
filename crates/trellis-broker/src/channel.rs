//! Trigger channel for a Broker
//!
//! Each Broker is backed by one channel, named `<broker>-kne-trigger`, of the
//! kind given by its channel template. The channel is created once and then
//! only observed: the broker needs its address and nothing else.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};
use serde_json::json;
use url::Url;

use trellis_common::crd::{Broker, ChannelTemplateSpec, BROKER_LABEL};
use trellis_common::duck::{DuckRegistry, GroupKind};
use trellis_common::kube_utils::{build_api_resource, child_name, is_controlled_by};
use trellis_common::Error;

/// Label marking a channel as carrying every event for its broker
pub const BROKER_EVERYTHING_LABEL: &str = "eventing.trellis.dev/brokerEverything";
/// Annotation scoping the channel's dispatcher
pub const SCOPE_ANNOTATION: &str = "eventing.trellis.dev/scope";

/// Name of a broker's trigger channel
pub fn trigger_channel_name(broker: &str) -> String {
    child_name(&format!("{}-kne-trigger", broker))
}

/// The channel a broker wants, built from its template
pub struct DesiredChannel {
    /// API resource of the template's kind
    pub api_resource: ApiResource,
    /// The object to create when the channel is missing
    pub object: DynamicObject,
}

impl DesiredChannel {
    /// Build the trigger channel for `broker` from `template`.
    pub fn for_broker(broker: &Broker, template: &ChannelTemplateSpec) -> Result<Self, Error> {
        let namespace = broker
            .namespace()
            .ok_or_else(|| Error::validation_for(broker.name_any(), "broker has no namespace"))?;
        let owner = broker.controller_owner_ref(&()).ok_or_else(|| {
            Error::internal_with_context("broker", "broker is missing name or uid")
        })?;

        let api_resource = build_api_resource(&template.api_version, &template.kind);
        let mut object =
            DynamicObject::new(&trigger_channel_name(&broker.name_any()), &api_resource)
                .within(&namespace)
                .data(json!({ "spec": template.spec.clone().unwrap_or_else(|| json!({})) }));

        object.metadata.labels = Some(BTreeMap::from([
            (BROKER_LABEL.to_string(), broker.name_any()),
            (BROKER_EVERYTHING_LABEL.to_string(), "true".to_string()),
        ]));
        object.metadata.annotations = Some(BTreeMap::from([(
            SCOPE_ANNOTATION.to_string(),
            "cluster".to_string(),
        )]));
        object.metadata.owner_references = Some(vec![owner]);

        Ok(Self {
            api_resource,
            object,
        })
    }

    /// Name of the channel
    pub fn name(&self) -> String {
        self.object.name_any()
    }
}

/// What the broker learned about its trigger channel this pass
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelObservation {
    /// The broker has no channel template
    TemplateMissing,
    /// Creating or reading the channel failed
    Failed(String),
    /// The channel exists but has not published an address yet
    NoAddress,
    /// The channel is addressable
    Ready {
        /// Reference recorded in broker status
        reference: ObjectReference,
        /// The channel's address
        address: Url,
    },
}

/// Inspect an existing channel object.
///
/// A channel under the expected name that the broker does not control is an
/// ownership conflict and is never adopted.
pub fn observe_channel(
    broker: &Broker,
    channel: &DynamicObject,
    template: &ChannelTemplateSpec,
    ducks: &DuckRegistry,
    cluster_domain: &str,
) -> Result<ChannelObservation, Error> {
    let broker_uid = broker.uid().unwrap_or_default();
    if !is_controlled_by(&channel.metadata, &broker_uid) {
        return Err(Error::ownership(
            "broker",
            broker.name_any(),
            "channel",
            channel.name_any(),
        ));
    }

    let kind = GroupKind::from_api_version(&template.api_version, &template.kind);
    let observation = match ducks.address_capability(&kind).address(channel, cluster_domain) {
        Some(address) => ChannelObservation::Ready {
            reference: ObjectReference {
                api_version: Some(template.api_version.clone()),
                kind: Some(template.kind.clone()),
                name: Some(channel.name_any()),
                namespace: channel.namespace(),
                ..Default::default()
            },
            address,
        },
        None => ChannelObservation::NoAddress,
    };
    Ok(observation)
}
