//! Trigger-owned Subscription
//!
//! Every trigger is realized as one Subscription from its broker's trigger
//! channel to the resolved subscriber, with replies routed back to the
//! broker. The subscription is named after broker, trigger and trigger uid;
//! subscriptions created under the older broker-and-trigger name are removed
//! when found.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use trellis_common::conditions::ConditionUpdate;
use trellis_common::crd::{
    Broker, ConditionStatus, Destination, KReference, Subscription, SubscriptionSpec, Trigger,
    BROKER_LABEL, TRIGGER_LABEL,
};
use trellis_common::events::{actions, reasons, EventPublisher};
use trellis_common::kube_utils::{child_name, is_controlled_by, namespaced_name};
use trellis_common::{Error, PassGuard};

use crate::controller::TriggerKubeClient;
use crate::Observation;

const NOT_SUBSCRIBED: &str = "NotSubscribed";
const NOT_CONFIGURED: &str = "SubscriptionNotConfigured";
const NOT_CONFIGURED_MESSAGE: &str = "Subscription has not yet been reconciled.";

/// Name of the subscription realizing a trigger
pub fn subscription_name(broker: &str, trigger: &str, trigger_uid: &str) -> String {
    child_name(&format!("{}-{}-{}", broker, trigger, trigger_uid))
}

/// Name older releases gave the subscription; it collides across trigger re-creations
pub fn legacy_subscription_name(broker: &str, trigger: &str) -> String {
    child_name(&format!("{}-{}", broker, trigger))
}

/// The subscription a trigger wants, given its broker's channel and resolved subscriber
pub fn desired_subscription(
    trigger: &Trigger,
    channel: &ObjectReference,
    subscriber_uri: &str,
) -> Result<Subscription, Error> {
    let name = trigger.name_any();
    let namespace = trigger
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "trigger has no namespace"))?;
    let uid = trigger
        .uid()
        .ok_or_else(|| Error::internal_with_context("trigger", "trigger is missing uid"))?;
    let owner = trigger
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal_with_context("trigger", "trigger is missing name or uid"))?;
    let broker = &trigger.spec.broker;

    Ok(Subscription {
        metadata: ObjectMeta {
            name: Some(subscription_name(broker, &name, &uid)),
            namespace: Some(namespace.clone()),
            labels: Some(BTreeMap::from([
                (BROKER_LABEL.to_string(), broker.clone()),
                (TRIGGER_LABEL.to_string(), name.clone()),
            ])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: SubscriptionSpec {
            channel: channel.clone(),
            subscriber: Destination::uri(subscriber_uri),
            reply: Some(Destination::reference(KReference {
                kind: Broker::kind(&()).to_string(),
                api_version: Broker::api_version(&()).to_string(),
                name: broker.clone(),
                namespace: Some(namespace),
            })),
            delivery: trigger.spec.delivery.clone(),
        },
        status: None,
    })
}

/// Subscribed condition mirroring an owned subscription's Ready
fn propagate_ready(subscription: &Subscription) -> ConditionUpdate {
    match subscription.ready_condition() {
        Some(ready) if ready.status == ConditionStatus::True => ConditionUpdate::ready(),
        Some(ready) => ConditionUpdate::mirror(ready),
        None => ConditionUpdate::unknown(NOT_CONFIGURED, NOT_CONFIGURED_MESSAGE),
    }
}

/// Outcome of looking for a subscription under the legacy name
enum LegacySubscription {
    /// None found, or one this trigger does not own
    Absent,
    /// Found, owned and deleted this pass
    Removed,
    /// The read or the delete failed
    Failed(Observation),
}

fn not_subscribed(error: Error) -> Observation {
    Observation::failed(
        ConditionUpdate::unknown(NOT_SUBSCRIBED, error.to_string()),
        error,
    )
}

/// Creates, replaces and migrates the subscription behind a trigger
pub struct SubscriptionReconciler {
    kube: Arc<dyn TriggerKubeClient>,
    events: Arc<dyn EventPublisher>,
}

impl SubscriptionReconciler {
    /// Create a subscription reconciler
    pub fn new(kube: Arc<dyn TriggerKubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self { kube, events }
    }

    /// Converge the trigger's subscription and observe the Subscribed condition.
    ///
    /// Only cancellation is returned as an error.
    pub async fn reconcile(
        &self,
        trigger: &Trigger,
        broker: &Broker,
        subscriber_uri: &str,
        guard: &PassGuard,
    ) -> Result<Observation, Error> {
        let Some(channel) = broker.channel_ref() else {
            debug!("broker has no trigger channel yet");
            return Ok(Observation::ok(ConditionUpdate::unknown(
                "BrokerChannelNotReady",
                "Broker's trigger channel is not ready yet.",
            )));
        };

        let desired = match desired_subscription(trigger, channel, subscriber_uri) {
            Ok(desired) => desired,
            Err(e) => return Ok(not_subscribed(e)),
        };
        let namespace = desired.namespace().unwrap_or_default();

        let legacy_removed = match self.remove_legacy(trigger, &namespace, guard).await? {
            LegacySubscription::Failed(failed) => return Ok(failed),
            LegacySubscription::Removed => true,
            LegacySubscription::Absent => false,
        };

        let name = desired.name_any();
        guard.check("get subscription")?;
        let existing = match self.kube.get_subscription(&name, &namespace).await {
            Ok(existing) => existing,
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) => return Ok(not_subscribed(e)),
        };

        let Some(existing) = existing else {
            return self.create(trigger, &desired, guard).await;
        };

        if !is_controlled_by(&existing.metadata, &trigger.uid().unwrap_or_default()) {
            warn!(subscription = %name, "subscription exists but is not owned by this trigger");
            return Ok(not_subscribed(Error::ownership(
                "trigger",
                trigger.name_any(),
                "subscription",
                name,
            )));
        }

        if existing.spec != desired.spec {
            // At most one delete and one create per pass
            if legacy_removed {
                debug!(subscription = %name, "subscription drifted, replacing on the next pass");
                return Ok(Observation::ok(ConditionUpdate::unknown(
                    NOT_CONFIGURED,
                    NOT_CONFIGURED_MESSAGE,
                )));
            }
            info!(subscription = %name, "subscription spec drifted, replacing");
            if let Some(failed) = self.delete(trigger, &name, &namespace, guard).await? {
                return Ok(failed);
            }
            return self.create(trigger, &desired, guard).await;
        }

        Ok(Observation::ok(propagate_ready(&existing)))
    }

    /// Observe the Subscribed condition without creating or deleting anything.
    ///
    /// Used while the trigger is being deleted: its children go with it.
    pub async fn observe(&self, trigger: &Trigger, guard: &PassGuard) -> Result<Observation, Error> {
        let namespace = trigger.namespace().unwrap_or_default();
        let name = subscription_name(
            &trigger.spec.broker,
            &trigger.name_any(),
            &trigger.uid().unwrap_or_default(),
        );

        guard.check("get subscription")?;
        let observation = match self.kube.get_subscription(&name, &namespace).await {
            Ok(None) => Observation::ok(ConditionUpdate::unknown(NOT_CONFIGURED, NOT_CONFIGURED_MESSAGE)),
            Ok(Some(existing))
                if is_controlled_by(&existing.metadata, &trigger.uid().unwrap_or_default()) =>
            {
                Observation::ok(propagate_ready(&existing))
            }
            Ok(Some(_)) => Observation::ok(ConditionUpdate::unknown(
                NOT_SUBSCRIBED,
                Error::ownership("trigger", trigger.name_any(), "subscription", name).to_string(),
            )),
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) => not_subscribed(e),
        };
        Ok(observation)
    }

    /// Delete a subscription left under the legacy name, if this trigger owns it.
    async fn remove_legacy(
        &self,
        trigger: &Trigger,
        namespace: &str,
        guard: &PassGuard,
    ) -> Result<LegacySubscription, Error> {
        let legacy = legacy_subscription_name(&trigger.spec.broker, &trigger.name_any());

        guard.check("get legacy subscription")?;
        let existing = match self.kube.get_subscription(&legacy, namespace).await {
            Ok(existing) => existing,
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) => return Ok(LegacySubscription::Failed(not_subscribed(e))),
        };

        match existing {
            Some(sub) if is_controlled_by(&sub.metadata, &trigger.uid().unwrap_or_default()) => {
                info!(subscription = %legacy, "removing deprecated subscription");
                if let Some(failed) = self.delete(trigger, &legacy, namespace, guard).await? {
                    return Ok(LegacySubscription::Failed(failed));
                }
                self.events
                    .publish(
                        &trigger.object_ref(&()),
                        EventType::Normal,
                        reasons::SUBSCRIPTION_DELETED,
                        actions::DELETE,
                        Some(format!(
                            "Deprecated subscription removed: \"{}\"",
                            namespaced_name(namespace, &legacy)
                        )),
                    )
                    .await;
                Ok(LegacySubscription::Removed)
            }
            Some(_) => {
                debug!(subscription = %legacy, "legacy-named subscription is not owned, leaving it");
                Ok(LegacySubscription::Absent)
            }
            None => Ok(LegacySubscription::Absent),
        }
    }

    async fn create(
        &self,
        trigger: &Trigger,
        desired: &Subscription,
        guard: &PassGuard,
    ) -> Result<Observation, Error> {
        guard.check("create subscription")?;
        info!(subscription = %desired.name_any(), "creating subscription");
        match self.kube.create_subscription(desired).await {
            Ok(_) => Ok(Observation::ok(ConditionUpdate::unknown(
                NOT_CONFIGURED,
                NOT_CONFIGURED_MESSAGE,
            ))),
            Err(e @ Error::Cancelled { .. }) => Err(e),
            Err(e) => {
                warn!(error = %e, "failed to create subscription");
                self.events
                    .publish(
                        &trigger.object_ref(&()),
                        EventType::Warning,
                        reasons::SUBSCRIPTION_CREATE_FAILED,
                        actions::CREATE,
                        Some(format!("Create Trigger's subscription failed: {}", e)),
                    )
                    .await;
                Ok(not_subscribed(e))
            }
        }
    }

    /// Delete a subscription; returns the failed observation if the delete failed.
    async fn delete(
        &self,
        trigger: &Trigger,
        name: &str,
        namespace: &str,
        guard: &PassGuard,
    ) -> Result<Option<Observation>, Error> {
        guard.check("delete subscription")?;
        match self.kube.delete_subscription(name, namespace).await {
            Ok(()) => Ok(None),
            Err(e @ Error::Cancelled { .. }) => Err(e),
            Err(e) => {
                warn!(subscription = %name, error = %e, "failed to delete subscription");
                self.events
                    .publish(
                        &trigger.object_ref(&()),
                        EventType::Warning,
                        reasons::SUBSCRIPTION_DELETE_FAILED,
                        actions::DELETE,
                        Some(format!("Delete Trigger's subscription failed: {}", e)),
                    )
                    .await;
                Ok(Some(not_subscribed(e)))
            }
        }
    }
}
