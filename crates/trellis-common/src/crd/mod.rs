//! Custom Resource Definitions for Trellis eventing
//!
//! Broker and Trigger are tenant-facing; Subscription is a child object
//! created by the trigger controller.

mod broker;
mod subscription;
mod trigger;
mod types;

pub use broker::{Broker, BrokerSpec, BrokerStatus, ChannelTemplateSpec, BROKER_FINALIZER};
pub use subscription::{
    Subscription, SubscriptionSpec, SubscriptionStatus, BROKER_LABEL, TRIGGER_LABEL,
};
pub use trigger::{Trigger, TriggerFilter, TriggerSpec, TriggerStatus, DEPENDENCY_ANNOTATION};
pub use types::{
    AddressStatus, BackoffPolicy, Condition, ConditionStatus, DeliverySpec, Destination,
    KReference,
};
