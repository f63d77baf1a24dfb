//! Status-condition state machine
//!
//! A [`ConditionSet`] names one "happy" condition (`Ready`) and the dependent
//! conditions it summarizes. Dependents are set individually; the happy
//! condition is never set directly and is recomputed after every change:
//!
//! - the first dependent (in declaration order) that is False makes Ready False
//!   with that dependent's reason and message;
//! - otherwise the first dependent that is Unknown or missing makes Ready Unknown;
//! - otherwise Ready is True.
//!
//! Conditions are upserted by type. A condition's `lastTransitionTime` only
//! moves when its status changes, so re-applying the same observations yields
//! an identical condition list.

use chrono::Utc;

use crate::crd::{Condition, ConditionStatus};

/// The summary condition every eventing object carries
pub const READY: &str = "Ready";

/// Broker: the trigger channel exists and is addressable
pub const TRIGGER_CHANNEL: &str = "TriggerChannel";
/// Broker: the filter service has ready endpoints
pub const FILTER_READY: &str = "FilterReady";
/// Broker: the ingress service has ready endpoints
pub const INGRESS_READY: &str = "IngressReady";
/// Broker: the public address is computed
pub const ADDRESSABLE: &str = "Addressable";

/// Trigger: the owning broker is ready
pub const BROKER_READY: &str = "BrokerReady";
/// Trigger: the annotated dependency is ready
pub const DEPENDENCY_READY: &str = "DependencyReady";
/// Trigger: the subscriber address resolved
pub const SUBSCRIBER_RESOLVED: &str = "SubscriberResolved";
/// Trigger: the subscription is ready
pub const SUBSCRIBED: &str = "Subscribed";

/// A happy condition and the dependents it summarizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionSet {
    /// The summary condition type
    pub happy: &'static str,
    /// Dependent condition types, in precedence order
    pub dependents: &'static [&'static str],
}

/// Conditions for Broker status
pub const BROKER_CONDITIONS: ConditionSet = ConditionSet {
    happy: READY,
    dependents: &[TRIGGER_CHANNEL, FILTER_READY, INGRESS_READY, ADDRESSABLE],
};

/// Conditions for Trigger status
pub const TRIGGER_CONDITIONS: ConditionSet = ConditionSet {
    happy: READY,
    dependents: &[BROKER_READY, DEPENDENCY_READY, SUBSCRIBER_RESOLVED, SUBSCRIBED],
};

/// The observed state of one dependent condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionUpdate {
    /// New status
    pub status: ConditionStatus,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl ConditionUpdate {
    /// The dependent is satisfied
    pub fn ready() -> Self {
        Self {
            status: ConditionStatus::True,
            reason: String::new(),
            message: String::new(),
        }
    }

    /// The dependent failed
    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ConditionStatus::False,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// The dependent is not known to be either ready or failed yet
    pub fn unknown(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ConditionStatus::Unknown,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Propagate another object's condition verbatim
    pub fn mirror(condition: &Condition) -> Self {
        Self {
            status: condition.status,
            reason: condition.reason.clone(),
            message: condition.message.clone(),
        }
    }
}

impl ConditionSet {
    /// Look up a condition by type
    pub fn get<'a>(&self, conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
        conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether every dependent is True
    pub fn is_ready(&self, conditions: &[Condition]) -> bool {
        self.dependents.iter().all(|dep| {
            self.get(conditions, dep)
                .is_some_and(|c| c.status == ConditionStatus::True)
        })
    }

    /// Add Unknown entries for any missing dependent and recompute Ready
    pub fn initialize(&self, conditions: &mut Vec<Condition>) {
        for dep in self.dependents {
            if self.get(conditions, dep).is_none() {
                conditions.push(Condition::new(*dep, ConditionStatus::Unknown, "", ""));
            }
        }
        self.recompute(conditions);
    }

    /// Set one dependent condition and recompute Ready.
    ///
    /// Returns whether the condition list changed. Setting the happy type
    /// directly is ignored; it always follows the dependents.
    pub fn apply(&self, conditions: &mut Vec<Condition>, type_: &str, update: &ConditionUpdate) -> bool {
        if type_ == self.happy {
            return false;
        }
        let before = conditions.clone();
        upsert(conditions, type_, update);
        self.recompute(conditions);
        *conditions != before
    }

    /// Mark a dependent True
    pub fn mark_true(&self, conditions: &mut Vec<Condition>, type_: &str) -> bool {
        self.apply(conditions, type_, &ConditionUpdate::ready())
    }

    /// Mark a dependent False
    pub fn mark_false(
        &self,
        conditions: &mut Vec<Condition>,
        type_: &str,
        reason: &str,
        message: &str,
    ) -> bool {
        self.apply(conditions, type_, &ConditionUpdate::failed(reason, message))
    }

    /// Mark a dependent Unknown
    pub fn mark_unknown(
        &self,
        conditions: &mut Vec<Condition>,
        type_: &str,
        reason: &str,
        message: &str,
    ) -> bool {
        self.apply(conditions, type_, &ConditionUpdate::unknown(reason, message))
    }

    fn recompute(&self, conditions: &mut Vec<Condition>) {
        let mut summary = ConditionUpdate::ready();
        let mut unknown: Option<ConditionUpdate> = None;

        for dep in self.dependents {
            match self.get(conditions, dep) {
                Some(c) if c.status == ConditionStatus::False => {
                    summary = ConditionUpdate::mirror(c);
                    unknown = None;
                    break;
                }
                Some(c) if c.status == ConditionStatus::True => {}
                Some(c) => {
                    unknown.get_or_insert_with(|| ConditionUpdate::mirror(c));
                }
                None => {
                    unknown.get_or_insert_with(|| ConditionUpdate::unknown("", ""));
                }
            }
        }

        if let Some(u) = unknown {
            summary = u;
        }
        upsert(conditions, self.happy, &summary);
    }
}

fn upsert(conditions: &mut Vec<Condition>, type_: &str, update: &ConditionUpdate) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != update.status {
                existing.last_transition_time = Some(Utc::now());
            }
            existing.status = update.status;
            existing.reason.clone_from(&update.reason);
            existing.message.clone_from(&update.message);
        }
        None => conditions.push(Condition::new(
            type_,
            update.status,
            update.reason.clone(),
            update.message.clone(),
        )),
    }
}
