//! Trigger controller for Trellis
//!
//! This controller watches Trigger CRDs and:
//! - Mirrors the owning broker's readiness
//! - Checks the optional dependency annotation
//! - Resolves the subscriber to an absolute URI
//! - Creates, replaces or migrates the trigger's Subscription

#![deny(missing_docs)]

pub mod controller;
pub mod dependency;
pub mod resolver;
pub mod subscription;

pub use controller::{error_policy, reconcile, TriggerContext};

use trellis_common::conditions::ConditionUpdate;
use trellis_common::Error;

/// One condition observed during a pass, plus the error the pass should end with
#[derive(Debug)]
pub struct Observation {
    /// The condition to apply
    pub condition: ConditionUpdate,
    /// Error to report once status is written
    pub error: Option<Error>,
}

impl Observation {
    /// Observation that does not fail the pass
    pub fn ok(condition: ConditionUpdate) -> Self {
        Self {
            condition,
            error: None,
        }
    }

    /// Observation that fails the pass after status is written
    pub fn failed(condition: ConditionUpdate, error: Error) -> Self {
        Self {
            condition,
            error: Some(error),
        }
    }
}
