//! Broker controller for Trellis
//!
//! This controller watches Broker CRDs and:
//! - Manages the broker finalizer
//! - Creates the trigger channel from the broker's channel template
//! - Checks the shared filter and ingress services
//! - Publishes the broker's address and Ready condition

#![deny(missing_docs)]

pub mod channel;
pub mod controller;

pub use controller::{error_policy, reconcile, BrokerContext};
