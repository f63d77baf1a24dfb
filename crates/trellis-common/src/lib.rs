//! Common types for Trellis: CRDs, conditions, errors and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod config;
pub mod crd;
pub mod deadline;
pub mod duck;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;
pub mod tracker;

pub use config::EventingConfig;
pub use deadline::PassGuard;
pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher};
pub use tracker::{ObjectKey, Tracker};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write the controllers make
pub const FIELD_MANAGER: &str = "trellis-controller";
