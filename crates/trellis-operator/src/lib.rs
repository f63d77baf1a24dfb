//! Trellis operator - wires the broker and trigger controllers together

pub mod controller_runner;
