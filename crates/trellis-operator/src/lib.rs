//! Trellis operator - startup wiring for the ManagedCluster controller
//!
//! The binary in `main.rs` parses flags, installs CRDs and drives the
//! controllers built here until a shutdown signal arrives.

pub mod config;
pub mod controller_runner;
pub mod crds;
pub mod telemetry;

pub use config::{ControllerArgs, LogFormat, OperatorConfig};
pub use controller_runner::{ControllerFuture, ControllerRegistry};
