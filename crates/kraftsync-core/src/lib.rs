//! Core types and traits for kraftsync.
//!
//! This crate defines the data model, the error taxonomy, configuration and
//! the seams (host platform, credential store, telemetry source) that the
//! other crates plug into.

pub mod config;
pub mod error;
pub mod host;
pub mod model;
pub mod retry;

pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use host::{
    CredentialStore, DynCredentialStore, DynHost, DynSource, HostAction, HostEvent, HostPlatform,
    SourceKind, TelemetrySource,
};
pub use model::{
    AckStatus, Capability, ChildEntity, CloudCommand, CommandAck, CommandKind, Credential,
    DeviceEvent, DeviceEventKind, DeviceRole, EntityKind, EntitySnapshot, FailureReason,
    LocalDevice, MappingEntry, PhaseValues, TelemetrySample,
};
pub use retry::RetryPolicy;

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{defaults, env_vars, BridgeConfig};
    pub use crate::error::{Error, Result};
    pub use crate::host::{HostAction, HostPlatform, SourceKind, TelemetrySource};
    pub use crate::model::*;
    pub use crate::retry::RetryPolicy;
}
