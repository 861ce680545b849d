//! Local device side of the bridge.
//!
//! - [`classifier`] assigns device roles
//! - [`hass`] talks to Home Assistant and exposes it as a host platform
//! - [`source`] turns live entity states into telemetry samples

pub mod capability;
pub mod classifier;
pub mod hass;
pub mod source;

pub use capability::{infer_capability, normalize};
pub use classifier::{Classification, Classifier, ConfidenceTier, KeywordRule};
pub use hass::{HassClient, HassConnectionConfig, HassHost};
pub use source::{build_sample, EntitySource};
