//! Home Assistant as the local device platform.
//!
//! - **REST API Client**: states, service calls and template rendering
//! - **Grouping**: entity states grouped into devices through the registry
//! - **Host adapter**: [`HassHost`] implements the bridge's host seam

pub mod client;
pub mod entities;
pub mod grouping;
pub mod host;

pub use client::{HassClient, HassClientError, HassResult};
pub use entities::{
    HassConnectionConfig, HassDomain, HassEntityAttributes, HassEntityState, HassRegistryEntry,
    HassServiceCall,
};
pub use grouping::{group_states, snapshot_from_state};
pub use host::HassHost;
