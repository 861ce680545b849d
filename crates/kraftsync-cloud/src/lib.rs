//! Cloud side of the bridge: REST client, token lifecycle and the
//! authenticated API used by the sync loops.

pub mod api;
pub mod authed;
pub mod client;
pub mod error;
pub mod token;

pub use api::{
    BatchOutcome, CloudApi, CloudTransport, CommandPage, DeviceUpsert, ItemStatus, TokenRefresher,
};
pub use authed::AuthedCloud;
pub use client::CloudClient;
pub use error::CloudError;
pub use token::{TokenManager, TokenState};

/// Shared cloud handle.
pub type DynCloud = std::sync::Arc<dyn CloudApi>;
