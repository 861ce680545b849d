//! Test doubles for kraftsync: an in-memory host platform, a recording fake
//! of the cloud API, an in-memory credential store and device fixtures.

pub mod credential_store;
pub mod fake_cloud;
pub mod fixtures;
pub mod memory_host;

pub use credential_store::MemoryCredentialStore;
pub use fake_cloud::{FakeCloud, INITIAL_TOKEN};
pub use memory_host::MemoryHost;
