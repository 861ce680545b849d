//! Seams to the outside world on the local side: the host device platform,
//! the credential store and the telemetry producer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::{Credential, EntitySnapshot, LocalDevice, MappingEntry, TelemetrySample};

/// A service invocation on one host entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAction {
    pub domain: String,
    pub service: String,
    pub entity_id: String,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

impl HostAction {
    pub fn new(domain: impl Into<String>, service: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            entity_id: entity_id.into(),
            data: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Change notifications pushed by a host that supports subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// An entity reported a new state.
    StateChanged { entity_id: String },
    /// Devices were added to or removed from the registry.
    DevicesChanged,
}

/// The local device platform.
#[async_trait]
pub trait HostPlatform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Enumerate devices with their current entity snapshots.
    async fn discover(&self) -> Result<Vec<LocalDevice>>;

    /// Current snapshots of specific entities. Unknown ids are omitted.
    async fn read_entities(&self, entity_ids: &[String]) -> Result<Vec<EntitySnapshot>>;

    /// Invoke an action on one entity.
    async fn invoke(&self, action: &HostAction) -> Result<()>;

    /// Subscribe to change notifications. Poll-only hosts return `None`.
    fn subscribe(&self) -> Option<broadcast::Receiver<HostEvent>> {
        None
    }
}

/// External credential storage. Persistence format is the store's business.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, site_id: &str) -> Result<Option<Credential>>;
    async fn save(&self, site_id: &str, credential: &Credential) -> Result<()>;
}

/// Which kind of producer backs the telemetry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Host,
    Simulation,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Host => "host",
            SourceKind::Simulation => "simulation",
        }
    }
}

/// Producer of telemetry samples for mapped devices.
///
/// Real and simulated sources are interchangeable; one is chosen at startup.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Assemble the latest sample for one mapping entry.
    async fn sample(&self, entry: &MappingEntry) -> Result<TelemetrySample>;
}

pub type DynHost = Arc<dyn HostPlatform>;
pub type DynSource = Arc<dyn TelemetrySource>;
pub type DynCredentialStore = Arc<dyn CredentialStore>;
