//! Cloud wire types and the API seams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kraftsync_core::{
    Capability, ChildEntity, CloudCommand, CommandAck, Credential, DeviceEvent, DeviceRole,
    LocalDevice, MappingEntry, Result, TelemetrySample,
};

/// Body of `POST /devices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpsert {
    #[serde(rename = "device_id")]
    pub cloud_id: String,
    pub local_id: String,
    #[serde(rename = "device_type")]
    pub role: DeviceRole,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
    pub capabilities: Vec<Capability>,
    pub entities: Vec<ChildEntity>,
}

impl DeviceUpsert {
    pub fn from_entry(entry: &MappingEntry, device: Option<&LocalDevice>) -> Self {
        let mut capabilities: Vec<Capability> =
            entry.child_entities.iter().map(|c| c.capability).collect();
        capabilities.sort();
        capabilities.dedup();
        Self {
            cloud_id: entry.cloud_id.clone(),
            local_id: entry.local_id.clone(),
            role: entry.role,
            name: entry.name.clone(),
            manufacturer: device.and_then(|d| d.manufacturer.clone()),
            model: device.and_then(|d| d.model.clone()),
            capabilities,
            entities: entry.child_entities.clone(),
        }
    }
}

/// Per-item status of a batched telemetry push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStatus {
    #[serde(rename = "device_id")]
    pub cloud_id: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Outcome of `POST /telemetry`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    #[serde(default)]
    pub results: Vec<ItemStatus>,
}

impl BatchOutcome {
    /// Every sample accepted.
    pub fn all_accepted(samples: &[TelemetrySample]) -> Self {
        Self {
            results: samples
                .iter()
                .map(|s| ItemStatus {
                    cloud_id: s.cloud_id.clone(),
                    accepted: true,
                    error: None,
                })
                .collect(),
        }
    }

    /// Status for one device; devices the server did not mention count as accepted.
    pub fn status_for(&self, cloud_id: &str) -> Option<&ItemStatus> {
        self.results.iter().find(|r| r.cloud_id == cloud_id)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &ItemStatus> {
        self.results.iter().filter(|r| !r.accepted)
    }
}

/// Result of `GET /commands`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPage {
    #[serde(default)]
    pub commands: Vec<CloudCommand>,
    /// Cursor for the next poll; `None` keeps the previous one.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Cloud operations with authentication handled by the implementor.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// `POST /devices`, idempotent on cloud id.
    async fn upsert_device(&self, device: &DeviceUpsert) -> Result<()>;

    /// `DELETE /devices/{cloud_id}`; an already removed device is not an error.
    async fn remove_device(&self, cloud_id: &str) -> Result<()>;

    /// `POST /telemetry`. Returns `Error::Unsupported` when batching is not offered.
    async fn push_telemetry(&self, samples: &[TelemetrySample]) -> Result<BatchOutcome>;

    /// `POST /devices/{cloud_id}/telemetry`.
    async fn push_device_telemetry(&self, sample: &TelemetrySample) -> Result<()>;

    /// `GET /commands?since=<cursor>`.
    async fn fetch_commands(&self, since: Option<&str>) -> Result<CommandPage>;

    /// `POST /commands/{id}/ack`, idempotent.
    async fn ack_command(&self, ack: &CommandAck) -> Result<()>;

    /// `POST /events`.
    async fn report_event(&self, event: &DeviceEvent) -> Result<()>;
}

/// Raw cloud calls that take the bearer token explicitly.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn upsert_device(&self, token: &str, device: &DeviceUpsert) -> Result<()>;
    async fn remove_device(&self, token: &str, cloud_id: &str) -> Result<()>;
    async fn push_telemetry(&self, token: &str, samples: &[TelemetrySample]) -> Result<BatchOutcome>;
    async fn push_device_telemetry(&self, token: &str, sample: &TelemetrySample) -> Result<()>;
    async fn fetch_commands(&self, token: &str, since: Option<&str>) -> Result<CommandPage>;
    async fn ack_command(&self, token: &str, ack: &CommandAck) -> Result<()>;
    async fn report_event(&self, token: &str, event: &DeviceEvent) -> Result<()>;
}

/// `POST /oauth/token` with a refresh-token grant.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;
}
