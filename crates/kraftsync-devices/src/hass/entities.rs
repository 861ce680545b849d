//! Home Assistant entity types and structures.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Home Assistant connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct HassConnectionConfig {
    /// Home Assistant URL (e.g., http://homeassistant.local:8123)
    pub url: String,

    /// Long-lived access token
    pub token: String,

    /// Whether to verify SSL certificates
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_verify_ssl() -> bool {
    true
}
fn default_timeout() -> u64 {
    10
}

impl HassConnectionConfig {
    /// Create a new connection config with bearer token.
    pub fn with_bearer_token(url: String, token: String) -> Self {
        Self {
            url,
            token,
            verify_ssl: true,
            timeout: default_timeout(),
        }
    }

    /// Build from the `[host]` section of the bridge configuration.
    pub fn from_section(section: &kraftsync_core::config::HostSection) -> Self {
        Self {
            url: section.url.clone(),
            token: section.token.clone(),
            verify_ssl: section.verify_ssl,
            timeout: section.timeout_secs,
        }
    }

    /// Get the authorization header value.
    pub fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Get the API base URL.
    pub fn api_base(&self) -> String {
        format!("{}/api", self.url.trim_end_matches('/'))
    }
}

impl std::fmt::Debug for HassConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HassConnectionConfig")
            .field("url", &self.url)
            .field("verify_ssl", &self.verify_ssl)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Home Assistant entity state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HassEntityState {
    /// Entity ID (e.g., sensor.ams_power)
    pub entity_id: String,

    /// Current state value
    pub state: String,

    /// Entity attributes
    #[serde(default)]
    pub attributes: HassEntityAttributes,

    /// Last changed timestamp
    #[serde(default)]
    pub last_changed: Option<String>,

    /// Last updated timestamp
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Home Assistant entity attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HassEntityAttributes {
    /// Friendly name for display
    #[serde(default)]
    pub friendly_name: Option<String>,

    /// Device class (if applicable)
    #[serde(default)]
    pub device_class: Option<String>,

    /// Unit of measurement
    #[serde(default)]
    pub unit_of_measurement: Option<String>,

    /// State class (measurement, total, total_increasing)
    #[serde(default)]
    pub state_class: Option<String>,

    /// All other attributes
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Registry information for one entity, rendered through the template API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HassRegistryEntry {
    pub device_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Integration that created the device (first identifier domain).
    #[serde(default)]
    pub integration: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Home Assistant entity domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HassDomain {
    Sensor,
    BinarySensor,
    Switch,
    Climate,
    WaterHeater,
    Number,
    Select,
    Button,
    InputBoolean,
    InputNumber,
    InputSelect,
    Light,
    #[serde(other)]
    Unknown,
}

impl HassDomain {
    /// Parse domain from entity ID.
    pub fn from_entity_id(entity_id: &str) -> Self {
        match kraftsync_core::model::entity_domain(entity_id) {
            "sensor" => HassDomain::Sensor,
            "binary_sensor" => HassDomain::BinarySensor,
            "switch" => HassDomain::Switch,
            "climate" => HassDomain::Climate,
            "water_heater" => HassDomain::WaterHeater,
            "number" => HassDomain::Number,
            "select" => HassDomain::Select,
            "button" => HassDomain::Button,
            "input_boolean" => HassDomain::InputBoolean,
            "input_number" => HassDomain::InputNumber,
            "input_select" => HassDomain::InputSelect,
            "light" => HassDomain::Light,
            _ => HassDomain::Unknown,
        }
    }

    /// Whether entities of this domain are relevant to energy devices.
    pub fn is_relevant(&self) -> bool {
        !matches!(self, HassDomain::Unknown)
    }
}

/// Service call request for Home Assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HassServiceCall {
    /// Domain (e.g., "switch", "water_heater")
    pub domain: String,

    /// Service name (e.g., "turn_on", "set_temperature")
    pub service: String,

    /// Service data (entity_id and parameters)
    pub service_data: serde_json::Value,
}

impl HassServiceCall {
    /// Create a new service call.
    pub fn new(domain: String, service: String, entity_id: String) -> Self {
        let mut service_data = serde_json::Map::new();
        service_data.insert("entity_id".to_string(), serde_json::json!(entity_id));

        Self {
            domain,
            service,
            service_data: serde_json::Value::Object(service_data),
        }
    }

    /// Add a parameter to the service call.
    pub fn with_param(mut self, key: String, value: serde_json::Value) -> Self {
        if let Some(obj) = self.service_data.as_object_mut() {
            obj.insert(key, value);
        }
        self
    }
}

impl From<&kraftsync_core::HostAction> for HassServiceCall {
    fn from(action: &kraftsync_core::HostAction) -> Self {
        action.data.iter().fold(
            HassServiceCall::new(
                action.domain.clone(),
                action.service.clone(),
                action.entity_id.clone(),
            ),
            |call, (k, v)| call.with_param(k.clone(), v.clone()),
        )
    }
}
