//! Data model shared by the classifier, mapper, publisher and router.
//!
//! Local devices are described the way the host platform reports them: a
//! device with a set of child entities, each carrying a raw state string.
//! Everything the cloud sees (mapping entries, samples, commands, acks) is
//! derived from those descriptors.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a local device, as decided by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    PowerMeter,
    WaterHeater,
    EvCharger,
    SmartPlug,
    Unknown,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::PowerMeter => "power_meter",
            DeviceRole::WaterHeater => "water_heater",
            DeviceRole::EvCharger => "ev_charger",
            DeviceRole::SmartPlug => "smart_plug",
            DeviceRole::Unknown => "unknown",
        }
    }

    /// Whether a device with this role may be mapped to the cloud.
    pub fn is_mappable(&self) -> bool {
        !matches!(self, DeviceRole::Unknown)
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single child entity measures or controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Power,
    PowerL1,
    PowerL2,
    PowerL3,
    Energy,
    EnergyImport,
    EnergyExport,
    EnergyToday,
    VoltageL1,
    VoltageL2,
    VoltageL3,
    CurrentL1,
    CurrentL2,
    CurrentL3,
    Temperature,
    SessionEnergy,
    ChargeLimit,
    OnOff,
    Mode,
    Other,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Power => "power",
            Capability::PowerL1 => "power_l1",
            Capability::PowerL2 => "power_l2",
            Capability::PowerL3 => "power_l3",
            Capability::Energy => "energy",
            Capability::EnergyImport => "energy_import",
            Capability::EnergyExport => "energy_export",
            Capability::EnergyToday => "energy_today",
            Capability::VoltageL1 => "voltage_l1",
            Capability::VoltageL2 => "voltage_l2",
            Capability::VoltageL3 => "voltage_l3",
            Capability::CurrentL1 => "current_l1",
            Capability::CurrentL2 => "current_l2",
            Capability::CurrentL3 => "current_l3",
            Capability::Temperature => "temperature",
            Capability::SessionEnergy => "session_energy",
            Capability::ChargeLimit => "charge_limit",
            Capability::OnOff => "on_off",
            Capability::Mode => "mode",
            Capability::Other => "other",
        }
    }

    /// Parse a capability name. Unphased `voltage`/`current` map to phase L1.
    pub fn parse(s: &str) -> Option<Self> {
        let cap = match s.trim().to_ascii_lowercase().as_str() {
            "power" => Capability::Power,
            "power_l1" => Capability::PowerL1,
            "power_l2" => Capability::PowerL2,
            "power_l3" => Capability::PowerL3,
            "energy" | "energy_total" => Capability::Energy,
            "energy_import" => Capability::EnergyImport,
            "energy_export" => Capability::EnergyExport,
            "energy_today" => Capability::EnergyToday,
            "voltage" | "voltage_l1" => Capability::VoltageL1,
            "voltage_l2" => Capability::VoltageL2,
            "voltage_l3" => Capability::VoltageL3,
            "current" | "current_l1" => Capability::CurrentL1,
            "current_l2" => Capability::CurrentL2,
            "current_l3" => Capability::CurrentL3,
            "temperature" => Capability::Temperature,
            "session_energy" => Capability::SessionEnergy,
            "charge_limit" => Capability::ChargeLimit,
            "on_off" => Capability::OnOff,
            "mode" => Capability::Mode,
            _ => return None,
        };
        Some(cap)
    }

    /// Phase index (0-based) for per-phase capabilities.
    pub fn phase(&self) -> Option<usize> {
        match self {
            Capability::PowerL1 | Capability::VoltageL1 | Capability::CurrentL1 => Some(0),
            Capability::PowerL2 | Capability::VoltageL2 | Capability::CurrentL2 => Some(1),
            Capability::PowerL3 | Capability::VoltageL3 | Capability::CurrentL3 => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only sensor or writable control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sensor,
    Control,
}

impl EntityKind {
    /// Derive the kind from the entity's platform domain.
    pub fn from_domain(domain: &str) -> Self {
        match domain {
            "switch" | "water_heater" | "climate" | "number" | "select" | "button"
            | "input_boolean" | "input_number" | "input_select" | "light" => EntityKind::Control,
            _ => EntityKind::Sensor,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, EntityKind::Control)
    }
}

/// Current state of one host entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub capability: Capability,
    pub kind: EntityKind,
    /// Raw state string; `None` when the host has no state yet.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntitySnapshot {
    /// Build a snapshot, deriving the kind from the entity id's domain.
    pub fn new(entity_id: impl Into<String>, capability: Capability) -> Self {
        let entity_id = entity_id.into();
        let kind = EntityKind::from_domain(entity_domain(&entity_id));
        Self {
            entity_id,
            capability,
            kind,
            state: None,
            unit: None,
            attributes: serde_json::Map::new(),
            updated_at: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Platform domain part of the entity id (`sensor` in `sensor.ev_power`).
    pub fn domain(&self) -> &str {
        entity_domain(&self.entity_id)
    }

    /// Whether the entity currently reports a usable state.
    pub fn is_available(&self) -> bool {
        match self.state.as_deref() {
            None => false,
            Some(s) => !matches!(s, "unavailable" | "unknown" | ""),
        }
    }

    /// Numeric state, if the state parses as a finite number.
    pub fn numeric(&self) -> Option<f64> {
        if !self.is_available() {
            return None;
        }
        self.state
            .as_deref()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    /// Boolean interpretation of the state (`on`, `heating`, `charging`...).
    pub fn as_bool(&self) -> Option<bool> {
        if !self.is_available() {
            return None;
        }
        match self.state.as_deref().map(|s| s.to_ascii_lowercase()) {
            Some(s) => match s.as_str() {
                "on" | "true" | "heating" | "charging" | "eco" | "electric" | "performance"
                | "high_demand" | "heat_pump" | "gas" => Some(true),
                "off" | "false" | "idle" | "disconnected" | "completed" => Some(false),
                _ => None,
            },
            None => None,
        }
    }

    /// Numeric attribute value.
    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn child(&self) -> ChildEntity {
        ChildEntity {
            entity_id: self.entity_id.clone(),
            capability: self.capability,
            kind: self.kind,
        }
    }
}

/// Domain part of an entity id.
pub fn entity_domain(entity_id: &str) -> &str {
    entity_id.split('.').next().unwrap_or(entity_id)
}

/// A device as discovered on the host platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDevice {
    pub local_id: String,
    /// Source integration tag, e.g. `easee`.
    #[serde(default)]
    pub integration: Option<String>,
    /// Device class hint reported by the platform.
    #[serde(default)]
    pub device_class: Option<String>,
    pub name: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub entities: Vec<EntitySnapshot>,
}

impl LocalDevice {
    pub fn new(local_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            integration: None,
            device_class: None,
            name: name.into(),
            manufacturer: None,
            model: None,
            entities: Vec::new(),
        }
    }

    pub fn with_integration(mut self, integration: impl Into<String>) -> Self {
        self.integration = Some(integration.into());
        self
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    pub fn with_entity(mut self, entity: EntitySnapshot) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntitySnapshot> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }

    /// Child entities as an ordered set keyed by entity id.
    pub fn child_entities(&self) -> Vec<ChildEntity> {
        let set: BTreeMap<&str, ChildEntity> = self
            .entities
            .iter()
            .map(|e| (e.entity_id.as_str(), e.child()))
            .collect();
        set.into_values().collect()
    }
}

/// Entity reference kept in a mapping entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildEntity {
    pub entity_id: String,
    pub capability: Capability,
    pub kind: EntityKind,
}

impl ChildEntity {
    pub fn domain(&self) -> &str {
        entity_domain(&self.entity_id)
    }
}

/// Durable link between a local device and its cloud twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub local_id: String,
    pub cloud_id: String,
    pub role: DeviceRole,
    pub name: String,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Ordered by entity id, unique.
    #[serde(default)]
    pub child_entities: Vec<ChildEntity>,
}

impl MappingEntry {
    pub fn child_entity_ids(&self) -> Vec<&str> {
        self.child_entities.iter().map(|c| c.entity_id.as_str()).collect()
    }

    pub fn controls(&self) -> impl Iterator<Item = &ChildEntity> {
        self.child_entities.iter().filter(|c| c.kind.is_control())
    }

    pub fn sensors(&self) -> impl Iterator<Item = &ChildEntity> {
        self.child_entities.iter().filter(|c| !c.kind.is_control())
    }

    /// First child entity with the given capability, sensors or controls.
    pub fn entity_for(&self, capability: Capability) -> Option<&ChildEntity> {
        self.child_entities.iter().find(|c| c.capability == capability)
    }
}

/// Per-phase readings, L1..L3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseValues {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub l1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub l2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub l3: Option<f64>,
}

impl PhaseValues {
    pub fn set(&mut self, phase: usize, value: f64) {
        match phase {
            0 => self.l1 = Some(value),
            1 => self.l2 = Some(value),
            2 => self.l3 = Some(value),
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.l1.is_none() && self.l2.is_none() && self.l3.is_none()
    }

    pub fn sum(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        Some(self.l1.unwrap_or(0.0) + self.l2.unwrap_or(0.0) + self.l3.unwrap_or(0.0))
    }
}

/// One telemetry reading for a mapped device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub local_id: String,
    #[serde(rename = "device_id")]
    pub cloud_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub power_w: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub energy_today_kwh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub energy_total_kwh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub energy_export_kwh: Option<f64>,
    #[serde(skip_serializing_if = "PhaseValues::is_empty", default)]
    pub voltage_by_phase: PhaseValues,
    #[serde(skip_serializing_if = "PhaseValues::is_empty", default)]
    pub current_by_phase: PhaseValues,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_energy_kwh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub charge_limit_a: Option<f64>,
    /// Set when a cumulative counter went backwards since the last sample.
    #[serde(default)]
    pub energy_reset: bool,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

impl TelemetrySample {
    pub fn new(local_id: impl Into<String>, cloud_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            local_id: local_id.into(),
            cloud_id: cloud_id.into(),
            timestamp,
            power_w: None,
            energy_today_kwh: None,
            energy_total_kwh: None,
            energy_export_kwh: None,
            voltage_by_phase: PhaseValues::default(),
            current_by_phase: PhaseValues::default(),
            is_on: None,
            temperature_c: None,
            target_temperature_c: None,
            session_energy_kwh: None,
            charge_limit_a: None,
            energy_reset: false,
            available: true,
        }
    }

    /// True when the sample carries no measurement at all.
    pub fn is_empty(&self) -> bool {
        self.power_w.is_none()
            && self.energy_today_kwh.is_none()
            && self.energy_total_kwh.is_none()
            && self.energy_export_kwh.is_none()
            && self.voltage_by_phase.is_empty()
            && self.current_by_phase.is_empty()
            && self.is_on.is_none()
            && self.temperature_c.is_none()
            && self.target_temperature_c.is_none()
            && self.session_energy_kwh.is_none()
            && self.charge_limit_a.is_none()
    }
}

/// Command kinds understood by the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandKind {
    TurnOn,
    TurnOff,
    SetTemperature,
    SetMode,
    StartCharge,
    StopCharge,
    SetChargeLimit,
    Other(String),
}

impl CommandKind {
    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::TurnOn => "turn_on",
            CommandKind::TurnOff => "turn_off",
            CommandKind::SetTemperature => "set_temperature",
            CommandKind::SetMode => "set_mode",
            CommandKind::StartCharge => "start_charge",
            CommandKind::StopCharge => "stop_charge",
            CommandKind::SetChargeLimit => "set_charge_limit",
            CommandKind::Other(s) => s,
        }
    }
}

impl From<String> for CommandKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "turn_on" => CommandKind::TurnOn,
            "turn_off" => CommandKind::TurnOff,
            "set_temperature" => CommandKind::SetTemperature,
            "set_mode" => CommandKind::SetMode,
            "start_charge" => CommandKind::StartCharge,
            "stop_charge" => CommandKind::StopCharge,
            "set_charge_limit" => CommandKind::SetChargeLimit,
            _ => CommandKind::Other(s),
        }
    }
}

impl From<&str> for CommandKind {
    fn from(s: &str) -> Self {
        CommandKind::from(s.to_string())
    }
}

impl From<CommandKind> for String {
    fn from(kind: CommandKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command fetched from the cloud. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCommand {
    #[serde(alias = "id")]
    pub command_id: String,
    #[serde(alias = "device_id")]
    pub target_cloud_id: String,
    #[serde(alias = "command_type")]
    pub command_kind: CommandKind,
    #[serde(default)]
    pub parameters: Value,
    pub issued_at: DateTime<Utc>,
}

impl CloudCommand {
    pub fn new(
        command_id: impl Into<String>,
        target_cloud_id: impl Into<String>,
        command_kind: impl Into<CommandKind>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            target_cloud_id: target_cloud_id.into(),
            command_kind: command_kind.into(),
            parameters: Value::Null,
            issued_at: Utc::now(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.parameters.is_object() {
            self.parameters = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.parameters {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Why a command ended in the Failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnmappedTarget,
    NoControlEntity,
    UnsupportedCommand,
    InvalidParameters,
    EntityUnavailable,
    DispatchFailed,
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnmappedTarget => "unmapped_target",
            FailureReason::NoControlEntity => "no_control_entity",
            FailureReason::UnsupportedCommand => "unsupported_command",
            FailureReason::InvalidParameters => "invalid_parameters",
            FailureReason::EntityUnavailable => "entity_unavailable",
            FailureReason::DispatchFailed => "dispatch_failed",
            FailureReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome reported to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Acknowledged,
    Failed,
}

/// Body of `POST /commands/{id}/ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: String,
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_state: Option<Value>,
    pub completed_at: DateTime<Utc>,
}

impl CommandAck {
    pub fn acknowledged(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Acknowledged,
            reason: None,
            message: None,
            device_state: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(command_id: impl Into<String>, reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: AckStatus::Failed,
            reason: Some(reason),
            message: Some(message.into()),
            device_state: None,
            completed_at: Utc::now(),
        }
    }

    pub fn with_device_state(mut self, state: Value) -> Self {
        self.device_state = Some(state);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Acknowledged
    }
}

/// Bearer credential for one site.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the access token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - margin <= now
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// On/off transition observed between two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventKind {
    PowerOn,
    PowerOff,
}

/// Body of `POST /events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    #[serde(rename = "device_id")]
    pub cloud_id: String,
    pub event_type: DeviceEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub power_w: Option<f64>,
}
