//! The simulation exposed through the host and telemetry-source seams.
//!
//! [`SimulatedHost`] presents the virtual devices as ordinary local devices,
//! so they pass through classification and mapping like real hardware.
//! [`SimulatedSource`] produces their samples. Both share one engine, which
//! is advanced to wall-clock time on every access.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use kraftsync_core::config::SimulationSection;
use kraftsync_core::{
    Capability, EntitySnapshot, Error, HostAction, HostPlatform, LocalDevice, MappingEntry, Result,
    SourceKind, TelemetrySample, TelemetrySource,
};

use crate::engine::{SimulationEngine, EV_CHARGER_ID, METER_ID, WATER_HEATER_ID};
use crate::models::WaterHeaterMode;

pub type SharedEngine = Arc<Mutex<SimulationEngine>>;

pub const INTEGRATION: &str = "kraftsync_sim";

/// Engine starting now, shared between host and source.
pub fn shared_engine(settings: &SimulationSection) -> SharedEngine {
    Arc::new(Mutex::new(SimulationEngine::new(settings, Utc::now())))
}

fn numeric(id: String, capability: Capability, value: f64, unit: &str) -> EntitySnapshot {
    EntitySnapshot::new(id, capability)
        .with_state(value.to_string())
        .with_unit(unit)
}

fn or_zero(value: Option<f64>) -> f64 {
    value.unwrap_or(0.0)
}

/// Local device descriptors for the engine's current state.
pub fn simulated_devices(engine: &SimulationEngine) -> Vec<LocalDevice> {
    let frame = engine.frame();
    let now = frame.timestamp;

    let m = &frame.meter;
    let mut meter = LocalDevice::new(METER_ID, "Simulert strømmåler")
        .with_integration(INTEGRATION)
        .with_device_class("energy")
        .with_entity(numeric(format!("sensor.{}_power", METER_ID), Capability::Power, or_zero(m.power_w), "W"))
        .with_entity(numeric(
            format!("sensor.{}_energy", METER_ID),
            Capability::Energy,
            or_zero(m.energy_total_kwh),
            "kWh",
        ))
        .with_entity(numeric(
            format!("sensor.{}_energy_today", METER_ID),
            Capability::EnergyToday,
            or_zero(m.energy_today_kwh),
            "kWh",
        ));
    let phases = [
        (m.voltage_by_phase.l1, m.current_by_phase.l1, Capability::VoltageL1, Capability::CurrentL1),
        (m.voltage_by_phase.l2, m.current_by_phase.l2, Capability::VoltageL2, Capability::CurrentL2),
        (m.voltage_by_phase.l3, m.current_by_phase.l3, Capability::VoltageL3, Capability::CurrentL3),
    ];
    for (n, (voltage, current, vcap, ccap)) in phases.into_iter().enumerate() {
        meter = meter
            .with_entity(numeric(format!("sensor.{}_voltage_l{}", METER_ID, n + 1), vcap, or_zero(voltage), "V"))
            .with_entity(numeric(format!("sensor.{}_current_l{}", METER_ID, n + 1), ccap, or_zero(current), "A"));
    }

    let heater = &engine.water_heater;
    let w = &frame.water_heater;
    let water_heater = LocalDevice::new(WATER_HEATER_ID, "Simulert varmtvannsbereder")
        .with_integration(INTEGRATION)
        .with_device_class("water_heater")
        .with_entity(
            EntitySnapshot::new(format!("water_heater.{}", WATER_HEATER_ID), Capability::Mode)
                .with_state(heater.mode.operation_mode())
                .with_unit("°C")
                .with_attribute("current_temperature", or_zero(w.temperature_c))
                .with_attribute("temperature", heater.target_c),
        )
        .with_entity(numeric(
            format!("sensor.{}_power", WATER_HEATER_ID),
            Capability::Power,
            or_zero(w.power_w),
            "W",
        ))
        .with_entity(numeric(
            format!("sensor.{}_energy", WATER_HEATER_ID),
            Capability::Energy,
            or_zero(w.energy_total_kwh),
            "kWh",
        ));

    let charger = &engine.ev_charger;
    let c = &frame.ev_charger;
    let ev_charger = LocalDevice::new(EV_CHARGER_ID, "Simulert elbillader")
        .with_integration(INTEGRATION)
        .with_device_class("ev_charger")
        .with_entity(
            EntitySnapshot::new(format!("switch.{}", EV_CHARGER_ID), Capability::OnOff)
                .with_state(if c.is_on == Some(true) { "on" } else { "off" })
                .with_attribute("status", charger.status().as_str())
                .with_attribute("soc", charger.soc_percent.round()),
        )
        .with_entity(numeric(
            format!("number.{}_current_limit", EV_CHARGER_ID),
            Capability::ChargeLimit,
            charger.current_limit_a,
            "A",
        ))
        .with_entity(numeric(format!("sensor.{}_power", EV_CHARGER_ID), Capability::Power, or_zero(c.power_w), "W"))
        .with_entity(numeric(
            format!("sensor.{}_energy", EV_CHARGER_ID),
            Capability::Energy,
            or_zero(c.energy_total_kwh),
            "kWh",
        ))
        .with_entity(numeric(
            format!("sensor.{}_session_energy", EV_CHARGER_ID),
            Capability::SessionEnergy,
            or_zero(c.session_energy_kwh),
            "kWh",
        ));

    let mut devices = vec![meter, water_heater, ev_charger];
    for device in &mut devices {
        for entity in &mut device.entities {
            entity.updated_at = Some(now);
        }
    }
    devices
}

fn number_param(action: &HostAction, key: &str) -> Result<f64> {
    action
        .data
        .get(key)
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| Error::Validation(format!("{} requires numeric '{}'", action.service, key)))
}

/// Apply a host action to the engine.
pub fn apply_action(engine: &mut SimulationEngine, action: &HostAction) -> Result<()> {
    let water_heater = format!("water_heater.{}", WATER_HEATER_ID);
    let switch = format!("switch.{}", EV_CHARGER_ID);
    let limit = format!("number.{}_current_limit", EV_CHARGER_ID);

    let entity = action.entity_id.as_str();
    match action.service.as_str() {
        "turn_on" if entity == water_heater => {
            if engine.water_heater.mode == WaterHeaterMode::Off {
                engine.set_water_heater_mode(WaterHeaterMode::Normal);
            }
        }
        "turn_off" if entity == water_heater => engine.set_water_heater_mode(WaterHeaterMode::Off),
        "set_temperature" if entity == water_heater => {
            engine.set_water_heater_target(number_param(action, "temperature")?);
        }
        "set_operation_mode" if entity == water_heater => {
            let requested = action
                .data
                .get("operation_mode")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mode = WaterHeaterMode::parse(requested)
                .ok_or_else(|| Error::Validation(format!("unknown operation mode '{}'", requested)))?;
            engine.set_water_heater_mode(mode);
        }
        "turn_on" if entity == switch => {
            if !engine.start_charging() {
                return Err(Error::Host("no vehicle connected".into()));
            }
        }
        "turn_off" if entity == switch => engine.stop_charging(),
        "set_value" if entity == limit => engine.set_charge_limit(number_param(action, "value")?),
        _ => {
            return Err(Error::EntityUnavailable(format!(
                "{} does not support {}.{}",
                entity, action.domain, action.service
            )))
        }
    }
    debug!(entity_id = entity, service = %action.service, "Simulation action applied");
    Ok(())
}

/// Host platform backed by the simulation engine.
pub struct SimulatedHost {
    engine: SharedEngine,
}

impl SimulatedHost {
    pub fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }
}

#[async_trait]
impl HostPlatform for SimulatedHost {
    fn name(&self) -> &str {
        "simulation"
    }

    async fn discover(&self) -> Result<Vec<LocalDevice>> {
        let mut engine = self.engine.lock();
        engine.advance_to(Utc::now());
        Ok(simulated_devices(&engine))
    }

    async fn read_entities(&self, entity_ids: &[String]) -> Result<Vec<EntitySnapshot>> {
        let mut engine = self.engine.lock();
        engine.advance_to(Utc::now());
        Ok(simulated_devices(&engine)
            .into_iter()
            .flat_map(|d| d.entities)
            .filter(|e| entity_ids.contains(&e.entity_id))
            .collect())
    }

    async fn invoke(&self, action: &HostAction) -> Result<()> {
        let mut engine = self.engine.lock();
        engine.advance_to(Utc::now());
        apply_action(&mut engine, action)
    }
}

/// Telemetry source reading the engine directly.
pub struct SimulatedSource {
    engine: SharedEngine,
}

impl SimulatedSource {
    pub fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl TelemetrySource for SimulatedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Simulation
    }

    async fn sample(&self, entry: &MappingEntry) -> Result<TelemetrySample> {
        let mut engine = self.engine.lock();
        engine.advance_to(Utc::now());
        let mut sample = engine
            .reading(&entry.local_id)
            .ok_or_else(|| Error::Validation(format!("no simulated device '{}'", entry.local_id)))?;
        sample.cloud_id = entry.cloud_id.clone();
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kraftsync_core::EntityKind;

    #[test]
    fn test_devices_expose_controls_and_sensors() {
        let engine = SimulationEngine::new(&SimulationSection::default(), Utc::now());
        let devices = simulated_devices(&engine);
        assert_eq!(devices.len(), 3);

        let charger = devices.iter().find(|d| d.local_id == EV_CHARGER_ID).unwrap();
        let switch = charger.entity("switch.sim_ev_charger").unwrap();
        assert_eq!(switch.kind, EntityKind::Control);
        assert_eq!(switch.state.as_deref(), Some("off"));
        let power = charger.entity("sensor.sim_ev_charger_power").unwrap();
        assert_eq!(power.kind, EntityKind::Sensor);

        let meter = devices.iter().find(|d| d.local_id == METER_ID).unwrap();
        assert_eq!(meter.entities.len(), 9);
    }

    #[test]
    fn test_actions_drive_engine() {
        let mut engine = SimulationEngine::new(&SimulationSection::default(), Utc::now());

        apply_action(
            &mut engine,
            &HostAction::new("water_heater", "set_operation_mode", "water_heater.sim_water_heater")
                .with_param("operation_mode", "eco"),
        )
        .unwrap();
        assert_eq!(engine.water_heater.mode, WaterHeaterMode::Eco);

        apply_action(
            &mut engine,
            &HostAction::new("number", "set_value", "number.sim_ev_charger_current_limit")
                .with_param("value", 10),
        )
        .unwrap();
        assert_eq!(engine.ev_charger.current_limit_a, 10.0);

        apply_action(&mut engine, &HostAction::new("switch", "turn_on", "switch.sim_ev_charger")).unwrap();
        assert!(engine.ev_charger.enabled);
    }

    #[test]
    fn test_charging_without_vehicle_fails() {
        let mut engine = SimulationEngine::new(&SimulationSection::default(), Utc::now());
        engine.disconnect_ev();
        let err = apply_action(&mut engine, &HostAction::new("switch", "turn_on", "switch.sim_ev_charger"))
            .unwrap_err();
        assert!(matches!(err, Error::Host(_)));
    }

    #[test]
    fn test_sensor_actions_are_refused() {
        let mut engine = SimulationEngine::new(&SimulationSection::default(), Utc::now());
        let err = apply_action(
            &mut engine,
            &HostAction::new("sensor", "turn_on", "sensor.sim_ev_charger_power"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::EntityUnavailable(_)));
    }
}
