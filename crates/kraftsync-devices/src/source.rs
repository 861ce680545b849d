//! Telemetry source reading live entity states from the host platform.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kraftsync_core::{
    Capability, DynHost, EntitySnapshot, MappingEntry, Result, SourceKind, TelemetrySample,
    TelemetrySource,
};

use crate::capability::normalize;

/// Samples mapped devices by reading their child entities from the host.
pub struct EntitySource {
    host: DynHost,
}

impl EntitySource {
    pub fn new(host: DynHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl TelemetrySource for EntitySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Host
    }

    async fn sample(&self, entry: &MappingEntry) -> Result<TelemetrySample> {
        let ids: Vec<String> = entry
            .child_entities
            .iter()
            .map(|c| c.entity_id.clone())
            .collect();
        let snapshots = self.host.read_entities(&ids).await?;
        Ok(build_sample(entry, &snapshots, Utc::now()))
    }
}

/// Assemble a sample from entity snapshots, normalizing units.
///
/// Unavailable entities are skipped. The sample is marked unavailable when
/// none of the entry's entities reported a usable state.
pub fn build_sample(
    entry: &MappingEntry,
    snapshots: &[EntitySnapshot],
    now: DateTime<Utc>,
) -> TelemetrySample {
    let by_id: HashMap<&str, &EntitySnapshot> = snapshots
        .iter()
        .map(|s| (s.entity_id.as_str(), s))
        .collect();
    let mut sample = TelemetrySample::new(&entry.local_id, &entry.cloud_id, now);
    let mut phase_power = kraftsync_core::PhaseValues::default();
    let mut any_available = false;
    // an import counter stands in only on devices without a total counter,
    // so the reported counter never changes source between samples
    let has_total = entry
        .child_entities
        .iter()
        .any(|c| c.capability == Capability::Energy);

    for child in &entry.child_entities {
        let Some(snapshot) = by_id.get(child.entity_id.as_str()) else {
            continue;
        };
        if !snapshot.is_available() {
            continue;
        }
        any_available = true;

        let unit = snapshot.unit.as_deref();
        let value = snapshot
            .numeric()
            .map(|v| normalize(v, unit, child.capability));

        match child.capability {
            Capability::Power => {
                if let Some(v) = value {
                    sample.power_w.get_or_insert(v);
                }
            }
            Capability::PowerL1 | Capability::PowerL2 | Capability::PowerL3 => {
                if let (Some(v), Some(phase)) = (value, child.capability.phase()) {
                    phase_power.set(phase, v);
                }
            }
            Capability::Energy => sample.energy_total_kwh = value.or(sample.energy_total_kwh),
            Capability::EnergyImport if !has_total => {
                sample.energy_total_kwh = value.or(sample.energy_total_kwh)
            }
            Capability::EnergyImport => {}
            Capability::EnergyExport => sample.energy_export_kwh = value.or(sample.energy_export_kwh),
            Capability::EnergyToday => sample.energy_today_kwh = value.or(sample.energy_today_kwh),
            Capability::VoltageL1 | Capability::VoltageL2 | Capability::VoltageL3 => {
                if let (Some(v), Some(phase)) = (value, child.capability.phase()) {
                    sample.voltage_by_phase.set(phase, v);
                }
            }
            Capability::CurrentL1 | Capability::CurrentL2 | Capability::CurrentL3 => {
                if let (Some(v), Some(phase)) = (value, child.capability.phase()) {
                    sample.current_by_phase.set(phase, v);
                }
            }
            Capability::Temperature => sample.temperature_c = value.or(sample.temperature_c),
            Capability::SessionEnergy => {
                sample.session_energy_kwh = value.or(sample.session_energy_kwh)
            }
            Capability::ChargeLimit => sample.charge_limit_a = value.or(sample.charge_limit_a),
            Capability::OnOff => {
                if let Some(on) = snapshot.as_bool() {
                    sample.is_on = Some(on);
                }
            }
            Capability::Mode => apply_mode_entity(&mut sample, snapshot),
            Capability::Other => {}
        }
    }

    if sample.power_w.is_none() {
        sample.power_w = phase_power.sum();
    }
    sample.available = any_available || entry.child_entities.is_empty();
    sample
}

/// Thermostat-like entities carry temperatures as attributes.
fn apply_mode_entity(sample: &mut TelemetrySample, snapshot: &EntitySnapshot) {
    if matches!(snapshot.domain(), "water_heater" | "climate") {
        if let Some(current) = snapshot.attr_f64("current_temperature") {
            sample.temperature_c.get_or_insert(current);
        }
        if let Some(target) = snapshot.attr_f64("temperature") {
            sample.target_temperature_c.get_or_insert(target);
        }
        if sample.is_on.is_none() {
            sample.is_on = snapshot.state.as_deref().map(|s| s != "off");
        }
    }
}
