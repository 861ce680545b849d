//! Groups Home Assistant entity states into local devices.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use kraftsync_core::{Capability, EntitySnapshot, LocalDevice};

use super::entities::{HassDomain, HassEntityState, HassRegistryEntry};
use crate::capability::infer_capability;

/// Convert one entity state into a snapshot, or `None` when the entity
/// carries nothing relevant.
pub fn snapshot_from_state(state: &HassEntityState) -> Option<EntitySnapshot> {
    let attrs = &state.attributes;
    let capability = infer_capability(
        &state.entity_id,
        attrs.device_class.as_deref(),
        attrs.unit_of_measurement.as_deref(),
    )?;
    Some(build_snapshot(state, capability))
}

/// Like [`snapshot_from_state`] but keeps entities of unknown capability.
pub fn snapshot_any(state: &HassEntityState) -> EntitySnapshot {
    snapshot_from_state(state).unwrap_or_else(|| build_snapshot(state, Capability::Other))
}

fn build_snapshot(state: &HassEntityState, capability: Capability) -> EntitySnapshot {
    let attrs = &state.attributes;
    let mut snapshot = EntitySnapshot::new(state.entity_id.clone(), capability)
        .with_state(state.state.clone());
    snapshot.unit = attrs.unit_of_measurement.clone();
    for (k, v) in &attrs.extra {
        snapshot.attributes.insert(k.clone(), v.clone());
    }
    if let Some(class) = &attrs.device_class {
        snapshot = snapshot.with_attribute("device_class", class.clone());
    }
    if let Some(name) = &attrs.friendly_name {
        snapshot = snapshot.with_attribute("friendly_name", name.clone());
    }
    snapshot.updated_at = state
        .last_updated
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    snapshot
}

/// Group entity states by their registry device.
///
/// Entities without a registry device become single-entity devices keyed by
/// their sanitized entity id. Output is ordered by local id.
pub fn group_states(
    states: &[HassEntityState],
    registry: &HashMap<String, HassRegistryEntry>,
) -> Vec<LocalDevice> {
    let mut groups: BTreeMap<String, LocalDevice> = BTreeMap::new();

    for state in states {
        if !HassDomain::from_entity_id(&state.entity_id).is_relevant() {
            continue;
        }
        let Some(snapshot) = snapshot_from_state(state) else {
            continue;
        };

        let entry = registry.get(&state.entity_id);
        let local_id = match entry {
            Some(e) => sanitize_device_id(&e.device_id),
            None => sanitize_device_id(&state.entity_id),
        };

        let device = groups.entry(local_id.clone()).or_insert_with(|| {
            let name = entry
                .and_then(|e| e.name.clone())
                .or_else(|| state.attributes.friendly_name.clone())
                .unwrap_or_else(|| state.entity_id.clone());
            let mut device = LocalDevice::new(local_id, name);
            device.integration = entry.and_then(|e| e.integration.clone());
            device.manufacturer = entry.and_then(|e| e.manufacturer.clone());
            device.model = entry.and_then(|e| e.model.clone());
            device
        });
        device.entities.push(snapshot);
    }

    groups
        .into_values()
        .map(|mut device| {
            device.entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
            device.device_class = device_class_hint(&device.entities);
            device
        })
        .collect()
}

/// Pick the device-level class hint from its entities.
fn device_class_hint(entities: &[EntitySnapshot]) -> Option<String> {
    if entities.iter().any(|e| e.domain() == "water_heater") {
        return Some("water_heater".to_string());
    }
    let class_of = |e: &EntitySnapshot| {
        e.attributes
            .get("device_class")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    if entities
        .iter()
        .any(|e| e.domain() == "switch" && class_of(e).as_deref() == Some("outlet"))
    {
        return Some("outlet".to_string());
    }
    entities
        .iter()
        .filter(|e| e.domain() == "sensor")
        .filter_map(class_of)
        .find(|c| c == "energy" || c == "power")
}

/// Sanitize device ID for safe use.
fn sanitize_device_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
