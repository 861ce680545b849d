//! Capability inference for host entities and unit normalization.

use kraftsync_core::model::entity_domain;
use kraftsync_core::Capability;

/// Decide what an entity measures or controls.
///
/// Returns `None` for entities that carry nothing the bridge forwards.
pub fn infer_capability(
    entity_id: &str,
    device_class: Option<&str>,
    unit: Option<&str>,
) -> Option<Capability> {
    let id = entity_id.to_ascii_lowercase();
    let device_class = device_class.map(str::to_ascii_lowercase);

    match entity_domain(&id) {
        "switch" | "input_boolean" | "light" => Some(Capability::OnOff),
        "water_heater" | "climate" | "select" => Some(Capability::Mode),
        "number" => {
            let is_current = unit.map(|u| u.trim() == "A").unwrap_or(false)
                || ["current", "limit", "amp"].iter().any(|k| id.contains(k));
            Some(if is_current {
                Capability::ChargeLimit
            } else {
                Capability::Other
            })
        }
        "button" => Some(Capability::Other),
        "binary_sensor" => match device_class.as_deref() {
            Some("power") | Some("plug") | Some("running") | Some("battery_charging") => {
                Some(Capability::OnOff)
            }
            _ if id.contains("charging") => Some(Capability::OnOff),
            _ => None,
        },
        "sensor" => {
            let class = device_class.or_else(|| class_from_unit(unit).map(String::from))?;
            sensor_capability(&id, &class)
        }
        _ => None,
    }
}

fn sensor_capability(id: &str, class: &str) -> Option<Capability> {
    let phase = phase_of(id);
    let cap = match class {
        "power" => match phase {
            Some(0) => Capability::PowerL1,
            Some(1) => Capability::PowerL2,
            Some(2) => Capability::PowerL3,
            _ => Capability::Power,
        },
        "energy" => {
            if id.contains("session") {
                Capability::SessionEnergy
            } else if ["today", "daily", "day"].iter().any(|k| has_token(id, k)) {
                Capability::EnergyToday
            } else if ["export", "returned", "produced", "production"]
                .iter()
                .any(|k| id.contains(k))
            {
                Capability::EnergyExport
            } else if ["import", "consumed", "consumption"]
                .iter()
                .any(|k| id.contains(k))
            {
                Capability::EnergyImport
            } else {
                Capability::Energy
            }
        }
        "voltage" => match phase {
            Some(1) => Capability::VoltageL2,
            Some(2) => Capability::VoltageL3,
            _ => Capability::VoltageL1,
        },
        "current" => match phase {
            Some(1) => Capability::CurrentL2,
            Some(2) => Capability::CurrentL3,
            _ => Capability::CurrentL1,
        },
        "temperature" => Capability::Temperature,
        _ => return None,
    };
    Some(cap)
}

fn class_from_unit(unit: Option<&str>) -> Option<&'static str> {
    match unit?.trim() {
        "W" | "kW" | "MW" => Some("power"),
        "Wh" | "kWh" | "MWh" => Some("energy"),
        "V" => Some("voltage"),
        "A" => Some("current"),
        "°C" | "°F" => Some("temperature"),
        _ => None,
    }
}

fn tokens(id: &str) -> impl Iterator<Item = &str> {
    id.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
}

fn has_token(id: &str, token: &str) -> bool {
    tokens(id).any(|t| t == token)
}

/// Phase index encoded in an entity id (`_l2`, `_phase_2`, `_phase2`, `_p2`).
pub fn phase_of(id: &str) -> Option<usize> {
    let toks: Vec<&str> = tokens(id).collect();
    for (i, t) in toks.iter().enumerate() {
        let idx = match *t {
            "l1" | "p1" | "phase1" => Some(0),
            "l2" | "p2" | "phase2" => Some(1),
            "l3" | "p3" | "phase3" => Some(2),
            "phase" => match toks.get(i + 1).copied() {
                Some("1") => Some(0),
                Some("2") => Some(1),
                Some("3") => Some(2),
                _ => None,
            },
            _ => None,
        };
        if idx.is_some() {
            return idx;
        }
    }
    None
}

/// Convert a raw reading to the canonical unit of its capability.
///
/// Power is reported in W, energy in kWh and temperature in °C.
pub fn normalize(value: f64, unit: Option<&str>, capability: Capability) -> f64 {
    let unit = unit.map(str::trim).unwrap_or("");
    match capability {
        Capability::Power | Capability::PowerL1 | Capability::PowerL2 | Capability::PowerL3 => {
            match unit {
                "kW" => value * 1_000.0,
                "MW" => value * 1_000_000.0,
                _ => value,
            }
        }
        Capability::Energy
        | Capability::EnergyImport
        | Capability::EnergyExport
        | Capability::EnergyToday
        | Capability::SessionEnergy => match unit {
            "Wh" => value / 1_000.0,
            "MWh" => value * 1_000.0,
            _ => value,
        },
        Capability::Temperature => match unit {
            "°F" => (value - 32.0) * 5.0 / 9.0,
            _ => value,
        },
        _ => value,
    }
}
