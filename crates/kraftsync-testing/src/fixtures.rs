//! Ready-made local devices.

use kraftsync_core::{Capability, EntitySnapshot, LocalDevice};

/// Easee charger with a power sensor, an on/off switch and a current limit.
pub fn easee_charger(local_id: &str) -> LocalDevice {
    LocalDevice::new(local_id, "Easee Home")
        .with_integration("easee")
        .with_entity(
            EntitySnapshot::new(format!("sensor.{}_power", local_id), Capability::Power)
                .with_state("0")
                .with_unit("W"),
        )
        .with_entity(
            EntitySnapshot::new(format!("sensor.{}_session_energy", local_id), Capability::SessionEnergy)
                .with_state("0.0")
                .with_unit("kWh"),
        )
        .with_entity(
            EntitySnapshot::new(format!("switch.{}_charger", local_id), Capability::OnOff)
                .with_state("off"),
        )
        .with_entity(
            EntitySnapshot::new(format!("number.{}_current_limit", local_id), Capability::ChargeLimit)
                .with_state("16")
                .with_unit("A"),
        )
}

/// AMS/HAN meter with total power, cumulative energy and per-phase readings.
pub fn ams_meter(local_id: &str, energy_kwh: f64) -> LocalDevice {
    LocalDevice::new(local_id, "AMS Meter")
        .with_integration("amshan")
        .with_entity(
            EntitySnapshot::new(format!("sensor.{}_power", local_id), Capability::Power)
                .with_state("1450")
                .with_unit("W"),
        )
        .with_entity(
            EntitySnapshot::new(format!("sensor.{}_energy", local_id), Capability::Energy)
                .with_state(energy_kwh.to_string())
                .with_unit("kWh"),
        )
        .with_entity(
            EntitySnapshot::new(format!("sensor.{}_voltage_l1", local_id), Capability::VoltageL1)
                .with_state("231.2")
                .with_unit("V"),
        )
        .with_entity(
            EntitySnapshot::new(format!("sensor.{}_current_l1", local_id), Capability::CurrentL1)
                .with_state("6.3")
                .with_unit("A"),
        )
}

/// Water heater of unknown brand, recognisable only by its Norwegian name.
pub fn water_heater(local_id: &str) -> LocalDevice {
    LocalDevice::new(local_id, "Varmtvannsbereder Kjeller")
        .with_entity(
            EntitySnapshot::new(format!("water_heater.{}", local_id), Capability::Mode)
                .with_state("eco")
                .with_attribute("current_temperature", 61.0)
                .with_attribute("temperature", 65.0),
        )
        .with_entity(
            EntitySnapshot::new(format!("sensor.{}_power", local_id), Capability::Power)
                .with_state("2000")
                .with_unit("W"),
        )
}

/// Device nothing classifies.
pub fn kitchen_lamp(local_id: &str) -> LocalDevice {
    LocalDevice::new(local_id, "Kitchen lamp")
        .with_integration("hue")
        .with_entity(EntitySnapshot::new(format!("light.{}", local_id), Capability::OnOff).with_state("on"))
}
