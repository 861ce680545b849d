use std::sync::Arc;

use kraftsync_core::{
    Capability, DeviceRole, EntitySnapshot, HostPlatform, LocalDevice, MappingEntry, TelemetrySource,
};
use kraftsync_devices::{Classifier, ConfidenceTier, EntitySource};
use kraftsync_testing::fixtures::{ams_meter, easee_charger, kitchen_lamp, water_heater};
use kraftsync_testing::MemoryHost;

fn entry_for(device: &LocalDevice, role: DeviceRole) -> MappingEntry {
    MappingEntry {
        local_id: device.local_id.clone(),
        cloud_id: format!("cloud-{}", device.local_id),
        role,
        name: device.name.clone(),
        last_synced_at: None,
        child_entities: device.child_entities(),
    }
}

#[test]
fn test_fixture_classification() {
    let classifier = Classifier::new();

    let charger = classifier.classify(&easee_charger("easee_1"));
    assert_eq!(charger.role, DeviceRole::EvCharger);
    assert_eq!(charger.tier, Some(ConfidenceTier::Domain));

    let heater = classifier.classify(&water_heater("dev_42"));
    assert_eq!(heater.role, DeviceRole::WaterHeater);
    assert_eq!(heater.tier.map(|t| t.number()), Some(3));

    assert_eq!(classifier.classify(&ams_meter("m", 1.0)).role, DeviceRole::PowerMeter);
    assert_eq!(classifier.classify(&kitchen_lamp("lamp")).role, DeviceRole::Unknown);
}

#[tokio::test]
async fn test_samples_follow_host_state() {
    let meter = ams_meter("meter", 1234.5);
    let entry = entry_for(&meter, DeviceRole::PowerMeter);
    let host = Arc::new(MemoryHost::new(vec![meter]));
    let source = EntitySource::new(host.clone());

    let sample = source.sample(&entry).await.unwrap();
    assert_eq!(sample.cloud_id, "cloud-meter");
    assert_eq!(sample.power_w, Some(1450.0));
    assert_eq!(sample.energy_total_kwh, Some(1234.5));
    assert_eq!(sample.current_by_phase.l1, Some(6.3));
    assert!(sample.available);

    host.set_state("sensor.meter_power", "2100");
    let sample = source.sample(&entry).await.unwrap();
    assert_eq!(sample.power_w, Some(2100.0));
}

#[tokio::test]
async fn test_units_are_normalized() {
    let meter = LocalDevice::new("han", "HAN port")
        .with_integration("amshan")
        .with_entity(
            EntitySnapshot::new("sensor.han_power", Capability::Power)
                .with_state("2.5")
                .with_unit("kW"),
        )
        .with_entity(
            EntitySnapshot::new("sensor.han_energy", Capability::Energy)
                .with_state("12500")
                .with_unit("Wh"),
        );
    let entry = entry_for(&meter, DeviceRole::PowerMeter);
    let host = Arc::new(MemoryHost::new(vec![meter]));

    let sample = EntitySource::new(host).sample(&entry).await.unwrap();
    assert_eq!(sample.power_w, Some(2500.0));
    assert_eq!(sample.energy_total_kwh, Some(12.5));
}

#[tokio::test]
async fn test_charger_sample_reads_switch_and_limit() {
    let charger = easee_charger("easee_1");
    let entry = entry_for(&charger, DeviceRole::EvCharger);
    let host = Arc::new(MemoryHost::new(vec![charger]));
    let source = EntitySource::new(host.clone());

    let sample = source.sample(&entry).await.unwrap();
    assert_eq!(sample.is_on, Some(false));
    assert_eq!(sample.charge_limit_a, Some(16.0));

    host.set_state("switch.easee_1_charger", "on");
    host.set_state("sensor.easee_1_session_energy", "4.2");
    let sample = source.sample(&entry).await.unwrap();
    assert_eq!(sample.is_on, Some(true));
    assert_eq!(sample.session_energy_kwh, Some(4.2));
}

#[tokio::test]
async fn test_unavailable_device() {
    let heater = water_heater("vvb");
    let entry = entry_for(&heater, DeviceRole::WaterHeater);
    let host = Arc::new(MemoryHost::new(vec![heater]));
    host.set_state("water_heater.vvb", "unavailable");
    host.set_state("sensor.vvb_power", "unknown");

    let sample = EntitySource::new(host.clone()).sample(&entry).await.unwrap();
    assert!(!sample.available);
    assert!(sample.power_w.is_none());

    // the host reports every entity even when unavailable
    let ids: Vec<String> = entry.child_entities.iter().map(|c| c.entity_id.clone()).collect();
    assert_eq!(host.read_entities(&ids).await.unwrap().len(), 2);
}
