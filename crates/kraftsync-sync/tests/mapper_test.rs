use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kraftsync_cloud::DynCloud;
use kraftsync_core::{Capability, DeviceRole, EntitySnapshot, HostPlatform};
use kraftsync_devices::Classifier;
use kraftsync_sync::{cloud_id_for, DeviceMapper, MapperOptions};
use kraftsync_testing::fixtures::{ams_meter, easee_charger, kitchen_lamp, water_heater};
use kraftsync_testing::{FakeCloud, MemoryHost};

async fn mapper(cloud: &Arc<FakeCloud>, grace_cycles: u32, selection: Vec<String>) -> DeviceMapper {
    let api: DynCloud = cloud.authed().await;
    DeviceMapper::new(
        MapperOptions {
            site_id: "test-site".into(),
            grace_cycles,
            selection,
        },
        Classifier::new(),
        api,
    )
}

#[tokio::test]
async fn test_new_devices_are_mapped_and_upserted() {
    let cloud = Arc::new(FakeCloud::new());
    let mapper = mapper(&cloud, 3, Vec::new()).await;
    let devices = vec![
        easee_charger("easee_1"),
        ams_meter("meter", 1000.0),
        water_heater("vvb"),
        kitchen_lamp("lamp"),
    ];

    let diff = mapper.reconcile(&devices).await;
    assert_eq!(diff.created.len(), 3);
    mapper.flush().await;

    let snapshot = mapper.snapshot();
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.get("lamp").is_none());
    assert_eq!(snapshot.get("vvb").unwrap().role, DeviceRole::WaterHeater);
    assert_eq!(
        snapshot.get("easee_1").unwrap().cloud_id,
        cloud_id_for("test-site", "easee_1")
    );

    let cloud_ids: HashSet<_> = snapshot.entries().map(|e| e.cloud_id.clone()).collect();
    assert_eq!(cloud_ids.len(), 3);
    assert_eq!(cloud.upserts().len(), 3);
    assert!(snapshot.entries().all(|e| e.last_synced_at.is_some()));

    // unchanged scan sends nothing
    let diff = mapper.reconcile(&devices).await;
    mapper.flush().await;
    assert!(diff.is_empty());
    assert_eq!(cloud.upserts().len(), 3);
}

#[tokio::test]
async fn test_changed_children_are_repushed() {
    let cloud = Arc::new(FakeCloud::new());
    let mapper = mapper(&cloud, 3, Vec::new()).await;
    let host = MemoryHost::new(vec![ams_meter("meter", 1000.0)]);
    mapper.reconcile(&host.discover().await.unwrap()).await;
    mapper.flush().await;

    host.add_entity(
        "meter",
        EntitySnapshot::new("sensor.meter_current_l2", Capability::CurrentL2).with_state("4.1"),
    );
    let diff = mapper.reconcile(&host.discover().await.unwrap()).await;
    mapper.flush().await;

    assert_eq!(diff.updated, vec!["meter".to_string()]);
    let upserts = cloud.upserts();
    assert_eq!(upserts.len(), 2);
    assert!(upserts[1].capabilities.contains(&Capability::CurrentL2));
    let entry = mapper.snapshot().get("meter").cloned().unwrap();
    assert!(entry.entity_for(Capability::CurrentL2).is_some());
}

#[tokio::test]
async fn test_vanished_device_removed_after_grace() {
    let cloud = Arc::new(FakeCloud::new());
    let mapper = mapper(&cloud, 2, Vec::new()).await;
    mapper.reconcile(&[easee_charger("easee_1")]).await;
    mapper.flush().await;
    let cloud_id = cloud_id_for("test-site", "easee_1");

    for _ in 0..2 {
        let diff = mapper.reconcile(&[]).await;
        assert_eq!(diff.missing, vec!["easee_1".to_string()]);
        assert!(mapper.snapshot().get("easee_1").is_some());
    }
    let diff = mapper.reconcile(&[]).await;
    mapper.flush().await;
    assert_eq!(diff.removed, vec!["easee_1".to_string()]);
    assert!(mapper.snapshot().is_empty());
    assert_eq!(cloud.removals(), vec![cloud_id]);
}

#[tokio::test]
async fn test_failed_removal_is_retried_until_it_succeeds() {
    let cloud = Arc::new(FakeCloud::new());
    let mapper = mapper(&cloud, 0, Vec::new()).await;
    mapper.reconcile(&[easee_charger("easee_1")]).await;
    mapper.flush().await;
    let cloud_id = cloud_id_for("test-site", "easee_1");

    for _ in 0..2 {
        cloud.fail_next(
            "remove_device",
            kraftsync_core::Error::Rejected {
                status: 400,
                message: "bad".into(),
            },
        );
    }
    let diff = mapper.reconcile(&[]).await;
    mapper.flush().await;
    assert_eq!(diff.removed, vec!["easee_1".to_string()]);
    assert!(cloud.removals().is_empty());
    assert!(mapper.unsynced().await.contains_key(&cloud_id));

    mapper.reconcile(&[]).await;
    mapper.flush().await;
    assert!(cloud.removals().is_empty());

    mapper.reconcile(&[]).await;
    mapper.flush().await;
    assert_eq!(cloud.removals(), vec![cloud_id.clone()]);
    assert!(mapper.unsynced().await.is_empty());

    // nothing left to resend
    mapper.reconcile(&[]).await;
    mapper.flush().await;
    assert_eq!(cloud.removals().len(), 1);
}

#[tokio::test]
async fn test_reappearing_device_cancels_pending_removal() {
    let cloud = Arc::new(FakeCloud::new());
    let mapper = mapper(&cloud, 0, Vec::new()).await;
    let devices = [easee_charger("easee_1")];
    mapper.reconcile(&devices).await;
    mapper.flush().await;

    cloud.fail_next(
        "remove_device",
        kraftsync_core::Error::Rejected {
            status: 400,
            message: "bad".into(),
        },
    );
    mapper.reconcile(&[]).await;
    mapper.flush().await;

    let diff = mapper.reconcile(&devices).await;
    mapper.flush().await;
    assert_eq!(diff.created, vec!["easee_1".to_string()]);
    mapper.reconcile(&devices).await;
    mapper.flush().await;
    assert!(cloud.removals().is_empty());
    assert!(mapper.unsynced().await.is_empty());
}

#[tokio::test]
async fn test_reappearing_device_resets_grace() {
    let cloud = Arc::new(FakeCloud::new());
    let mapper = mapper(&cloud, 1, Vec::new()).await;
    let devices = [easee_charger("easee_1")];
    mapper.reconcile(&devices).await;

    mapper.reconcile(&[]).await;
    mapper.reconcile(&devices).await;
    mapper.reconcile(&[]).await;
    mapper.flush().await;

    assert!(mapper.snapshot().get("easee_1").is_some());
    assert!(cloud.removals().is_empty());
}

#[tokio::test]
async fn test_one_request_in_flight_per_cloud_id() {
    let cloud = Arc::new(FakeCloud::new());
    cloud.set_upsert_delay(Duration::from_millis(50));
    let mapper = mapper(&cloud, 3, Vec::new()).await;
    let host = MemoryHost::new(vec![ams_meter("meter", 1000.0)]);

    let first = host.discover().await.unwrap();
    let (a, b) = tokio::join!(mapper.reconcile(&first), mapper.reconcile(&first));
    assert_eq!(a.created.len() + b.created.len(), 1);

    host.add_entity(
        "meter",
        EntitySnapshot::new("sensor.meter_voltage_l2", Capability::VoltageL2).with_state("230"),
    );
    mapper.reconcile(&host.discover().await.unwrap()).await;
    host.add_entity(
        "meter",
        EntitySnapshot::new("sensor.meter_voltage_l3", Capability::VoltageL3).with_state("230"),
    );
    mapper.reconcile(&host.discover().await.unwrap()).await;
    mapper.flush().await;

    let cloud_id = cloud_id_for("test-site", "meter");
    assert_eq!(cloud.max_upserts_in_flight(&cloud_id), 1);
    let upserts = cloud.upserts();
    // the second change replaced the first queued follow-up
    assert_eq!(upserts.len(), 2);
    assert!(upserts[1].capabilities.contains(&Capability::VoltageL3));
    assert_eq!(mapper.in_flight(), 0);
}

#[tokio::test]
async fn test_failed_upsert_is_resent_on_next_pass() {
    let cloud = Arc::new(FakeCloud::new());
    cloud.fail_next(
        "upsert_device",
        kraftsync_core::Error::Rejected {
            status: 400,
            message: "bad".into(),
        },
    );
    let mapper = mapper(&cloud, 3, Vec::new()).await;
    let devices = [water_heater("vvb")];
    mapper.reconcile(&devices).await;
    mapper.flush().await;
    assert_eq!(mapper.unsynced().await.len(), 1);
    assert!(cloud.upserts().is_empty());

    let diff = mapper.reconcile(&devices).await;
    mapper.flush().await;
    assert_eq!(diff.resent, vec!["vvb".to_string()]);
    assert_eq!(cloud.upserts().len(), 1);
    assert!(mapper.unsynced().await.is_empty());
}

#[tokio::test]
async fn test_selection_filter() {
    let cloud = Arc::new(FakeCloud::new());
    let mapper = mapper(&cloud, 3, vec!["switch.easee_1_charger".into(), "vvb".into()]).await;
    let diff = mapper
        .reconcile(&[
            easee_charger("easee_1"),
            ams_meter("meter", 1.0),
            water_heater("vvb"),
        ])
        .await;
    let mut created = diff.created.clone();
    created.sort();
    assert_eq!(created, vec!["easee_1".to_string(), "vvb".to_string()]);
}

#[tokio::test]
async fn test_mark_all_unsynced_resends_everything() {
    let cloud = Arc::new(FakeCloud::new());
    let mapper = mapper(&cloud, 3, Vec::new()).await;
    let devices = [easee_charger("easee_1"), water_heater("vvb")];
    mapper.reconcile(&devices).await;
    mapper.flush().await;

    mapper.mark_all_unsynced().await;
    let diff = mapper.reconcile(&devices).await;
    mapper.flush().await;
    assert_eq!(diff.resent.len(), 2);
    assert_eq!(cloud.upserts().len(), 4);
}
