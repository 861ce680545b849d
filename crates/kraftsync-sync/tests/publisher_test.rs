use std::sync::Arc;

use kraftsync_cloud::DynCloud;
use kraftsync_core::{DeviceEventKind, DynSource, HostPlatform};
use kraftsync_devices::{Classifier, EntitySource};
use kraftsync_sync::{DeviceMapper, MapperOptions, PublisherOptions, TelemetryPublisher};
use kraftsync_testing::fixtures::{ams_meter, easee_charger, water_heater};
use kraftsync_testing::{FakeCloud, MemoryHost};

struct Harness {
    host: Arc<MemoryHost>,
    cloud: Arc<FakeCloud>,
    mapper: DeviceMapper,
    publisher: TelemetryPublisher,
}

impl Harness {
    async fn new(devices: Vec<kraftsync_core::LocalDevice>, options: PublisherOptions) -> Self {
        let host = Arc::new(MemoryHost::new(devices));
        let cloud = Arc::new(FakeCloud::new());
        let api: DynCloud = cloud.authed().await;
        let mapper = DeviceMapper::new(
            MapperOptions {
                site_id: "test-site".into(),
                grace_cycles: 3,
                selection: Vec::new(),
            },
            Classifier::new(),
            api.clone(),
        );
        mapper.reconcile(&host.discover().await.unwrap()).await;
        mapper.flush().await;

        let source: DynSource = Arc::new(EntitySource::new(host.clone()));
        let publisher = TelemetryPublisher::new(api, source, mapper.subscribe(), options);
        Self {
            host,
            cloud,
            mapper,
            publisher,
        }
    }

    fn cloud_id(&self, local_id: &str) -> String {
        self.mapper.snapshot().get(local_id).unwrap().cloud_id.clone()
    }
}

#[tokio::test]
async fn test_cycle_pushes_one_batch() {
    let h = Harness::new(
        vec![ams_meter("meter", 1000.0), easee_charger("easee_1")],
        PublisherOptions::default(),
    )
    .await;

    let report = h.publisher.publish_cycle().await.unwrap();
    assert_eq!(report.sampled, 2);
    assert_eq!(report.pushed, 2);

    let batches = h.cloud.batches();
    assert_eq!(batches.len(), 1);
    let meter = batches[0]
        .iter()
        .find(|s| s.local_id == "meter")
        .unwrap();
    assert_eq!(meter.cloud_id, h.cloud_id("meter"));
    assert_eq!(meter.power_w, Some(1450.0));
    assert_eq!(meter.energy_total_kwh, Some(1000.0));
    assert_eq!(meter.voltage_by_phase.l1, Some(231.2));
    assert!(!meter.energy_reset);
}

#[tokio::test]
async fn test_batches_are_chunked() {
    let options = PublisherOptions {
        max_batch: 1,
        ..PublisherOptions::default()
    };
    let h = Harness::new(vec![ams_meter("meter", 1.0), water_heater("vvb")], options).await;
    h.publisher.publish_cycle().await.unwrap();
    assert_eq!(h.cloud.batches().len(), 2);
}

#[tokio::test]
async fn test_falls_back_to_per_device_push() {
    let h = Harness::new(
        vec![ams_meter("meter", 1000.0), easee_charger("easee_1")],
        PublisherOptions::default(),
    )
    .await;
    h.cloud.disable_batch();

    let report = h.publisher.publish_cycle().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert!(h.cloud.batches().is_empty());
    assert_eq!(h.cloud.single_pushes().len(), 2);
    assert!(!h.publisher.stats().batch_supported);

    h.publisher.publish_cycle().await.unwrap();
    assert_eq!(h.cloud.single_pushes().len(), 4);
}

#[tokio::test]
async fn test_partial_rejection_is_attributed_per_device() {
    let h = Harness::new(
        vec![ams_meter("meter", 1000.0), easee_charger("easee_1")],
        PublisherOptions::default(),
    )
    .await;
    h.cloud.reject_device(&h.cloud_id("meter"));

    let report = h.publisher.publish_cycle().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.failed, vec!["meter".to_string()]);
}

#[tokio::test]
async fn test_counter_decrease_is_flagged_until_delivered() {
    let h = Harness::new(vec![ams_meter("meter", 1000.0)], PublisherOptions::default()).await;
    h.publisher.publish_cycle().await.unwrap();

    h.host.set_state("sensor.meter_energy", "3.5");
    let report = h.publisher.publish_cycle().await.unwrap();
    assert_eq!(report.resets, vec!["meter".to_string()]);
    let flagged = h.cloud.batches().last().unwrap()[0].clone();
    assert!(flagged.energy_reset);
    assert_eq!(flagged.energy_total_kwh, Some(3.5));

    h.host.set_state("sensor.meter_energy", "3.7");
    let report = h.publisher.publish_cycle().await.unwrap();
    assert!(report.resets.is_empty());
    assert!(!h.cloud.batches().last().unwrap()[0].energy_reset);
    assert_eq!(h.publisher.stats().resets, 1);
}

#[tokio::test]
async fn test_reset_flag_survives_failed_push() {
    let h = Harness::new(vec![ams_meter("meter", 1000.0)], PublisherOptions::default()).await;
    h.publisher.publish_cycle().await.unwrap();

    h.host.set_state("sensor.meter_energy", "2.0");
    h.cloud.reject_device(&h.cloud_id("meter"));
    h.publisher.publish_cycle().await.unwrap();

    h.cloud.clear_device_failures();
    h.host.set_state("sensor.meter_energy", "2.1");
    let report = h.publisher.publish_cycle().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(h.cloud.batches().last().unwrap()[0].energy_reset);
}

#[tokio::test]
async fn test_retry_budget_degrades_availability() {
    let h = Harness::new(
        vec![ams_meter("meter", 1000.0), easee_charger("easee_1")],
        PublisherOptions {
            retry_budget: 2,
            ..PublisherOptions::default()
        },
    )
    .await;
    h.cloud.disable_batch();
    let meter = h.cloud_id("meter");
    h.cloud.fail_device(&meter);

    for _ in 0..3 {
        let report = h.publisher.publish_cycle().await.unwrap();
        assert!(report.degraded.is_empty());
        assert_eq!(report.pushed, 1);
    }
    let report = h.publisher.publish_cycle().await.unwrap();
    assert_eq!(report.degraded, vec!["meter".to_string()]);

    h.cloud.clear_device_failures();
    let report = h.publisher.publish_cycle().await.unwrap();
    let sent = h.cloud.single_pushes();
    let last_meter = sent.iter().rev().find(|s| s.cloud_id == meter).unwrap();
    assert!(!last_meter.available);
    assert_eq!(report.pushed, 2);

    let report = h.publisher.publish_cycle().await.unwrap();
    assert!(report.degraded.is_empty());
    let sent = h.cloud.single_pushes();
    assert!(sent.iter().rev().find(|s| s.cloud_id == meter).unwrap().available);
}

#[tokio::test]
async fn test_power_flip_reports_event() {
    let h = Harness::new(vec![easee_charger("easee_1")], PublisherOptions::default()).await;
    h.publisher.publish_cycle().await.unwrap();
    assert!(h.cloud.events().is_empty());

    h.host.set_state("switch.easee_1_charger", "on");
    let report = h.publisher.publish_cycle().await.unwrap();
    assert_eq!(report.events, 1);
    let events = h.cloud.events();
    assert_eq!(events[0].event_type, DeviceEventKind::PowerOn);
    assert_eq!(events[0].cloud_id, h.cloud_id("easee_1"));
}

#[tokio::test]
async fn test_expired_grant_fails_cycle() {
    let h = Harness::new(vec![ams_meter("meter", 1000.0)], PublisherOptions::default()).await;
    h.cloud.revoke_tokens();
    h.cloud.reject_refresh(true);

    let err = h.publisher.publish_cycle().await.unwrap_err();
    assert!(err.is_auth());
}
