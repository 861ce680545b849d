//! Command poller and router against the in-memory host and fake cloud.

use std::sync::Arc;
use std::time::Duration;

use kraftsync_cloud::DynCloud;
use async_trait::async_trait;
use kraftsync_core::{
    AckStatus, CloudCommand, CommandKind, DeviceRole, EntitySnapshot, Error, FailureReason, HostAction,
    HostPlatform, LocalDevice,
};
use kraftsync_devices::Classifier;
use kraftsync_sync::{CommandPoller, CommandRouter, DeviceMapper, MapperOptions};
use kraftsync_testing::fixtures::{ams_meter, easee_charger, water_heater};
use kraftsync_testing::{FakeCloud, MemoryHost};

struct Harness {
    host: Arc<MemoryHost>,
    cloud: Arc<FakeCloud>,
    mapper: DeviceMapper,
    poller: CommandPoller,
}

impl Harness {
    async fn new(devices: Vec<kraftsync_core::LocalDevice>) -> Self {
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
        let found = host.discover().await.unwrap();
        mapper.reconcile(&found).await;
        mapper.flush().await;

        let router = Arc::new(CommandRouter::new(
            host.clone(),
            mapper.subscribe(),
            Duration::from_secs(2),
        ));
        let poller = CommandPoller::new(api, router);
        Self {
            host,
            cloud,
            mapper,
            poller,
        }
    }

    fn cloud_id(&self, local_id: &str) -> String {
        self.mapper.snapshot().get(local_id).unwrap().cloud_id.clone()
    }
}

#[tokio::test]
async fn test_start_charge_resolves_to_charger_switch() {
    let h = Harness::new(vec![easee_charger("easee_1")]).await;
    let snapshot = h.mapper.snapshot();
    let entry = snapshot.get("easee_1").unwrap();
    assert_eq!(entry.role, DeviceRole::EvCharger);

    h.cloud.enqueue_command(CloudCommand::new(
        "cmd-1",
        entry.cloud_id.clone(),
        CommandKind::StartCharge,
    ));
    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.executed, 1);

    let actions = h.host.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].entity_id, "switch.easee_1_charger");
    assert_eq!(actions[0].service, "turn_on");
    assert!(h.host.actions_for("sensor.easee_1_power").is_empty());

    let acks = h.cloud.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].status, AckStatus::Acknowledged);
    let state = acks[0].device_state.as_ref().unwrap();
    assert_eq!(state["state"], "on");
    assert!(h.cloud.pending_commands().is_empty());
}

#[tokio::test]
async fn test_redelivered_command_is_not_dispatched_again() {
    let h = Harness::new(vec![easee_charger("easee_1")]).await;
    let command = CloudCommand::new("cmd-1", h.cloud_id("easee_1"), CommandKind::StopCharge);
    h.cloud.enqueue_command(command.clone());
    h.poller.poll_once().await.unwrap();
    assert_eq!(h.cloud.acks().len(), 1);

    // the cloud hands out the same command again
    h.cloud.enqueue_command(command);
    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.executed, 0);
    assert_eq!(h.host.actions().len(), 1);
    assert_eq!(h.cloud.acks().len(), 1);
    assert!(h.cloud.pending_commands().is_empty());
    assert_eq!(h.poller.stats().duplicates, 1);
}

#[tokio::test]
async fn test_failed_ack_is_retried_without_redispatch() {
    let h = Harness::new(vec![easee_charger("easee_1")]).await;
    let rejected = || Error::Rejected {
        status: 400,
        message: "try later".into(),
    };
    h.cloud.fail_next("ack_command", rejected());
    h.cloud.fail_next("ack_command", rejected());
    h.cloud.enqueue_command(CloudCommand::new(
        "cmd-1",
        h.cloud_id("easee_1"),
        CommandKind::StartCharge,
    ));

    let first = h.poller.poll_once().await.unwrap();
    assert_eq!(first.executed, 1);
    assert_eq!(first.ack_failures, 1);
    assert!(h.cloud.acks().is_empty());

    // outstanding ack fails again, then the redelivered command is re-acked
    let second = h.poller.poll_once().await.unwrap();
    assert_eq!(second.duplicates, 1);
    assert_eq!(h.host.actions().len(), 1);
    assert_eq!(h.cloud.acks().len(), 1);
    assert!(h.poller.has_handled("cmd-1").await);
}

#[tokio::test]
async fn test_unmapped_target_fails_without_dispatch() {
    let h = Harness::new(vec![easee_charger("easee_1")]).await;
    h.cloud
        .enqueue_command(CloudCommand::new("cmd-9", "no-such-device", CommandKind::TurnOn));
    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(h.host.actions().is_empty());

    let ack = &h.cloud.acks()[0];
    assert_eq!(ack.status, AckStatus::Failed);
    assert_eq!(ack.reason, Some(FailureReason::UnmappedTarget));
}

#[tokio::test]
async fn test_unresolvable_commands() {
    let h = Harness::new(vec![ams_meter("meter", 1000.0), water_heater("vvb")]).await;
    let meter = h.cloud_id("meter");
    let router = h.poller.router();

    let ack = router
        .execute(&CloudCommand::new("c1", meter.clone(), CommandKind::TurnOn))
        .await;
    assert_eq!(ack.reason, Some(FailureReason::NoControlEntity));

    let ack = router
        .execute(&CloudCommand::new("c2", meter, "self_destruct"))
        .await;
    assert_eq!(ack.reason, Some(FailureReason::UnsupportedCommand));

    let ack = router
        .execute(&CloudCommand::new("c3", h.cloud_id("vvb"), CommandKind::StartCharge))
        .await;
    assert_eq!(ack.reason, Some(FailureReason::UnsupportedCommand));

    let ack = router
        .execute(&CloudCommand::new("c4", h.cloud_id("vvb"), CommandKind::SetTemperature))
        .await;
    assert_eq!(ack.reason, Some(FailureReason::InvalidParameters));
    assert!(h.host.actions().is_empty());
}

#[tokio::test]
async fn test_water_heater_commands() {
    let h = Harness::new(vec![water_heater("vvb")]).await;
    let target = h.cloud_id("vvb");
    let router = h.poller.router();

    let ack = router
        .execute(
            &CloudCommand::new("c1", target.clone(), CommandKind::SetMode).with_param("mode", "performance"),
        )
        .await;
    assert!(ack.is_success());
    assert_eq!(h.host.state_of("water_heater.vvb").as_deref(), Some("performance"));

    let ack = router
        .execute(
            &CloudCommand::new("c2", target, CommandKind::SetTemperature)
                .with_param("target_temperature_c", 70),
        )
        .await;
    assert!(ack.is_success());
    let action = h.host.actions().pop().unwrap();
    assert_eq!(action.service, "set_temperature");
    assert_eq!(action.entity_id, "water_heater.vvb");
}

#[tokio::test]
async fn test_dispatch_failures_carry_reason() {
    let h = Harness::new(vec![easee_charger("easee_1")]).await;
    let target = h.cloud_id("easee_1");
    let router = h.poller.router();

    h.host.set_state("switch.easee_1_charger", "unavailable");
    let ack = router
        .execute(&CloudCommand::new("c1", target.clone(), CommandKind::StartCharge))
        .await;
    assert_eq!(ack.reason, Some(FailureReason::EntityUnavailable));

    h.host.set_state("switch.easee_1_charger", "off");
    h.host.fail_invocations_for("switch.easee_1_charger");
    let ack = router
        .execute(&CloudCommand::new("c2", target, CommandKind::StartCharge))
        .await;
    assert_eq!(ack.reason, Some(FailureReason::DispatchFailed));
}

/// Reads from the memory host but accepts every service call, the way a
/// REST host answers 200 for entities that cannot act.
struct AcceptingHost {
    inner: Arc<MemoryHost>,
    invoked: parking_lot::Mutex<Vec<HostAction>>,
}

#[async_trait]
impl HostPlatform for AcceptingHost {
    fn name(&self) -> &str {
        "accepting"
    }

    async fn discover(&self) -> kraftsync_core::Result<Vec<LocalDevice>> {
        self.inner.discover().await
    }

    async fn read_entities(&self, entity_ids: &[String]) -> kraftsync_core::Result<Vec<EntitySnapshot>> {
        self.inner.read_entities(entity_ids).await
    }

    async fn invoke(&self, action: &HostAction) -> kraftsync_core::Result<()> {
        self.invoked.lock().push(action.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_unavailable_entity_fails_without_dispatch() {
    let h = Harness::new(vec![easee_charger("easee_1")]).await;
    let host = Arc::new(AcceptingHost {
        inner: h.host.clone(),
        invoked: parking_lot::Mutex::new(Vec::new()),
    });
    let router = CommandRouter::new(host.clone(), h.mapper.subscribe(), Duration::from_secs(2));
    let target = h.cloud_id("easee_1");

    h.host.set_state("switch.easee_1_charger", "unavailable");
    let ack = router
        .execute(&CloudCommand::new("c1", target.clone(), CommandKind::StartCharge))
        .await;
    assert_eq!(ack.status, AckStatus::Failed);
    assert_eq!(ack.reason, Some(FailureReason::EntityUnavailable));
    assert!(host.invoked.lock().is_empty());

    h.host.set_state("switch.easee_1_charger", "unknown");
    let ack = router
        .execute(&CloudCommand::new("c2", target.clone(), CommandKind::StartCharge))
        .await;
    assert_eq!(ack.reason, Some(FailureReason::EntityUnavailable));
    assert!(host.invoked.lock().is_empty());

    h.host.set_state("switch.easee_1_charger", "off");
    let ack = router
        .execute(&CloudCommand::new("c3", target, CommandKind::StartCharge))
        .await;
    assert!(ack.is_success());
    assert_eq!(host.invoked.lock().len(), 1);
}

#[tokio::test]
async fn test_dispatch_is_serialized_per_entity() {
    let h = Harness::new(vec![easee_charger("easee_1")]).await;
    h.host.set_invoke_delay(Duration::from_millis(50));
    let target = h.cloud_id("easee_1");
    let router = h.poller.router();

    let start = CloudCommand::new("c1", target.clone(), CommandKind::StartCharge);
    let stop = CloudCommand::new("c2", target.clone(), CommandKind::StopCharge);
    let limit = CloudCommand::new("c3", target, CommandKind::SetChargeLimit).with_param("current_a", 10);
    let (a, b, c) = tokio::join!(router.execute(&start), router.execute(&stop), router.execute(&limit));
    assert!(a.is_success() && b.is_success() && c.is_success());

    assert_eq!(h.host.max_concurrent_invocations("switch.easee_1_charger"), 1);
    assert_eq!(h.host.actions_for("switch.easee_1_charger").len(), 2);
    assert_eq!(h.host.actions_for("number.easee_1_current_limit").len(), 1);
}

#[tokio::test]
async fn test_dispatch_timeout() {
    let h = Harness::new(vec![easee_charger("easee_1")]).await;
    let router = CommandRouter::new(h.host.clone(), h.mapper.subscribe(), Duration::from_millis(20));
    h.host.set_invoke_delay(Duration::from_millis(200));

    let ack = router
        .execute(&CloudCommand::new("c1", h.cloud_id("easee_1"), CommandKind::StartCharge))
        .await;
    assert_eq!(ack.reason, Some(FailureReason::Timeout));
}
