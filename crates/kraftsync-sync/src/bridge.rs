//! Bridge orchestrator
//!
//! Owns the mapper, publisher and command poller for one site and drives
//! them from three independent periodic loops: discovery, telemetry and
//! command polling. Host change notifications and the user services
//! (`push_now`, `force_resync`) run the same operations on demand.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use kraftsync_cloud::{DynCloud, TokenManager};
use kraftsync_core::{BridgeConfig, DynHost, DynSource, Error, HostEvent, Result};
use kraftsync_devices::Classifier;

use crate::diagnostics::{redact, DeviceDiagnostics, Diagnostics};
use crate::mapper::{DeviceMapper, MapperOptions, MappingDiff};
use crate::poller::{CommandPoller, PollReport};
use crate::publisher::{CycleReport, PublisherOptions, TelemetryPublisher};
use crate::router::CommandRouter;
use crate::status::{LoopStatus, LoopTracker};

/// The periodic loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Discovery,
    Telemetry,
    Commands,
}

impl LoopKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopKind::Discovery => "discovery",
            LoopKind::Telemetry => "telemetry",
            LoopKind::Commands => "commands",
        }
    }
}

pub struct Bridge {
    config: BridgeConfig,
    host: DynHost,
    source: DynSource,
    tokens: Option<Arc<TokenManager>>,
    mapper: Arc<DeviceMapper>,
    publisher: Arc<TelemetryPublisher>,
    poller: Arc<CommandPoller>,
    /// Serializes discovery passes
    discovery_lock: Mutex<()>,
    discovery_status: LoopTracker,
    telemetry_status: LoopTracker,
    command_status: LoopTracker,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Wire the components for one site.
    ///
    /// The telemetry source must be the kind the configuration selects; real
    /// and simulated sources are never mixed.
    pub fn new(
        config: BridgeConfig,
        host: DynHost,
        source: DynSource,
        cloud: DynCloud,
        tokens: Option<Arc<TokenManager>>,
    ) -> Result<Self> {
        if source.kind() != config.source {
            return Err(Error::Config(format!(
                "configured source is {} but a {} source was supplied",
                config.source.as_str(),
                source.kind().as_str()
            )));
        }

        let host_timeout = Duration::from_secs(config.host.timeout_secs.max(1));
        let mapper = Arc::new(DeviceMapper::new(
            MapperOptions {
                site_id: config.cloud.site_id.clone(),
                grace_cycles: config.mapping.grace_cycles,
                selection: config.mapping.selection.clone(),
            },
            Classifier::new(),
            cloud.clone(),
        ));
        let publisher = Arc::new(TelemetryPublisher::new(
            cloud.clone(),
            source.clone(),
            mapper.subscribe(),
            PublisherOptions::from_section(&config.telemetry, host_timeout),
        ));
        let router = Arc::new(CommandRouter::new(host.clone(), mapper.subscribe(), host_timeout));
        let poller = Arc::new(CommandPoller::new(cloud, router));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            host,
            source,
            tokens,
            mapper,
            publisher,
            poller,
            discovery_lock: Mutex::new(()),
            discovery_status: LoopTracker::new(LoopKind::Discovery.as_str()),
            telemetry_status: LoopTracker::new(LoopKind::Telemetry.as_str()),
            command_status: LoopTracker::new(LoopKind::Commands.as_str()),
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn mapper(&self) -> &Arc<DeviceMapper> {
        &self.mapper
    }

    pub fn publisher(&self) -> &Arc<TelemetryPublisher> {
        &self.publisher
    }

    pub fn poller(&self) -> &Arc<CommandPoller> {
        &self.poller
    }

    fn host_timeout(&self) -> Duration {
        Duration::from_secs(self.config.host.timeout_secs.max(1))
    }

    fn tracker(&self, kind: LoopKind) -> &LoopTracker {
        match kind {
            LoopKind::Discovery => &self.discovery_status,
            LoopKind::Telemetry => &self.telemetry_status,
            LoopKind::Commands => &self.command_status,
        }
    }

    /// One discovery pass: enumerate the host and reconcile the mapping.
    ///
    /// A failed enumeration leaves the mapping untouched, so devices are not
    /// counted as missing because the host was unreachable.
    pub async fn discover_once(&self) -> Result<MappingDiff> {
        let _pass = self.discovery_lock.lock().await;
        let devices = tokio::time::timeout(self.host_timeout(), self.host.discover())
            .await
            .map_err(|_| Error::Timeout(self.host_timeout().as_millis() as u64))??;
        let diff = self.mapper.reconcile(&devices).await;
        if !diff.is_empty() {
            info!(
                created = diff.created.len(),
                updated = diff.updated.len(),
                removed = diff.removed.len(),
                missing = diff.missing.len(),
                "Mapping reconciled"
            );
        }
        Ok(diff)
    }

    /// Push telemetry immediately. Overlapping calls queue behind the running
    /// cycle rather than interleaving with it.
    pub async fn push_now(&self) -> Result<CycleReport> {
        self.publisher.publish_cycle().await
    }

    pub async fn poll_commands(&self) -> Result<PollReport> {
        self.poller.poll_once().await
    }

    /// Re-upsert every mapped device, rediscover, then push.
    pub async fn force_resync(&self) -> Result<MappingDiff> {
        info!("Full resynchronization requested");
        self.mapper.mark_all_unsynced().await;
        let diff = self.discover_once().await?;
        if let Err(e) = self.push_now().await {
            warn!(error = %e, "Telemetry push after resync failed");
        }
        Ok(diff)
    }

    async fn run_once(&self, kind: LoopKind) -> Result<()> {
        match kind {
            LoopKind::Discovery => self.discover_once().await.map(|_| ()),
            LoopKind::Telemetry => self.push_now().await.map(|_| ()),
            LoopKind::Commands => self.poll_commands().await.map(|_| ()),
        }
    }

    fn period(&self, kind: LoopKind) -> Duration {
        match kind {
            LoopKind::Discovery => self.config.intervals.discovery(),
            LoopKind::Telemetry => self.config.intervals.telemetry(),
            LoopKind::Commands => self.config.intervals.command_poll(),
        }
    }

    async fn run_loop(self: Arc<Self>, kind: LoopKind, mut shutdown: watch::Receiver<bool>) {
        let period = self.period(kind);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(task = kind.as_str(), period_secs = period.as_secs(), "Loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match self.run_once(kind).await {
                Ok(()) => self.tracker(kind).record_success(),
                Err(e) => {
                    self.tracker(kind).record_failure(&e);
                    let failures = self.tracker(kind).status().consecutive_failures;
                    if e.is_auth() && self.tokens.as_ref().is_some_and(|t| t.needs_reauth()) {
                        error!(task = kind.as_str(), error = %e, "Cloud connection needs re-authentication");
                    } else {
                        warn!(task = kind.as_str(), error = %e, failures, "Loop run failed");
                    }
                }
            }
        }
        debug!(task = kind.as_str(), "Loop stopped");
    }

    async fn listen(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<HostEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.changed() => break,
            };
            match event {
                Ok(HostEvent::DevicesChanged) | Err(RecvError::Lagged(_)) => {
                    if let Err(e) = self.discover_once().await {
                        warn!(error = %e, "Discovery after host change failed");
                    }
                }
                Ok(HostEvent::StateChanged { entity_id }) => {
                    let snapshot = self.mapper.snapshot();
                    let is_control = snapshot
                        .owner_of(&entity_id)
                        .is_some_and(|entry| entry.controls().any(|c| c.entity_id == entity_id));
                    if !is_control {
                        continue;
                    }
                    debug!(entity_id = %entity_id, "Control changed state, pushing telemetry");
                    let Some(rediscover) = self.settle(&mut events, &mut shutdown).await else {
                        break;
                    };
                    if rediscover {
                        if let Err(e) = self.discover_once().await {
                            warn!(error = %e, "Discovery after host change failed");
                        }
                    }
                    if let Err(e) = self.push_now().await {
                        warn!(error = %e, "Telemetry push after state change failed");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Absorb further events until the debounce window closes, so a burst of
    /// changes costs one push. Returns whether a rediscovery is due, or `None`
    /// on shutdown.
    async fn settle(
        &self,
        events: &mut tokio::sync::broadcast::Receiver<HostEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<bool> {
        let window = tokio::time::sleep(self.config.intervals.state_change_debounce());
        tokio::pin!(window);
        let mut rediscover = false;
        let mut absorbed = 0usize;
        loop {
            tokio::select! {
                _ = &mut window => break,
                _ = shutdown.changed() => return None,
                event = events.recv() => match event {
                    Ok(HostEvent::StateChanged { .. }) => absorbed += 1,
                    Ok(HostEvent::DevicesChanged) | Err(RecvError::Lagged(_)) => rediscover = true,
                    Err(RecvError::Closed) => break,
                },
            }
        }
        if absorbed > 0 {
            debug!(absorbed, "State changes folded into one push");
        }
        Some(rediscover)
    }

    /// Run an initial discovery, then start the loops and the host listener.
    pub async fn start(self: &Arc<Self>) {
        if !self.tasks.lock().is_empty() {
            warn!("Bridge already started");
            return;
        }
        self.shutdown_tx.send_replace(false);

        match self.discover_once().await {
            Ok(diff) => {
                self.discovery_status.record_success();
                info!(mapped = self.mapper.snapshot().len(), created = diff.created.len(), "Initial discovery done");
            }
            Err(e) => {
                self.discovery_status.record_failure(&e);
                warn!(error = %e, "Initial discovery failed");
            }
        }

        let mut tasks = self.tasks.lock();
        for kind in [LoopKind::Discovery, LoopKind::Telemetry, LoopKind::Commands] {
            let bridge = Arc::clone(self);
            tasks.push(tokio::spawn(bridge.run_loop(kind, self.shutdown_tx.subscribe())));
        }
        if let Some(events) = self.host.subscribe() {
            let bridge = Arc::clone(self);
            tasks.push(tokio::spawn(bridge.listen(events, self.shutdown_tx.subscribe())));
        }
        info!(
            site_id = %redact(&self.config.cloud.site_id),
            host = self.host.name(),
            source = self.source.kind().as_str(),
            "Bridge started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|t| !t.is_finished())
    }

    /// Stop the loops, giving running work up to `grace` to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let started = tokio::time::Instant::now();

        if tokio::time::timeout(grace, futures::future::join_all(tasks)).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Loops did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        let remaining = grace.saturating_sub(started.elapsed());
        self.mapper.shutdown(remaining).await;
        info!("Bridge stopped");
    }

    pub fn loop_status(&self) -> Vec<LoopStatus> {
        [LoopKind::Discovery, LoopKind::Telemetry, LoopKind::Commands]
            .into_iter()
            .map(|kind| self.tracker(kind).status())
            .collect()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let snapshot = self.mapper.snapshot();
        let token_state = match &self.tokens {
            Some(tokens) => Some(tokens.state().await),
            None => None,
        };
        Diagnostics {
            generated_at: Utc::now(),
            site_id: redact(&self.config.cloud.site_id),
            source: self.source.kind(),
            host: self.host.name().to_string(),
            token_state,
            token_refreshes: self.tokens.as_ref().map(|t| t.refresh_count()),
            mapped_devices: snapshot.len(),
            devices: snapshot.entries().map(DeviceDiagnostics::from_entry).collect(),
            loops: self.loop_status(),
            telemetry: self.publisher.stats(),
            commands: self.poller.stats(),
        }
    }
}
