//! Telemetry publisher
//!
//! One cycle samples every mapped device, checks cumulative counters, and
//! pushes the samples in batches (or one by one when the cloud has no batch
//! endpoint). Devices are isolated from each other: a failed sample or push
//! only affects that device's bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use kraftsync_cloud::DynCloud;
use kraftsync_core::config::TelemetrySection;
use kraftsync_core::{
    DeviceEvent, DeviceEventKind, DynSource, Error, MappingEntry, Result, TelemetrySample,
};

use crate::mapper::MappingSnapshot;

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Use the batch endpoint while the cloud supports it
    pub batch: bool,
    /// Samples per batch request
    pub max_batch: usize,
    /// Consecutive failed pushes before a device is reported unavailable
    pub retry_budget: u32,
    /// Upper bound for reading one device
    pub sample_timeout: Duration,
}

impl PublisherOptions {
    pub fn from_section(section: &TelemetrySection, sample_timeout: Duration) -> Self {
        Self {
            batch: section.batch,
            max_batch: section.max_batch.max(1),
            retry_budget: section.retry_budget,
            sample_timeout,
        }
    }
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self::from_section(&TelemetrySection::default(), Duration::from_secs(10))
    }
}

#[derive(Debug, Default)]
struct DeviceTrack {
    last_energy: Option<f64>,
    last_on: Option<bool>,
    /// A detected reset that has not reached the cloud yet.
    reset_pending: bool,
    failures: u32,
}

/// Result of one publish cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Devices sampled successfully
    pub sampled: usize,
    /// Samples the cloud accepted
    pub pushed: usize,
    /// Local ids whose sample or push failed
    pub failed: Vec<String>,
    /// Local ids whose energy counter went backwards
    pub resets: Vec<String>,
    /// Local ids reported unavailable after exhausting the retry budget
    pub degraded: Vec<String>,
    /// State-change events delivered
    pub events: usize,
}

/// Cumulative publisher counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublisherStats {
    pub cycles: u64,
    pub samples_pushed: u64,
    pub push_failures: u64,
    pub resets: u64,
    pub events_sent: u64,
    pub batch_supported: bool,
}

pub struct TelemetryPublisher {
    cloud: DynCloud,
    source: DynSource,
    mappings: watch::Receiver<Arc<MappingSnapshot>>,
    options: PublisherOptions,
    /// Also serializes cycles.
    tracks: Mutex<HashMap<String, DeviceTrack>>,
    batch_supported: AtomicBool,
    events_supported: AtomicBool,
    cycles: AtomicU64,
    samples_pushed: AtomicU64,
    push_failures: AtomicU64,
    resets: AtomicU64,
    events_sent: AtomicU64,
}

impl TelemetryPublisher {
    pub fn new(
        cloud: DynCloud,
        source: DynSource,
        mappings: watch::Receiver<Arc<MappingSnapshot>>,
        options: PublisherOptions,
    ) -> Self {
        Self {
            cloud,
            source,
            mappings,
            options,
            tracks: Mutex::new(HashMap::new()),
            batch_supported: AtomicBool::new(true),
            events_supported: AtomicBool::new(true),
            cycles: AtomicU64::new(0),
            samples_pushed: AtomicU64::new(0),
            push_failures: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            samples_pushed: self.samples_pushed.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            batch_supported: self.options.batch && self.batch_supported.load(Ordering::Relaxed),
        }
    }

    /// Run one cycle. Calls made while a cycle is running wait for it and
    /// then run their own.
    ///
    /// Per-device failures are reported in the [`CycleReport`]. An error is
    /// returned only when authentication failed and nothing was delivered.
    pub async fn publish_cycle(&self) -> Result<CycleReport> {
        let mut tracks = self.tracks.lock().await;
        let snapshot = self.mappings.borrow().clone();
        tracks.retain(|local_id, _| snapshot.get(local_id).is_some());
        self.cycles.fetch_add(1, Ordering::Relaxed);

        let mut report = CycleReport::default();
        let sampled = join_all(snapshot.entries().map(|entry| self.sample(entry))).await;

        let mut samples = Vec::with_capacity(sampled.len());
        let mut events = Vec::new();
        for (entry, result) in snapshot.entries().zip(sampled) {
            let track = tracks.entry(entry.local_id.clone()).or_default();
            let mut sample = match result {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(local_id = %entry.local_id, error = %e, "Failed to sample device");
                    track.failures += 1;
                    report.failed.push(entry.local_id.clone());
                    continue;
                }
            };

            if self.check_counter(entry, track, &mut sample) {
                report.resets.push(entry.local_id.clone());
            }
            if let Some(event) = power_event(track, &sample) {
                events.push(event);
            }
            if track.failures > self.options.retry_budget {
                sample.available = false;
                report.degraded.push(entry.local_id.clone());
            }
            samples.push(sample);
        }
        report.sampled = samples.len();

        let results = self.push(&samples).await;
        let mut auth_error = None;
        for (sample, result) in samples.iter().zip(results) {
            let Some(track) = tracks.get_mut(&sample.local_id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    track.failures = 0;
                    if sample.energy_reset {
                        track.reset_pending = false;
                    }
                    report.pushed += 1;
                }
                Err(e) => {
                    track.failures += 1;
                    if track.failures == self.options.retry_budget + 1 {
                        warn!(
                            local_id = %sample.local_id,
                            failures = track.failures,
                            "Retry budget exhausted, reporting device unavailable"
                        );
                    } else {
                        debug!(local_id = %sample.local_id, error = %e, "Telemetry push failed");
                    }
                    if e.is_auth() {
                        auth_error.get_or_insert(e);
                    }
                    report.failed.push(sample.local_id.clone());
                }
            }
        }
        drop(tracks);

        report.events = self.send_events(&events).await;

        self.samples_pushed.fetch_add(report.pushed as u64, Ordering::Relaxed);
        self.push_failures
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        self.resets.fetch_add(report.resets.len() as u64, Ordering::Relaxed);
        self.events_sent.fetch_add(report.events as u64, Ordering::Relaxed);

        debug!(
            sampled = report.sampled,
            pushed = report.pushed,
            failed = report.failed.len(),
            "Telemetry cycle finished"
        );
        match auth_error {
            Some(e) if report.pushed == 0 => Err(e),
            _ => Ok(report),
        }
    }

    async fn sample(&self, entry: &MappingEntry) -> Result<TelemetrySample> {
        match tokio::time::timeout(self.options.sample_timeout, self.source.sample(entry)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.options.sample_timeout.as_millis() as u64)),
        }
    }

    /// Flag a decreasing cumulative counter. Returns whether a new reset was found.
    fn check_counter(&self, entry: &MappingEntry, track: &mut DeviceTrack, sample: &mut TelemetrySample) -> bool {
        let mut detected = false;
        if let Some(current) = sample.energy_total_kwh {
            if let Some(previous) = track.last_energy {
                if current < previous {
                    let conflict = Error::DataConflict {
                        local_id: entry.local_id.clone(),
                        detail: format!("energy_total_kwh went from {} to {}", previous, current),
                    };
                    warn!(cloud_id = %entry.cloud_id, error = %conflict, "Energy counter reset, flagging sample");
                    track.reset_pending = true;
                    detected = true;
                }
            }
            track.last_energy = Some(current);
        }
        if track.reset_pending {
            sample.energy_reset = true;
        }
        detected
    }

    /// Push samples, returning one result per sample in order.
    async fn push(&self, samples: &[TelemetrySample]) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(samples.len());
        for chunk in samples.chunks(self.options.max_batch.max(1)) {
            if !(self.options.batch && self.batch_supported.load(Ordering::Relaxed)) {
                results.extend(self.push_each(chunk).await);
                continue;
            }
            match self.cloud.push_telemetry(chunk).await {
                Ok(outcome) => {
                    let rejected = outcome.rejected().count();
                    if rejected > 0 {
                        let partial = Error::PartialBatch {
                            failed: rejected,
                            total: chunk.len(),
                        };
                        warn!(error = %partial, "Telemetry batch partially rejected");
                    }
                    for sample in chunk {
                        results.push(match outcome.status_for(&sample.cloud_id) {
                            Some(status) if !status.accepted => Err(Error::Rejected {
                                status: 422,
                                message: status.error.clone().unwrap_or_else(|| "rejected".into()),
                            }),
                            _ => Ok(()),
                        });
                    }
                }
                Err(Error::Unsupported(endpoint)) => {
                    info!(endpoint = %endpoint, "Batch telemetry not supported, pushing per device");
                    self.batch_supported.store(false, Ordering::Relaxed);
                    results.extend(self.push_each(chunk).await);
                }
                Err(e) => {
                    warn!(error = %e, samples = chunk.len(), "Telemetry batch failed");
                    results.extend(chunk.iter().map(|_| Err(e.clone())));
                }
            }
        }
        results
    }

    async fn push_each(&self, samples: &[TelemetrySample]) -> Vec<Result<()>> {
        join_all(samples.iter().map(|s| self.cloud.push_device_telemetry(s))).await
    }

    async fn send_events(&self, events: &[DeviceEvent]) -> usize {
        let mut sent = 0;
        for event in events {
            if !self.events_supported.load(Ordering::Relaxed) {
                break;
            }
            match self.cloud.report_event(event).await {
                Ok(()) => sent += 1,
                Err(Error::Unsupported(_)) => {
                    info!("Cloud does not accept device events, disabling");
                    self.events_supported.store(false, Ordering::Relaxed);
                }
                Err(e) => debug!(cloud_id = %event.cloud_id, error = %e, "Failed to report device event"),
            }
        }
        sent
    }
}

fn power_event(track: &mut DeviceTrack, sample: &TelemetrySample) -> Option<DeviceEvent> {
    let on = sample.is_on?;
    let previous = track.last_on.replace(on)?;
    if previous == on {
        return None;
    }
    Some(DeviceEvent {
        cloud_id: sample.cloud_id.clone(),
        event_type: if on {
            DeviceEventKind::PowerOn
        } else {
            DeviceEventKind::PowerOff
        },
        timestamp: sample.timestamp,
        power_w: sample.power_w,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(on: Option<bool>) -> TelemetrySample {
        let mut s = TelemetrySample::new("heater", "c1", Utc::now());
        s.is_on = on;
        s
    }

    #[test]
    fn test_power_event_on_flip_only() {
        let mut track = DeviceTrack::default();
        assert!(power_event(&mut track, &sample(Some(false))).is_none());
        assert!(power_event(&mut track, &sample(Some(false))).is_none());
        assert!(power_event(&mut track, &sample(None)).is_none());

        let event = power_event(&mut track, &sample(Some(true))).unwrap();
        assert_eq!(event.event_type, DeviceEventKind::PowerOn);
        let event = power_event(&mut track, &sample(Some(false))).unwrap();
        assert_eq!(event.event_type, DeviceEventKind::PowerOff);
    }
}
