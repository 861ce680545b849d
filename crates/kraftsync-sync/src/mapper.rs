//! Device mapper
//!
//! Maintains the mapping between local devices and their cloud twins.
//!
//! Reconciliation is the only writer. Each pass works on the mapper's own
//! table under a lock and, when done, publishes an immutable
//! [`MappingSnapshot`] over a `watch` channel. The publisher and the command
//! router read whole snapshots, never the live table.
//!
//! Cloud upserts and removals are sent from background tasks. At most one
//! request per cloud id is on the wire at any time; a change arriving while
//! one is in flight replaces the queued follow-up, so only the newest state
//! is sent next.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kraftsync_cloud::{DeviceUpsert, DynCloud};
use kraftsync_core::{Error, LocalDevice, MappingEntry};
use kraftsync_devices::Classifier;

/// Namespace for cloud ids derived from site and local id.
const CLOUD_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b72_6166_7473_796e_6300_0000_0000_0001);

/// Stable cloud id for a local device of a site.
///
/// Deterministic, so a restarted bridge upserts the same cloud devices
/// instead of creating new ones.
pub fn cloud_id_for(site_id: &str, local_id: &str) -> String {
    Uuid::new_v5(&CLOUD_ID_NAMESPACE, format!("{}/{}", site_id, local_id).as_bytes()).to_string()
}

/// Read-only view of the mapping table.
#[derive(Debug, Clone, Default)]
pub struct MappingSnapshot {
    entries: BTreeMap<String, MappingEntry>,
    by_cloud_id: HashMap<String, String>,
    generation: u64,
}

impl MappingSnapshot {
    fn build(entries: &BTreeMap<String, MappingEntry>, generation: u64) -> Self {
        let by_cloud_id = entries
            .values()
            .map(|e| (e.cloud_id.clone(), e.local_id.clone()))
            .collect();
        Self {
            entries: entries.clone(),
            by_cloud_id,
            generation,
        }
    }

    pub fn get(&self, local_id: &str) -> Option<&MappingEntry> {
        self.entries.get(local_id)
    }

    /// Reverse lookup used by the command router.
    pub fn by_cloud_id(&self, cloud_id: &str) -> Option<&MappingEntry> {
        self.by_cloud_id
            .get(cloud_id)
            .and_then(|local_id| self.entries.get(local_id))
    }

    /// Entries ordered by local id.
    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Increases with every published snapshot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mapping entry owning this entity, if any.
    pub fn owner_of(&self, entity_id: &str) -> Option<&MappingEntry> {
        self.entries
            .values()
            .find(|e| e.child_entities.iter().any(|c| c.entity_id == entity_id))
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappingDiff {
    /// Newly mapped local ids.
    pub created: Vec<String>,
    /// Mapped devices whose entities, role or name changed.
    pub updated: Vec<String>,
    /// Mappings torn down.
    pub removed: Vec<String>,
    /// Mapped devices absent from this scan but still within the grace period.
    pub missing: Vec<String>,
    /// Devices re-sent because an earlier cloud request failed or a resync was requested.
    pub resent: Vec<String>,
}

impl MappingDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.missing.is_empty()
            && self.resent.is_empty()
    }
}

/// Mapper settings.
#[derive(Debug, Clone)]
pub struct MapperOptions {
    pub site_id: String,
    /// Consecutive discovery passes a mapped device may be absent before it is removed.
    pub grace_cycles: u32,
    /// Local or entity ids to map; empty maps every classified device.
    pub selection: Vec<String>,
}

#[derive(Debug, Clone)]
enum CloudRequest {
    Upsert(DeviceUpsert),
    Remove,
}

impl CloudRequest {
    fn name(&self) -> &'static str {
        match self {
            CloudRequest::Upsert(_) => "upsert",
            CloudRequest::Remove => "remove",
        }
    }
}

#[derive(Debug)]
struct Completion {
    cloud_id: String,
    upsert: bool,
    result: std::result::Result<DateTime<Utc>, String>,
}

struct MapperState {
    entries: BTreeMap<String, MappingEntry>,
    missing_cycles: HashMap<String, u32>,
    /// Cloud ids whose last request failed, with the error.
    unsynced: HashMap<String, String>,
    /// Unmapped cloud ids whose removal failed, resent until it succeeds.
    pending_removals: HashMap<String, String>,
    completions: mpsc::UnboundedReceiver<Completion>,
    generation: u64,
}

pub struct DeviceMapper {
    options: MapperOptions,
    selection: HashSet<String>,
    classifier: Classifier,
    cloud: DynCloud,
    state: Mutex<MapperState>,
    snapshot_tx: watch::Sender<Arc<MappingSnapshot>>,
    in_flight: Arc<DashMap<String, Option<CloudRequest>>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    tasks: parking_lot::Mutex<JoinSet<()>>,
}

impl DeviceMapper {
    pub fn new(options: MapperOptions, classifier: Classifier, cloud: DynCloud) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(MappingSnapshot::default()));
        let (completions_tx, completions) = mpsc::unbounded_channel();
        Self {
            selection: options.selection.iter().cloned().collect(),
            options,
            classifier,
            cloud,
            state: Mutex::new(MapperState {
                entries: BTreeMap::new(),
                missing_cycles: HashMap::new(),
                unsynced: HashMap::new(),
                pending_removals: HashMap::new(),
                completions,
                generation: 0,
            }),
            snapshot_tx,
            in_flight: Arc::new(DashMap::new()),
            completions_tx,
            tasks: parking_lot::Mutex::new(JoinSet::new()),
        }
    }

    /// Receiver of published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MappingSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<MappingSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Cloud ids with a request currently on the wire.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn is_selected(&self, device: &LocalDevice) -> bool {
        self.selection.is_empty()
            || self.selection.contains(&device.local_id)
            || device
                .entities
                .iter()
                .any(|e| self.selection.contains(&e.entity_id))
    }

    /// Bring the mapping table in line with one discovery scan.
    pub async fn reconcile(&self, devices: &[LocalDevice]) -> MappingDiff {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        Self::drain_completions(state);

        let mut diff = MappingDiff::default();
        let mut seen = HashSet::new();

        for device in devices {
            let classification = self.classifier.classify(device);
            let role = classification.role;
            let wanted = role.is_mappable() && self.is_selected(device);

            if !wanted {
                if let Some(entry) = state.entries.remove(&device.local_id) {
                    info!(
                        local_id = %entry.local_id,
                        role = %role,
                        "Device no longer mappable, removing cloud twin"
                    );
                    state.missing_cycles.remove(&entry.local_id);
                    state.unsynced.remove(&entry.cloud_id);
                    self.schedule(&entry.cloud_id, CloudRequest::Remove);
                    diff.removed.push(entry.local_id);
                }
                continue;
            }

            seen.insert(device.local_id.clone());
            state.missing_cycles.remove(&device.local_id);
            let children = device.child_entities();

            let request = match state.entries.get_mut(&device.local_id) {
                None => {
                    let cloud_id = cloud_id_for(&self.options.site_id, &device.local_id);
                    if let Some(owner) = state
                        .entries
                        .values()
                        .find(|e| e.cloud_id == cloud_id)
                    {
                        let conflict = Error::DataConflict {
                            local_id: device.local_id.clone(),
                            detail: format!("cloud id already mapped to {}", owner.local_id),
                        };
                        warn!(error = %conflict, "Skipping device");
                        continue;
                    }
                    let entry = MappingEntry {
                        local_id: device.local_id.clone(),
                        cloud_id,
                        role,
                        name: device.name.clone(),
                        last_synced_at: None,
                        child_entities: children,
                    };
                    info!(
                        local_id = %entry.local_id,
                        cloud_id = %entry.cloud_id,
                        role = %role,
                        tier = ?classification.tier.map(|t| t.number()),
                        "Mapping new device"
                    );
                    state.pending_removals.remove(&entry.cloud_id);
                    let upsert = DeviceUpsert::from_entry(&entry, Some(device));
                    diff.created.push(entry.local_id.clone());
                    state.entries.insert(entry.local_id.clone(), entry);
                    Some(upsert)
                }
                Some(entry) => {
                    if entry.child_entities != children || entry.role != role || entry.name != device.name {
                        debug!(
                            local_id = %entry.local_id,
                            entities = children.len(),
                            "Mapped device changed"
                        );
                        entry.child_entities = children;
                        entry.role = role;
                        entry.name = device.name.clone();
                        diff.updated.push(entry.local_id.clone());
                        Some(DeviceUpsert::from_entry(entry, Some(device)))
                    } else if state.unsynced.contains_key(&entry.cloud_id)
                        && !self.in_flight.contains_key(&entry.cloud_id)
                    {
                        diff.resent.push(entry.local_id.clone());
                        Some(DeviceUpsert::from_entry(entry, Some(device)))
                    } else {
                        None
                    }
                }
            };
            if let Some(upsert) = request {
                let cloud_id = upsert.cloud_id.clone();
                self.schedule(&cloud_id, CloudRequest::Upsert(upsert));
            }
        }

        let absent: Vec<String> = state
            .entries
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for local_id in absent {
            let missed = {
                let counter = state.missing_cycles.entry(local_id.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            if missed > self.options.grace_cycles {
                if let Some(entry) = state.entries.remove(&local_id) {
                    info!(local_id = %local_id, missed, "Device gone past grace period, removing");
                    state.missing_cycles.remove(&local_id);
                    state.unsynced.remove(&entry.cloud_id);
                    self.schedule(&entry.cloud_id, CloudRequest::Remove);
                    diff.removed.push(local_id);
                }
            } else {
                debug!(local_id = %local_id, missed, "Mapped device missing from scan");
                diff.missing.push(local_id);
            }
        }

        let retry_removals: Vec<String> = state
            .pending_removals
            .keys()
            .filter(|cloud_id| !self.in_flight.contains_key(*cloud_id))
            .cloned()
            .collect();
        for cloud_id in retry_removals {
            debug!(cloud_id = %cloud_id, "Retrying cloud device removal");
            self.schedule(&cloud_id, CloudRequest::Remove);
        }

        self.publish(state);
        if !diff.is_empty() {
            info!(
                created = diff.created.len(),
                updated = diff.updated.len(),
                removed = diff.removed.len(),
                missing = diff.missing.len(),
                mapped = state.entries.len(),
                "Reconciliation finished"
            );
        }
        diff
    }

    /// Queue every mapped device for a fresh upsert on the next pass.
    pub async fn mark_all_unsynced(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        for entry in state.entries.values() {
            state
                .unsynced
                .entry(entry.cloud_id.clone())
                .or_insert_with(|| "resync requested".to_string());
        }
    }

    /// Wait for every background cloud request, then fold their results into
    /// the table.
    pub async fn flush(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Cloud sync task ended abnormally");
                }
            }
        }
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if Self::drain_completions(state) {
            self.publish(state);
        }
    }

    /// Give background requests up to `grace` to finish, then abandon them.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        if tokio::time::timeout(grace, self.flush()).await.is_err() {
            let mut tasks = self.tasks.lock();
            warn!(pending = tasks.len(), "Abandoning cloud sync requests at shutdown");
            tasks.abort_all();
        }
    }

    /// Cloud ids whose last request failed, including removals still owed.
    pub async fn unsynced(&self) -> HashMap<String, String> {
        let state = self.state.lock().await;
        let mut unsynced = state.unsynced.clone();
        unsynced.extend(state.pending_removals.clone());
        unsynced
    }

    fn publish(&self, state: &mut MapperState) {
        state.generation += 1;
        let snapshot = MappingSnapshot::build(&state.entries, state.generation);
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }

    /// Returns whether any mapped entry changed.
    fn drain_completions(state: &mut MapperState) -> bool {
        let mut changed = false;
        while let Ok(done) = state.completions.try_recv() {
            match done.result {
                Ok(at) => {
                    state.unsynced.remove(&done.cloud_id);
                    if !done.upsert {
                        state.pending_removals.remove(&done.cloud_id);
                    }
                    if done.upsert {
                        if let Some(entry) = state.entries.values_mut().find(|e| e.cloud_id == done.cloud_id) {
                            entry.last_synced_at = Some(at);
                            changed = true;
                        }
                    }
                }
                Err(error) => {
                    let still_mapped = state.entries.values().any(|e| e.cloud_id == done.cloud_id);
                    if done.upsert && still_mapped {
                        state.unsynced.insert(done.cloud_id, error);
                    } else if !done.upsert && !still_mapped {
                        state.pending_removals.insert(done.cloud_id, error);
                    }
                }
            }
        }
        changed
    }

    /// Send `request` for `cloud_id`, or queue it behind the one in flight.
    fn schedule(&self, cloud_id: &str, request: CloudRequest) {
        match self.in_flight.entry(cloud_id.to_string()) {
            Entry::Occupied(mut queued) => {
                debug!(cloud_id, request = request.name(), "Request in flight, queueing follow-up");
                *queued.get_mut() = Some(request);
            }
            Entry::Vacant(slot) => {
                slot.insert(None);
                let cloud = self.cloud.clone();
                let in_flight = self.in_flight.clone();
                let completions = self.completions_tx.clone();
                let cloud_id = cloud_id.to_string();
                let mut tasks = self.tasks.lock();
                // drop results of finished tasks
                while tasks.try_join_next().is_some() {}
                tasks.spawn(run_requests(cloud, in_flight, completions, cloud_id, request));
            }
        }
    }
}

async fn run_requests(
    cloud: DynCloud,
    in_flight: Arc<DashMap<String, Option<CloudRequest>>>,
    completions: mpsc::UnboundedSender<Completion>,
    cloud_id: String,
    mut request: CloudRequest,
) {
    loop {
        let upsert = matches!(request, CloudRequest::Upsert(_));
        let result = match &request {
            CloudRequest::Upsert(device) => cloud.upsert_device(device).await,
            CloudRequest::Remove => cloud.remove_device(&cloud_id).await,
        };
        let result = match result {
            Ok(()) => {
                debug!(cloud_id = %cloud_id, request = request.name(), "Cloud device synced");
                Ok(Utc::now())
            }
            Err(e) => {
                warn!(cloud_id = %cloud_id, request = request.name(), error = %e, "Cloud device sync failed");
                Err(e.to_string())
            }
        };
        // receiver lives as long as the mapper
        let _ = completions.send(Completion {
            cloud_id: cloud_id.clone(),
            upsert,
            result,
        });

        match in_flight.entry(cloud_id.clone()) {
            Entry::Occupied(mut slot) => match slot.get_mut().take() {
                Some(next) => request = next,
                None => {
                    slot.remove();
                    break;
                }
            },
            Entry::Vacant(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kraftsync_core::DeviceRole;

    #[test]
    fn test_cloud_id_is_stable_and_site_scoped() {
        let a = cloud_id_for("site-a", "easee_1");
        assert_eq!(a, cloud_id_for("site-a", "easee_1"));
        assert_ne!(a, cloud_id_for("site-b", "easee_1"));
        assert_ne!(a, cloud_id_for("site-a", "easee_2"));
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_snapshot_reverse_index() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "m1".to_string(),
            MappingEntry {
                local_id: "m1".into(),
                cloud_id: "c1".into(),
                role: DeviceRole::PowerMeter,
                name: "Meter".into(),
                last_synced_at: None,
                child_entities: vec![kraftsync_core::ChildEntity {
                    entity_id: "sensor.m1_power".into(),
                    capability: kraftsync_core::Capability::Power,
                    kind: kraftsync_core::EntityKind::Sensor,
                }],
            },
        );
        let snapshot = MappingSnapshot::build(&entries, 7);
        assert_eq!(snapshot.by_cloud_id("c1").unwrap().local_id, "m1");
        assert!(snapshot.by_cloud_id("m1").is_none());
        assert_eq!(snapshot.owner_of("sensor.m1_power").unwrap().cloud_id, "c1");
        assert_eq!(snapshot.generation(), 7);
    }
}
