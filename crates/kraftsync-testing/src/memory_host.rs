//! In-memory host platform
//!
//! Scriptable stand-in for the local device platform: devices and entity
//! states are set by the test, actions are recorded and applied to the
//! stored states, failures can be injected per entity.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;

use kraftsync_core::{
    EntitySnapshot, Error, HostAction, HostEvent, HostPlatform, LocalDevice, Result,
};

#[derive(Default)]
struct Concurrency {
    current: HashMap<String, u32>,
    max: HashMap<String, u32>,
}

/// Host platform backed by plain data.
pub struct MemoryHost {
    devices: RwLock<Vec<LocalDevice>>,
    actions: Mutex<Vec<HostAction>>,
    failing_entities: Mutex<HashSet<String>>,
    invoke_delay: Mutex<Option<Duration>>,
    fail_discover: AtomicBool,
    discover_calls: AtomicU32,
    concurrency: Mutex<Concurrency>,
    events: broadcast::Sender<HostEvent>,
}

impl MemoryHost {
    pub fn new(devices: Vec<LocalDevice>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            devices: RwLock::new(devices),
            actions: Mutex::new(Vec::new()),
            failing_entities: Mutex::new(HashSet::new()),
            invoke_delay: Mutex::new(None),
            fail_discover: AtomicBool::new(false),
            discover_calls: AtomicU32::new(0),
            concurrency: Mutex::new(Concurrency::default()),
            events,
        }
    }

    pub fn set_devices(&self, devices: Vec<LocalDevice>) {
        *self.devices.write() = devices;
    }

    pub fn add_device(&self, device: LocalDevice) {
        self.devices.write().push(device);
    }

    pub fn remove_device(&self, local_id: &str) {
        self.devices.write().retain(|d| d.local_id != local_id);
    }

    /// Add an entity to an existing device.
    pub fn add_entity(&self, local_id: &str, entity: EntitySnapshot) {
        if let Some(device) = self.devices.write().iter_mut().find(|d| d.local_id == local_id) {
            device.entities.push(entity);
        }
    }

    fn with_entity<R>(&self, entity_id: &str, f: impl FnOnce(&mut EntitySnapshot) -> R) -> Option<R> {
        let mut devices = self.devices.write();
        devices
            .iter_mut()
            .flat_map(|d| d.entities.iter_mut())
            .find(|e| e.entity_id == entity_id)
            .map(f)
    }

    pub fn set_state(&self, entity_id: &str, state: impl Into<String>) {
        let state = state.into();
        self.with_entity(entity_id, |e| e.state = Some(state));
    }

    pub fn set_attribute(&self, entity_id: &str, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.with_entity(entity_id, |e| {
            e.attributes.insert(key.to_string(), value);
        });
    }

    pub fn state_of(&self, entity_id: &str) -> Option<String> {
        self.with_entity(entity_id, |e| e.state.clone()).flatten()
    }

    /// Invocations on this entity fail with a host error.
    pub fn fail_invocations_for(&self, entity_id: &str) {
        self.failing_entities.lock().insert(entity_id.to_string());
    }

    pub fn set_invoke_delay(&self, delay: Duration) {
        *self.invoke_delay.lock() = Some(delay);
    }

    pub fn fail_discover(&self, fail: bool) {
        self.fail_discover.store(fail, Ordering::SeqCst);
    }

    pub fn discover_calls(&self) -> u32 {
        self.discover_calls.load(Ordering::SeqCst)
    }

    /// Recorded actions, in invocation order.
    pub fn actions(&self) -> Vec<HostAction> {
        self.actions.lock().clone()
    }

    pub fn actions_for(&self, entity_id: &str) -> Vec<HostAction> {
        self.actions
            .lock()
            .iter()
            .filter(|a| a.entity_id == entity_id)
            .cloned()
            .collect()
    }

    /// Highest number of overlapping invocations seen for one entity.
    pub fn max_concurrent_invocations(&self, entity_id: &str) -> u32 {
        self.concurrency
            .lock()
            .max
            .get(entity_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    fn apply(&self, action: &HostAction) {
        let data = &action.data;
        match action.service.as_str() {
            "turn_on" => self.set_state(&action.entity_id, "on"),
            "turn_off" => self.set_state(&action.entity_id, "off"),
            "set_temperature" => {
                if let Some(t) = data.get("temperature") {
                    self.set_attribute(&action.entity_id, "temperature", t.clone());
                }
            }
            "set_operation_mode" => {
                if let Some(mode) = data.get("operation_mode").and_then(Value::as_str) {
                    self.set_state(&action.entity_id, mode);
                }
            }
            "set_value" | "select_option" => {
                let value = data.get("value").or_else(|| data.get("option"));
                if let Some(v) = value {
                    let s = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    self.set_state(&action.entity_id, s);
                }
            }
            _ => {}
        }
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl HostPlatform for MemoryHost {
    fn name(&self) -> &str {
        "memory"
    }

    async fn discover(&self) -> Result<Vec<LocalDevice>> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_discover.load(Ordering::SeqCst) {
            return Err(Error::Host("discovery failed".into()));
        }
        Ok(self.devices.read().clone())
    }

    async fn read_entities(&self, entity_ids: &[String]) -> Result<Vec<EntitySnapshot>> {
        let devices = self.devices.read();
        Ok(devices
            .iter()
            .flat_map(|d| d.entities.iter())
            .filter(|e| entity_ids.contains(&e.entity_id))
            .cloned()
            .collect())
    }

    async fn invoke(&self, action: &HostAction) -> Result<()> {
        self.actions.lock().push(action.clone());
        {
            let mut c = self.concurrency.lock();
            let current = c.current.entry(action.entity_id.clone()).or_insert(0);
            *current += 1;
            let now = *current;
            let max = c.max.entry(action.entity_id.clone()).or_insert(0);
            *max = (*max).max(now);
        }

        let delay = *self.invoke_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.failing_entities.lock().contains(&action.entity_id) {
            Err(Error::Host(format!("{} refused {}", action.entity_id, action.service)))
        } else {
            match self.with_entity(&action.entity_id, |e| e.is_available()) {
                None => Err(Error::EntityUnavailable(action.entity_id.clone())),
                Some(false) => Err(Error::EntityUnavailable(action.entity_id.clone())),
                Some(true) => {
                    self.apply(action);
                    Ok(())
                }
            }
        };

        if let Some(current) = self.concurrency.lock().current.get_mut(&action.entity_id) {
            *current = current.saturating_sub(1);
        }
        result
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<HostEvent>> {
        Some(self.events.subscribe())
    }
}
