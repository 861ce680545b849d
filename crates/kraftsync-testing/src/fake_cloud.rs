//! Fake cloud platform
//!
//! Implements the raw transport and the token refresher so tests can run the
//! real [`AuthedCloud`] wrapper against it. Everything sent is recorded;
//! failures, per-item rejections and token revocation are scriptable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use kraftsync_cloud::{
    AuthedCloud, BatchOutcome, CloudTransport, CommandPage, DeviceUpsert, ItemStatus,
    TokenManager, TokenRefresher,
};
use kraftsync_core::{
    CloudCommand, CommandAck, Credential, DeviceEvent, Error, Result, RetryPolicy,
    TelemetrySample,
};

/// Token accepted by a fresh fake cloud.
pub const INITIAL_TOKEN: &str = "token-0";

#[derive(Default)]
struct State {
    valid_tokens: HashSet<String>,
    issued: u32,
    reject_refresh: bool,
    refresh_calls: u32,
    auth_rejections: u32,

    upserts: Vec<DeviceUpsert>,
    removals: Vec<String>,
    batches: Vec<Vec<TelemetrySample>>,
    single_pushes: Vec<TelemetrySample>,
    events: Vec<DeviceEvent>,
    acks: Vec<CommandAck>,
    acked: HashSet<String>,
    pending: Vec<CloudCommand>,
    polls: Vec<Option<String>>,

    batch_unsupported: bool,
    rejected_devices: HashSet<String>,
    failing_devices: HashSet<String>,
    scripted: HashMap<&'static str, VecDeque<Error>>,
    upsert_delay: Option<Duration>,
    upserts_in_flight: HashMap<String, u32>,
    max_upserts_in_flight: HashMap<String, u32>,
}

/// Recording fake of the cloud REST API.
pub struct FakeCloud {
    state: Mutex<State>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    pub fn new() -> Self {
        let mut state = State::default();
        state.valid_tokens.insert(INITIAL_TOKEN.to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    /// Credential matching [`INITIAL_TOKEN`], valid for an hour.
    pub fn initial_credential() -> Credential {
        Credential {
            access_token: INITIAL_TOKEN.to_string(),
            refresh_token: "refresh-0".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    /// Token manager wired to this fake, holding the initial credential.
    pub async fn token_manager(self: &Arc<Self>) -> Arc<TokenManager> {
        let tokens = TokenManager::new("test-site", self.clone(), chrono::Duration::seconds(60));
        // no store configured, so install cannot fail
        let _ = tokens.install(Self::initial_credential()).await;
        Arc::new(tokens)
    }

    /// Authenticated API over this fake without retry delays.
    pub async fn authed(self: &Arc<Self>) -> Arc<AuthedCloud<FakeCloud>> {
        let tokens = self.token_manager().await;
        Arc::new(AuthedCloud::new(self.clone(), tokens, RetryPolicy::none()))
    }

    // ---- scripting ----

    /// Invalidate every issued access token.
    pub fn revoke_tokens(&self) {
        self.state.lock().valid_tokens.clear();
    }

    pub fn reject_refresh(&self, reject: bool) {
        self.state.lock().reject_refresh = reject;
    }

    /// Answer the batch endpoint with "not supported".
    pub fn disable_batch(&self) {
        self.state.lock().batch_unsupported = true;
    }

    /// Reject this device's items in batches.
    pub fn reject_device(&self, cloud_id: &str) {
        self.state.lock().rejected_devices.insert(cloud_id.to_string());
    }

    /// Fail single-device pushes for this device with a transient error.
    pub fn fail_device(&self, cloud_id: &str) {
        self.state.lock().failing_devices.insert(cloud_id.to_string());
    }

    pub fn clear_device_failures(&self) {
        let mut state = self.state.lock();
        state.failing_devices.clear();
        state.rejected_devices.clear();
    }

    /// Fail the next call of `op` (e.g. `"ack_command"`) with `error`.
    pub fn fail_next(&self, op: &'static str, error: Error) {
        self.state
            .lock()
            .scripted
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn set_upsert_delay(&self, delay: Duration) {
        self.state.lock().upsert_delay = Some(delay);
    }

    pub fn enqueue_command(&self, command: CloudCommand) {
        self.state.lock().pending.push(command);
    }

    // ---- inspection ----

    pub fn upserts(&self) -> Vec<DeviceUpsert> {
        self.state.lock().upserts.clone()
    }

    pub fn removals(&self) -> Vec<String> {
        self.state.lock().removals.clone()
    }

    pub fn batches(&self) -> Vec<Vec<TelemetrySample>> {
        self.state.lock().batches.clone()
    }

    pub fn single_pushes(&self) -> Vec<TelemetrySample> {
        self.state.lock().single_pushes.clone()
    }

    /// Every sample received, batched or not, in arrival order.
    pub fn all_samples(&self) -> Vec<TelemetrySample> {
        let state = self.state.lock();
        let mut all: Vec<TelemetrySample> = state.batches.iter().flatten().cloned().collect();
        all.extend(state.single_pushes.iter().cloned());
        all
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.lock().events.clone()
    }

    pub fn acks(&self) -> Vec<CommandAck> {
        self.state.lock().acks.clone()
    }

    pub fn pending_commands(&self) -> Vec<CloudCommand> {
        self.state.lock().pending.clone()
    }

    pub fn polls(&self) -> Vec<Option<String>> {
        self.state.lock().polls.clone()
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.lock().refresh_calls
    }

    pub fn auth_rejections(&self) -> u32 {
        self.state.lock().auth_rejections
    }

    pub fn max_upserts_in_flight(&self, cloud_id: &str) -> u32 {
        self.state
            .lock()
            .max_upserts_in_flight
            .get(cloud_id)
            .copied()
            .unwrap_or(0)
    }

    // ---- internals ----

    fn gate(&self, op: &'static str, token: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.valid_tokens.contains(token) {
            state.auth_rejections += 1;
            return Err(Error::Auth(format!("401: token rejected for {}", op)));
        }
        if let Some(err) = state.scripted.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudTransport for FakeCloud {
    async fn upsert_device(&self, token: &str, device: &DeviceUpsert) -> Result<()> {
        self.gate("upsert_device", token)?;
        let delay = {
            let mut state = self.state.lock();
            let current = state
                .upserts_in_flight
                .entry(device.cloud_id.clone())
                .or_insert(0);
            *current += 1;
            let now = *current;
            let max = state
                .max_upserts_in_flight
                .entry(device.cloud_id.clone())
                .or_insert(0);
            *max = (*max).max(now);
            state.upsert_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(current) = state.upserts_in_flight.get_mut(&device.cloud_id) {
            *current -= 1;
        }
        state.upserts.push(device.clone());
        Ok(())
    }

    async fn remove_device(&self, token: &str, cloud_id: &str) -> Result<()> {
        self.gate("remove_device", token)?;
        self.state.lock().removals.push(cloud_id.to_string());
        Ok(())
    }

    async fn push_telemetry(&self, token: &str, samples: &[TelemetrySample]) -> Result<BatchOutcome> {
        self.gate("push_telemetry", token)?;
        let mut state = self.state.lock();
        if state.batch_unsupported {
            return Err(Error::Unsupported("POST /telemetry".into()));
        }
        state.batches.push(samples.to_vec());
        let results = samples
            .iter()
            .map(|s| {
                let rejected = state.rejected_devices.contains(&s.cloud_id);
                ItemStatus {
                    cloud_id: s.cloud_id.clone(),
                    accepted: !rejected,
                    error: rejected.then(|| "rejected".to_string()),
                }
            })
            .collect();
        Ok(BatchOutcome { results })
    }

    async fn push_device_telemetry(&self, token: &str, sample: &TelemetrySample) -> Result<()> {
        self.gate("push_device_telemetry", token)?;
        let mut state = self.state.lock();
        if state.failing_devices.contains(&sample.cloud_id) {
            return Err(Error::NetworkTransient("503".into()));
        }
        state.single_pushes.push(sample.clone());
        Ok(())
    }

    async fn fetch_commands(&self, token: &str, since: Option<&str>) -> Result<CommandPage> {
        self.gate("fetch_commands", token)?;
        let mut state = self.state.lock();
        state.polls.push(since.map(str::to_string));
        let cursor = state.polls.len().to_string();
        Ok(CommandPage {
            commands: state.pending.clone(),
            cursor: Some(cursor),
        })
    }

    async fn ack_command(&self, token: &str, ack: &CommandAck) -> Result<()> {
        self.gate("ack_command", token)?;
        let mut state = self.state.lock();
        state.pending.retain(|c| c.command_id != ack.command_id);
        if state.acked.insert(ack.command_id.clone()) {
            state.acks.push(ack.clone());
        }
        Ok(())
    }

    async fn report_event(&self, token: &str, event: &DeviceEvent) -> Result<()> {
        self.gate("report_event", token)?;
        self.state.lock().events.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl TokenRefresher for FakeCloud {
    async fn refresh(&self, _refresh_token: &str) -> Result<Credential> {
        let mut state = self.state.lock();
        state.refresh_calls += 1;
        if state.reject_refresh {
            return Err(Error::Auth("invalid_grant".into()));
        }
        state.issued += 1;
        let access_token = format!("token-{}", state.issued);
        state.valid_tokens.insert(access_token.clone());
        Ok(Credential {
            access_token,
            refresh_token: format!("refresh-{}", state.issued),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}
