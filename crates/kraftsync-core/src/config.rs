//! Bridge configuration.
//!
//! Defaults live in [`defaults`], environment variable names in [`env_vars`].
//! A TOML file is parsed first, then environment variables override it.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::host::SourceKind;
use crate::retry::RetryPolicy;

/// Default values.
pub mod defaults {
    pub const API_URL: &str = "https://api.kraftsync.no/v1";
    pub const HOST_URL: &str = "http://localhost:8123";
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const HOST_TIMEOUT_SECS: u64 = 10;

    pub const TELEMETRY_SECS: u64 = 30;
    pub const COMMAND_POLL_SECS: u64 = 10;
    pub const COMMAND_POLL_MIN_SECS: u64 = 5;
    pub const COMMAND_POLL_MAX_SECS: u64 = 60;
    pub const DISCOVERY_SECS: u64 = 300;

    pub const GRACE_CYCLES: u32 = 3;
    pub const RETRY_BUDGET: u32 = 3;
    pub const MAX_BATCH: usize = 50;
    pub const REFRESH_MARGIN_SECS: u64 = 60;
    pub const SHUTDOWN_GRACE_SECS: u64 = 5;
    pub const STATE_CHANGE_DEBOUNCE_MS: u64 = 5000;

    pub const SIM_SEED: u64 = 42;
    pub const SIM_OCCUPANTS: u8 = 3;
    pub const SIM_TIMEZONE: &str = "Europe/Oslo";
}

/// Environment variable names.
pub mod env_vars {
    pub const API_URL: &str = "KRAFTSYNC_API_URL";
    pub const SITE_ID: &str = "KRAFTSYNC_SITE_ID";
    pub const HOST_URL: &str = "KRAFTSYNC_HOST_URL";
    pub const HOST_TOKEN: &str = "KRAFTSYNC_HOST_TOKEN";
    pub const ACCESS_TOKEN: &str = "KRAFTSYNC_ACCESS_TOKEN";
    pub const REFRESH_TOKEN: &str = "KRAFTSYNC_REFRESH_TOKEN";
    pub const SOURCE: &str = "KRAFTSYNC_SOURCE";
    pub const LOG_JSON: &str = "KRAFTSYNC_LOG_JSON";
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSection {
    pub api_url: String,
    pub site_id: String,
    pub request_timeout_secs: u64,
    /// Initial grant; the credential store wins once it holds one.
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            api_url: defaults::API_URL.to_string(),
            site_id: String::new(),
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            access_token: None,
            refresh_token: None,
        }
    }
}

impl fmt::Debug for CloudSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudSection")
            .field("api_url", &self.api_url)
            .field("site_id", &self.site_id)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    pub url: String,
    pub token: String,
    pub verify_ssl: bool,
    pub timeout_secs: u64,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            url: defaults::HOST_URL.to_string(),
            token: String::new(),
            verify_ssl: true,
            timeout_secs: defaults::HOST_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for HostSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSection")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("verify_ssl", &self.verify_ssl)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalSection {
    pub telemetry_secs: u64,
    pub command_poll_secs: u64,
    pub discovery_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Control state changes arriving within this window share one push.
    pub state_change_debounce_ms: u64,
}

impl Default for IntervalSection {
    fn default() -> Self {
        Self {
            telemetry_secs: defaults::TELEMETRY_SECS,
            command_poll_secs: defaults::COMMAND_POLL_SECS,
            discovery_secs: defaults::DISCOVERY_SECS,
            shutdown_grace_secs: defaults::SHUTDOWN_GRACE_SECS,
            state_change_debounce_ms: defaults::STATE_CHANGE_DEBOUNCE_MS,
        }
    }
}

impl IntervalSection {
    pub fn telemetry(&self) -> Duration {
        Duration::from_secs(self.telemetry_secs)
    }

    /// Command poll interval, clamped to 5..=60 seconds.
    pub fn command_poll(&self) -> Duration {
        Duration::from_secs(self.command_poll_secs.clamp(
            defaults::COMMAND_POLL_MIN_SECS,
            defaults::COMMAND_POLL_MAX_SECS,
        ))
    }

    pub fn discovery(&self) -> Duration {
        Duration::from_secs(self.discovery_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn state_change_debounce(&self) -> Duration {
        Duration::from_millis(self.state_change_debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSection {
    /// Discovery cycles a vanished device stays mapped.
    pub grace_cycles: u32,
    /// Local device or entity ids to map. Empty maps every classified device.
    pub selection: Vec<String>,
}

impl Default for MappingSection {
    fn default() -> Self {
        Self {
            grace_cycles: defaults::GRACE_CYCLES,
            selection: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// Consecutive failed cycles before a device is reported unavailable.
    pub retry_budget: u32,
    /// Use the batch endpoint when the cloud supports it.
    pub batch: bool,
    pub max_batch: usize,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            retry_budget: defaults::RETRY_BUDGET,
            batch: true,
            max_batch: defaults::MAX_BATCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSection {
    pub refresh_margin_secs: u64,
}

impl Default for TokenSection {
    fn default() -> Self {
        Self {
            refresh_margin_secs: defaults::REFRESH_MARGIN_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingType {
    Home,
    Cabin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceMode {
    Home,
    Away,
    Vacation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    pub seed: u64,
    pub building: BuildingType,
    pub presence: PresenceMode,
    pub occupants: u8,
    /// IANA zone of the simulated site, used for daily load patterns.
    pub timezone: String,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            seed: defaults::SIM_SEED,
            building: BuildingType::Home,
            presence: PresenceMode::Home,
            occupants: defaults::SIM_OCCUPANTS,
            timezone: defaults::SIM_TIMEZONE.to_string(),
        }
    }
}

/// Full bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub cloud: CloudSection,
    pub host: HostSection,
    pub intervals: IntervalSection,
    pub mapping: MappingSection,
    pub telemetry: TelemetrySection,
    pub retry: RetryPolicy,
    pub token: TokenSection,
    pub source: SourceKind,
    pub simulation: SimulationSection,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cloud: CloudSection::default(),
            host: HostSection::default(),
            intervals: IntervalSection::default(),
            mapping: MappingSection::default(),
            telemetry: TelemetrySection::default(),
            retry: RetryPolicy::default(),
            token: TokenSection::default(),
            source: SourceKind::Host,
            simulation: SimulationSection::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse a TOML document without applying the environment.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup; empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(env_vars::API_URL) {
            self.cloud.api_url = v;
        }
        if let Some(v) = get(env_vars::SITE_ID) {
            self.cloud.site_id = v;
        }
        if let Some(v) = get(env_vars::ACCESS_TOKEN) {
            self.cloud.access_token = Some(v);
        }
        if let Some(v) = get(env_vars::REFRESH_TOKEN) {
            self.cloud.refresh_token = Some(v);
        }
        if let Some(v) = get(env_vars::HOST_URL) {
            self.host.url = v;
        }
        if let Some(v) = get(env_vars::HOST_TOKEN) {
            self.host.token = v;
        }
        if let Some(v) = get(env_vars::SOURCE) {
            match v.to_ascii_lowercase().as_str() {
                "host" => self.source = SourceKind::Host,
                "simulation" | "sim" => self.source = SourceKind::Simulation,
                other => tracing::warn!(value = other, "Ignoring unknown {}", env_vars::SOURCE),
            }
        }
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cloud.site_id.trim().is_empty() {
            return Err(Error::Config("cloud.site_id must not be empty".into()));
        }
        check_url("cloud.api_url", &self.cloud.api_url)?;
        if self.source == SourceKind::Host {
            check_url("host.url", &self.host.url)?;
        }
        let intervals = [
            ("intervals.telemetry_secs", self.intervals.telemetry_secs),
            ("intervals.command_poll_secs", self.intervals.command_poll_secs),
            ("intervals.discovery_secs", self.intervals.discovery_secs),
            ("cloud.request_timeout_secs", self.cloud.request_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.telemetry.max_batch == 0 {
            return Err(Error::Config("telemetry.max_batch must be greater than zero".into()));
        }
        if !(1..=8).contains(&self.simulation.occupants) {
            return Err(Error::Config("simulation.occupants must be between 1 and 8".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud.request_timeout_secs)
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token.refresh_margin_secs as i64)
    }
}

fn check_url(name: &str, url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must be an http(s) URL, got '{}'", name, url)))
    }
}

/// Whether JSON log output was requested through the environment.
pub fn log_json_requested() -> bool {
    std::env::var(env_vars::LOG_JSON)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
