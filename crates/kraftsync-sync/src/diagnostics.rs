//! Redacted diagnostics snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;

use kraftsync_cloud::TokenState;
use kraftsync_core::{DeviceRole, MappingEntry, SourceKind};

use crate::poller::CommandStats;
use crate::publisher::PublisherStats;
use crate::status::LoopStatus;

/// Shorten an identifier to its first and last four characters.
pub fn redact(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceDiagnostics {
    pub local_id: String,
    pub cloud_id: String,
    pub role: DeviceRole,
    pub sensors: usize,
    pub controls: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl DeviceDiagnostics {
    pub fn from_entry(entry: &MappingEntry) -> Self {
        Self {
            local_id: redact(&entry.local_id),
            cloud_id: redact(&entry.cloud_id),
            role: entry.role,
            sensors: entry.sensors().count(),
            controls: entry.controls().count(),
            last_synced_at: entry.last_synced_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub generated_at: DateTime<Utc>,
    pub site_id: String,
    pub source: SourceKind,
    pub host: String,
    /// `None` when tokens are managed outside the bridge
    pub token_state: Option<TokenState>,
    pub token_refreshes: Option<u64>,
    pub mapped_devices: usize,
    pub devices: Vec<DeviceDiagnostics>,
    pub loops: Vec<LoopStatus>,
    pub telemetry: PublisherStats,
    pub commands: CommandStats,
}

impl Diagnostics {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact() {
        assert_eq!(redact("easee_charger_1234"), "ease...1234");
        assert_eq!(redact("short"), "****");
        assert_eq!(redact("12345678"), "****");
        assert_eq!(redact("123456789"), "1234...6789");
    }
}
