//! Device role classification.
//!
//! Three ordered tiers, first match wins:
//!
//! 1. integration domain (`easee`, `tibber`, ...)
//! 2. platform device class (`water_heater`, `energy`, ...)
//! 3. keywords in the display name and local id, Norwegian and English
//!
//! Within a tier the first table entry that matches wins, so table order is
//! part of the behavior.

use serde::{Deserialize, Serialize};

use kraftsync_core::{DeviceRole, LocalDevice};

/// Which tier produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    Domain,
    DeviceClass,
    Keyword,
}

impl ConfidenceTier {
    /// 1-based tier number.
    pub fn number(&self) -> u8 {
        match self {
            ConfidenceTier::Domain => 1,
            ConfidenceTier::DeviceClass => 2,
            ConfidenceTier::Keyword => 3,
        }
    }

    pub fn confidence(&self) -> &'static str {
        match self {
            ConfidenceTier::Domain => "high",
            ConfidenceTier::DeviceClass => "medium",
            ConfidenceTier::Keyword => "low",
        }
    }
}

/// Result of classifying one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub role: DeviceRole,
    /// `None` when no tier matched.
    pub tier: Option<ConfidenceTier>,
    /// Table key that matched.
    pub matched: Option<String>,
}

impl Classification {
    pub fn unknown() -> Self {
        Self {
            role: DeviceRole::Unknown,
            tier: None,
            matched: None,
        }
    }

    fn hit(role: DeviceRole, tier: ConfidenceTier, matched: &str) -> Self {
        Self {
            role,
            tier: Some(tier),
            matched: Some(matched.to_string()),
        }
    }
}

/// A keyword rule of the third tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordRule {
    pub token: String,
    pub role: DeviceRole,
    /// Require the token to stand alone, so `ams` does not match `hamster`.
    pub whole_word: bool,
}

impl KeywordRule {
    pub fn new(token: &str, role: DeviceRole, whole_word: bool) -> Self {
        Self {
            token: token.to_lowercase(),
            role,
            whole_word,
        }
    }

    fn matches(&self, text: &str, words: &[&str]) -> bool {
        if self.whole_word {
            words.iter().any(|w| *w == self.token)
        } else {
            text.contains(&self.token)
        }
    }
}

const DOMAIN_TABLE: &[(&str, DeviceRole)] = &[
    ("easee", DeviceRole::EvCharger),
    ("zaptec", DeviceRole::EvCharger),
    ("wallbox", DeviceRole::EvCharger),
    ("ocpp", DeviceRole::EvCharger),
    ("go_echarger", DeviceRole::EvCharger),
    ("ohme", DeviceRole::EvCharger),
    ("tibber", DeviceRole::PowerMeter),
    ("amshan", DeviceRole::PowerMeter),
    ("elvia", DeviceRole::PowerMeter),
    ("hoiax", DeviceRole::WaterHeater),
    ("osoenergy", DeviceRole::WaterHeater),
    ("shelly", DeviceRole::SmartPlug),
    ("tplink", DeviceRole::SmartPlug),
    ("tuya", DeviceRole::SmartPlug),
    ("tasmota", DeviceRole::SmartPlug),
];

const DEVICE_CLASS_TABLE: &[(&str, DeviceRole)] = &[
    ("water_heater", DeviceRole::WaterHeater),
    ("ev_charger", DeviceRole::EvCharger),
    ("energy", DeviceRole::PowerMeter),
    ("power", DeviceRole::PowerMeter),
    ("outlet", DeviceRole::SmartPlug),
];

const KEYWORD_TABLE: &[(&str, DeviceRole, bool)] = &[
    ("varmtvannsbereder", DeviceRole::WaterHeater, false),
    ("varmtvann", DeviceRole::WaterHeater, false),
    ("bereder", DeviceRole::WaterHeater, false),
    ("water heater", DeviceRole::WaterHeater, false),
    ("boiler", DeviceRole::WaterHeater, false),
    ("elbillader", DeviceRole::EvCharger, false),
    ("elbil", DeviceRole::EvCharger, false),
    ("lader", DeviceRole::EvCharger, false),
    ("charger", DeviceRole::EvCharger, false),
    ("wallbox", DeviceRole::EvCharger, false),
    ("strømmåler", DeviceRole::PowerMeter, false),
    ("måler", DeviceRole::PowerMeter, false),
    ("ams", DeviceRole::PowerMeter, true),
    ("han", DeviceRole::PowerMeter, true),
    ("meter", DeviceRole::PowerMeter, true),
    ("stikkontakt", DeviceRole::SmartPlug, false),
    ("plugg", DeviceRole::SmartPlug, false),
    ("plug", DeviceRole::SmartPlug, true),
    ("outlet", DeviceRole::SmartPlug, true),
];

/// Ordered three-tier classifier. Tables are immutable after construction.
#[derive(Debug, Clone)]
pub struct Classifier {
    domains: Vec<(String, DeviceRole)>,
    device_classes: Vec<(String, DeviceRole)>,
    keywords: Vec<KeywordRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// Classifier with the built-in tables.
    pub fn new() -> Self {
        Self::with_tables(
            DOMAIN_TABLE.iter().map(|(k, r)| (k.to_string(), *r)).collect(),
            DEVICE_CLASS_TABLE
                .iter()
                .map(|(k, r)| (k.to_string(), *r))
                .collect(),
            KEYWORD_TABLE
                .iter()
                .map(|(t, r, w)| KeywordRule::new(t, *r, *w))
                .collect(),
        )
    }

    /// Classifier with custom tables, evaluated in the given order.
    pub fn with_tables(
        domains: Vec<(String, DeviceRole)>,
        device_classes: Vec<(String, DeviceRole)>,
        keywords: Vec<KeywordRule>,
    ) -> Self {
        let lower = |t: Vec<(String, DeviceRole)>| {
            t.into_iter()
                .map(|(k, r)| (k.to_lowercase(), r))
                .collect::<Vec<_>>()
        };
        Self {
            domains: lower(domains),
            device_classes: lower(device_classes),
            keywords,
        }
    }

    /// Classify a device. Deterministic for identical input.
    pub fn classify(&self, device: &LocalDevice) -> Classification {
        if let Some(integration) = device.integration.as_deref() {
            let integration = integration.to_lowercase();
            if let Some((key, role)) = self.domains.iter().find(|(k, _)| *k == integration) {
                return Classification::hit(*role, ConfidenceTier::Domain, key);
            }
        }

        if let Some(class) = device.device_class.as_deref() {
            let class = class.to_lowercase();
            if let Some((key, role)) = self.device_classes.iter().find(|(k, _)| *k == class) {
                return Classification::hit(*role, ConfidenceTier::DeviceClass, key);
            }
        }

        let text = format!("{} {}", device.name, device.local_id).to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        if let Some(rule) = self.keywords.iter().find(|r| r.matches(&text, &words)) {
            return Classification::hit(rule.role, ConfidenceTier::Keyword, &rule.token);
        }

        Classification::unknown()
    }
}
