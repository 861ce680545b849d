//! Physical models of the virtual devices.
//!
//! Every model advances by an explicit time delta. Cumulative energy
//! counters only ever grow, and each grows by at most the model's maximum
//! power times the delta.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use kraftsync_core::config::{BuildingType, PresenceMode};

use crate::patterns::{self, HourlyPattern};

// ---- water heater ----

pub const HEATER_POWER_W: f64 = 2000.0;
pub const HEATING_RATE_C_PER_H: f64 = 10.0;
pub const HEAT_LOSS_C_PER_H: f64 = 0.5;
pub const HYSTERESIS_C: f64 = 2.0;
pub const MIN_TANK_C: f64 = 15.0;
pub const MAX_TANK_C: f64 = 85.0;
pub const MIN_TARGET_C: f64 = 40.0;
pub const MAX_TARGET_C: f64 = 75.0;
pub const SHOWER_DROP_C_PER_LITRE: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterHeaterMode {
    Normal,
    Eco,
    Boost,
    Off,
}

impl WaterHeaterMode {
    /// Setpoint a mode selects.
    pub fn default_target(&self) -> Option<f64> {
        match self {
            WaterHeaterMode::Normal => Some(65.0),
            WaterHeaterMode::Eco => Some(55.0),
            WaterHeaterMode::Boost => Some(75.0),
            WaterHeaterMode::Off => None,
        }
    }

    /// Operation mode name as a water heater entity reports it.
    pub fn operation_mode(&self) -> &'static str {
        match self {
            WaterHeaterMode::Normal => "electric",
            WaterHeaterMode::Eco => "eco",
            WaterHeaterMode::Boost => "performance",
            WaterHeaterMode::Off => "off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" | "electric" | "heat" | "on" => Some(WaterHeaterMode::Normal),
            "eco" | "heat_pump" => Some(WaterHeaterMode::Eco),
            "boost" | "performance" | "high_demand" => Some(WaterHeaterMode::Boost),
            "off" => Some(WaterHeaterMode::Off),
            _ => None,
        }
    }
}

/// Thermostatic tank heater.
#[derive(Debug, Clone, PartialEq)]
pub struct WaterHeater {
    pub mode: WaterHeaterMode,
    pub temperature_c: f64,
    pub target_c: f64,
    pub heating: bool,
    pub energy_kwh: f64,
}

impl Default for WaterHeater {
    fn default() -> Self {
        Self {
            mode: WaterHeaterMode::Normal,
            temperature_c: 60.0,
            target_c: 65.0,
            heating: false,
            energy_kwh: 0.0,
        }
    }
}

impl WaterHeater {
    pub fn power_w(&self) -> f64 {
        if self.heating {
            HEATER_POWER_W
        } else {
            0.0
        }
    }

    pub fn step(&mut self, dt_hours: f64) {
        if self.mode == WaterHeaterMode::Off {
            self.heating = false;
        } else if self.temperature_c >= self.target_c {
            self.heating = false;
        } else if self.temperature_c < self.target_c - HYSTERESIS_C {
            self.heating = true;
        }

        if self.heating {
            self.temperature_c += HEATING_RATE_C_PER_H * dt_hours;
            self.energy_kwh += HEATER_POWER_W / 1000.0 * dt_hours;
        }
        self.temperature_c -= HEAT_LOSS_C_PER_H * dt_hours;
        self.temperature_c = self.temperature_c.clamp(MIN_TANK_C, MAX_TANK_C);
    }

    pub fn set_mode(&mut self, mode: WaterHeaterMode) {
        self.mode = mode;
        if let Some(target) = mode.default_target() {
            self.target_c = target;
        }
    }

    pub fn set_target(&mut self, target_c: f64) {
        self.target_c = target_c.clamp(MIN_TARGET_C, MAX_TARGET_C);
    }

    /// Draw hot water; cold inflow lowers the tank temperature.
    pub fn shower(&mut self, litres: f64) {
        let drop = litres.max(0.0) * SHOWER_DROP_C_PER_LITRE;
        self.temperature_c = (self.temperature_c - drop).max(MIN_TANK_C);
    }
}

// ---- EV charger ----

pub const GRID_VOLTAGE_V: f64 = 230.0;
pub const CHARGE_EFFICIENCY: f64 = 0.95;
pub const BATTERY_KWH: f64 = 60.0;
pub const MIN_CURRENT_A: f64 = 6.0;
pub const MAX_CURRENT_A: f64 = 32.0;
pub const DEFAULT_CURRENT_A: f64 = 16.0;
pub const CURRENT_RAMP_A_PER_SEC: f64 = 1.0;
pub const DEFAULT_SOC: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargerStatus {
    Disconnected,
    Connected,
    Charging,
    Complete,
}

impl ChargerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargerStatus::Disconnected => "disconnected",
            ChargerStatus::Connected => "connected",
            ChargerStatus::Charging => "charging",
            ChargerStatus::Complete => "completed",
        }
    }
}

/// Single-phase charger with one vehicle session.
#[derive(Debug, Clone, PartialEq)]
pub struct EvCharger {
    pub connected: bool,
    pub enabled: bool,
    pub soc_percent: f64,
    pub current_limit_a: f64,
    pub current_a: f64,
    pub session_kwh: f64,
    pub total_kwh: f64,
}

impl Default for EvCharger {
    fn default() -> Self {
        Self {
            connected: true,
            enabled: false,
            soc_percent: DEFAULT_SOC,
            current_limit_a: DEFAULT_CURRENT_A,
            current_a: 0.0,
            session_kwh: 0.0,
            total_kwh: 0.0,
        }
    }
}

impl EvCharger {
    pub fn status(&self) -> ChargerStatus {
        if !self.connected {
            ChargerStatus::Disconnected
        } else if self.soc_percent >= 100.0 {
            ChargerStatus::Complete
        } else if self.enabled && self.current_a > 0.0 {
            ChargerStatus::Charging
        } else {
            ChargerStatus::Connected
        }
    }

    pub fn power_w(&self) -> f64 {
        GRID_VOLTAGE_V * self.current_a
    }

    pub fn step(&mut self, dt_secs: f64) {
        let wanted = if self.connected && self.enabled && self.soc_percent < 100.0 {
            self.current_limit_a
        } else {
            0.0
        };
        let max_change = CURRENT_RAMP_A_PER_SEC * dt_secs;
        let delta = (wanted - self.current_a).clamp(-max_change, max_change);
        self.current_a = (self.current_a + delta).max(0.0);

        let energy = self.power_w() / 1000.0 * dt_secs / 3600.0;
        self.session_kwh += energy;
        self.total_kwh += energy;
        if self.connected {
            let gained = energy * CHARGE_EFFICIENCY / BATTERY_KWH * 100.0;
            self.soc_percent = (self.soc_percent + gained).min(100.0);
        }
    }

    /// Plug in a vehicle, starting a new session.
    pub fn connect(&mut self, soc_percent: f64) {
        self.connected = true;
        self.soc_percent = soc_percent.clamp(0.0, 100.0);
        self.session_kwh = 0.0;
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
        self.enabled = false;
        self.current_a = 0.0;
    }

    /// Returns false when no vehicle is connected.
    pub fn start(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.enabled = true;
        true
    }

    pub fn stop(&mut self) {
        self.enabled = false;
    }

    pub fn set_current_limit(&mut self, amps: f64) {
        self.current_limit_a = amps.clamp(MIN_CURRENT_A, MAX_CURRENT_A);
    }
}

// ---- household ----

pub const MIN_OCCUPANTS: u8 = 1;
pub const MAX_OCCUPANTS: u8 = 8;
const SPIKE_CHANCE_PER_30S: f64 = 0.05;
const SPIKE_MIN_SECS: f64 = 120.0;
const SPIKE_MAX_SECS: f64 = 900.0;
// Smoothing toward a new random variation, per second.
const VARIATION_PULL_PER_SEC: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
struct Spike {
    watts: f64,
    label: &'static str,
    remaining_secs: f64,
}

/// Household consumption behind the meter.
#[derive(Debug, Clone, PartialEq)]
pub struct Household {
    pub building: BuildingType,
    pub presence: PresenceMode,
    pub occupants: u8,
    pub power_w: f64,
    pub energy_kwh: f64,
    variation: f64,
    spike: Option<Spike>,
}

impl Household {
    pub fn new(building: BuildingType, presence: PresenceMode, occupants: u8) -> Self {
        Self {
            building,
            presence,
            occupants: occupants.clamp(MIN_OCCUPANTS, MAX_OCCUPANTS),
            power_w: 0.0,
            energy_kwh: 0.0,
            variation: 1.0,
            spike: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.presence == PresenceMode::Home
    }

    pub fn set_occupants(&mut self, occupants: u8) {
        self.occupants = occupants.clamp(MIN_OCCUPANTS, MAX_OCCUPANTS);
    }

    fn pattern(&self) -> &'static HourlyPattern {
        match (self.building, self.is_present()) {
            (BuildingType::Home, true) => &patterns::HOME_OCCUPIED,
            (BuildingType::Home, false) => &patterns::HOME_AWAY,
            (BuildingType::Cabin, true) => &patterns::CABIN_OCCUPIED,
            (BuildingType::Cabin, false) => &patterns::CABIN_EMPTY,
        }
    }

    fn base_load(&self) -> f64 {
        match (self.building, self.is_present()) {
            (BuildingType::Home, _) => patterns::BASE_LOAD_HOME_W,
            (BuildingType::Cabin, true) => patterns::BASE_LOAD_CABIN_W,
            (BuildingType::Cabin, false) => patterns::BASE_LOAD_CABIN_EMPTY_W,
        }
    }

    /// Pattern load at `local`, interpolated between hours so the curve has
    /// no steps.
    fn pattern_load(&self, local: NaiveDateTime) -> f64 {
        let weekend = matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
        let pick = |hour: usize| {
            let (weekday, weekend_load) = self.pattern()[hour % 24];
            if weekend {
                weekend_load
            } else {
                weekday
            }
        };
        let hour = local.hour() as usize;
        let frac = (local.minute() as f64 * 60.0 + local.second() as f64) / 3600.0;
        pick(hour) * (1.0 - frac) + pick(hour + 1) * frac
    }

    /// Label of the current activity, for logs.
    pub fn activity(&self) -> &'static str {
        match &self.spike {
            Some(spike) => spike.label,
            None if self.is_present() => "everyday use",
            None => "standby",
        }
    }

    pub fn step(&mut self, dt_secs: f64, local: NaiveDateTime, rng: &mut StdRng) {
        let present = self.is_present();
        let (low, high) = if present { (0.7, 1.3) } else { (0.95, 1.05) };
        let sampled = rng.gen_range(low..high);
        let pull = (VARIATION_PULL_PER_SEC * dt_secs).min(1.0);
        self.variation += (sampled - self.variation) * pull;
        self.variation = self.variation.clamp(low, high);

        if let Some(spike) = &mut self.spike {
            spike.remaining_secs -= dt_secs;
            if spike.remaining_secs <= 0.0 {
                self.spike = None;
            }
        }
        if present && self.spike.is_none() {
            let chance = (SPIKE_CHANCE_PER_30S * dt_secs / 30.0).min(1.0);
            if rng.gen_bool(chance) {
                let table = match self.building {
                    BuildingType::Home => patterns::HOME_SPIKES,
                    BuildingType::Cabin => patterns::CABIN_SPIKES,
                };
                if let Some(&(watts, label)) = table.choose(rng) {
                    self.spike = Some(Spike {
                        watts,
                        label,
                        remaining_secs: rng.gen_range(SPIKE_MIN_SECS..SPIKE_MAX_SECS),
                    });
                }
            }
        }

        let occupancy = if present {
            self.occupants as f64 / 4.0
        } else {
            1.0
        };
        let activity = self.pattern_load(local) * occupancy * self.variation;
        let spike = self.spike.as_ref().map_or(0.0, |s| s.watts);
        self.power_w = self.base_load() + activity + spike;
        self.energy_kwh += self.power_w / 1000.0 * dt_secs / 3600.0;
    }
}

// ---- meter ----

pub const NOMINAL_VOLTAGE_V: f64 = 230.0;
pub const VOLTAGE_SPREAD_V: f64 = 3.0;
const VOLTAGE_WALK_V: f64 = 0.5;

/// Loads seen by the meter during one step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Loads {
    pub water_heater_w: f64,
    pub ev_charger_w: f64,
    pub household_w: f64,
}

impl Loads {
    pub fn total(&self) -> f64 {
        self.water_heater_w + self.ev_charger_w + self.household_w
    }
}

/// Three-phase import meter at the grid connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Meter {
    pub voltage_v: [f64; 3],
    pub current_a: [f64; 3],
    pub power_w: f64,
    pub energy_import_kwh: f64,
    pub energy_today_kwh: f64,
    day: Option<chrono::NaiveDate>,
}

impl Meter {
    pub fn new(initial_import_kwh: f64) -> Self {
        Self {
            voltage_v: [NOMINAL_VOLTAGE_V; 3],
            current_a: [0.0; 3],
            power_w: 0.0,
            energy_import_kwh: initial_import_kwh,
            energy_today_kwh: 0.0,
            day: None,
        }
    }

    pub fn step(&mut self, dt_secs: f64, loads: Loads, local: NaiveDateTime, rng: &mut StdRng) {
        for v in &mut self.voltage_v {
            let walk = rng.gen_range(-VOLTAGE_WALK_V..VOLTAGE_WALK_V);
            *v = (*v + walk).clamp(
                NOMINAL_VOLTAGE_V - VOLTAGE_SPREAD_V,
                NOMINAL_VOLTAGE_V + VOLTAGE_SPREAD_V,
            );
        }

        // heater and half the house on L1, charger on L2, the rest on L3
        let half_house = loads.household_w * 0.5;
        self.current_a = [
            (loads.water_heater_w + half_house) / self.voltage_v[0],
            loads.ev_charger_w / self.voltage_v[1],
            half_house / self.voltage_v[2],
        ];
        self.power_w = loads.total();

        let today = local.date();
        if self.day != Some(today) {
            self.day = Some(today);
            self.energy_today_kwh = 0.0;
        }
        let energy = self.power_w / 1000.0 * dt_secs / 3600.0;
        self.energy_import_kwh += energy;
        self.energy_today_kwh += energy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rand::SeedableRng;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 14)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_water_heater_hysteresis() {
        let mut heater = WaterHeater {
            temperature_c: 64.0,
            ..Default::default()
        };
        // inside the band and not heating: stays off
        heater.step(0.01);
        assert!(!heater.heating);

        heater.temperature_c = 62.0;
        heater.step(0.01);
        assert!(heater.heating);

        // keeps heating through the band until the setpoint
        heater.temperature_c = 64.0;
        heater.step(0.01);
        assert!(heater.heating);

        heater.temperature_c = 65.0;
        heater.step(0.01);
        assert!(!heater.heating);
    }

    #[test]
    fn test_water_heater_modes_and_bounds() {
        let mut heater = WaterHeater::default();
        heater.set_mode(WaterHeaterMode::Eco);
        assert_eq!(heater.target_c, 55.0);
        heater.set_mode(WaterHeaterMode::Boost);
        assert_eq!(heater.target_c, 75.0);
        heater.set_target(90.0);
        assert_eq!(heater.target_c, MAX_TARGET_C);
        heater.set_target(10.0);
        assert_eq!(heater.target_c, MIN_TARGET_C);

        heater.set_mode(WaterHeaterMode::Off);
        heater.temperature_c = 20.0;
        heater.step(1.0);
        assert!(!heater.heating);
        assert_eq!(heater.power_w(), 0.0);

        heater.shower(200.0);
        assert_eq!(heater.temperature_c, MIN_TANK_C);
    }

    #[test]
    fn test_shower_drops_temperature() {
        let mut heater = WaterHeater::default();
        heater.shower(50.0);
        assert!((heater.temperature_c - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_charger_ramps_toward_limit() {
        let mut charger = EvCharger::default();
        assert!(charger.start());
        charger.step(5.0);
        assert!((charger.current_a - 5.0).abs() < 1e-9);
        charger.step(60.0);
        assert_eq!(charger.current_a, DEFAULT_CURRENT_A);
        assert_eq!(charger.status(), ChargerStatus::Charging);
        assert!(charger.session_kwh > 0.0);

        charger.stop();
        charger.step(1.0);
        assert!((charger.current_a - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_charger_requires_vehicle() {
        let mut charger = EvCharger::default();
        charger.disconnect();
        assert!(!charger.start());
        charger.step(60.0);
        assert_eq!(charger.power_w(), 0.0);
        assert_eq!(charger.status(), ChargerStatus::Disconnected);

        charger.set_current_limit(50.0);
        assert_eq!(charger.current_limit_a, MAX_CURRENT_A);
        charger.set_current_limit(1.0);
        assert_eq!(charger.current_limit_a, MIN_CURRENT_A);
    }

    #[test]
    fn test_charger_completes_at_full_battery() {
        let mut charger = EvCharger::default();
        charger.connect(99.9);
        charger.start();
        for _ in 0..600 {
            charger.step(10.0);
        }
        assert_eq!(charger.soc_percent, 100.0);
        assert_eq!(charger.status(), ChargerStatus::Complete);
        assert_eq!(charger.current_a, 0.0);
    }

    #[test]
    fn test_household_follows_time_of_day() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut night = Household::new(BuildingType::Home, PresenceMode::Home, 4);
        let mut evening = night.clone();
        night.step(1.0, at(3), &mut rng);
        evening.step(1.0, at(18), &mut rng);
        assert!(night.power_w >= patterns::BASE_LOAD_HOME_W);
        assert!(evening.power_w > night.power_w);
    }

    #[test]
    fn test_household_away_is_flat() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut house = Household::new(BuildingType::Cabin, PresenceMode::Away, 2);
        for _ in 0..100 {
            house.step(30.0, at(18), &mut rng);
            assert!(house.power_w <= patterns::BASE_LOAD_CABIN_EMPTY_W + 20.0 * 1.05 + 1e-9);
            assert_eq!(house.activity(), "standby");
        }
    }

    #[test]
    fn test_occupants_are_clamped() {
        let mut house = Household::new(BuildingType::Home, PresenceMode::Home, 0);
        assert_eq!(house.occupants, MIN_OCCUPANTS);
        house.set_occupants(20);
        assert_eq!(house.occupants, MAX_OCCUPANTS);
    }

    #[test]
    fn test_meter_phases_and_daily_reset() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut meter = Meter::new(1000.0);
        let loads = Loads {
            water_heater_w: 2000.0,
            ev_charger_w: 3680.0,
            household_w: 1000.0,
        };
        meter.step(3600.0, loads, at(23), &mut rng);
        assert!((meter.power_w - 6680.0).abs() < 1e-9);
        assert!((meter.energy_import_kwh - 1006.68).abs() < 1e-9);
        assert!(meter.current_a[1] > 15.0);
        for v in meter.voltage_v {
            assert!((227.0..=233.0).contains(&v));
        }

        let next_day = at(0) + chrono::Duration::days(1);
        meter.step(60.0, loads, next_day, &mut rng);
        assert!(meter.energy_today_kwh < 0.2);
        assert!(meter.energy_import_kwh > 1006.68);
    }
}
