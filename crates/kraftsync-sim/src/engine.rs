//! Simulation engine driving the virtual devices.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use kraftsync_core::config::{BuildingType, PresenceMode, SimulationSection};
use kraftsync_core::TelemetrySample;

use crate::models::{EvCharger, Household, Loads, Meter, WaterHeater, WaterHeaterMode};

pub const METER_ID: &str = "sim_meter";
pub const WATER_HEATER_ID: &str = "sim_water_heater";
pub const EV_CHARGER_ID: &str = "sim_ev_charger";

/// Local ids of the virtual devices.
pub const DEVICE_IDS: [&str; 3] = [METER_ID, WATER_HEATER_ID, EV_CHARGER_ID];

// Longer gaps are simulated in chunks so thermostats and ramps stay stable.
const MAX_STEP_SECS: f64 = 60.0;
const INITIAL_METER_KWH: f64 = 12_000.0;

/// Readings of all virtual devices at one instant.
///
/// Samples carry the local id only; the cloud id is filled in by the
/// telemetry source from the mapping entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimFrame {
    pub timestamp: DateTime<Utc>,
    pub local_time: NaiveDateTime,
    pub activity: String,
    pub meter: TelemetrySample,
    pub water_heater: TelemetrySample,
    pub ev_charger: TelemetrySample,
}

impl SimFrame {
    pub fn samples(&self) -> [&TelemetrySample; 3] {
        [&self.meter, &self.water_heater, &self.ev_charger]
    }

    pub fn get(&self, local_id: &str) -> Option<&TelemetrySample> {
        self.samples().into_iter().find(|s| s.local_id == local_id)
    }
}

fn site_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = name, "Unknown simulation timezone, using Europe/Oslo");
        chrono_tz::Europe::Oslo
    })
}

/// Stateful, seeded simulation of a meter, a water heater and an EV charger.
///
/// Time only moves through [`step`](Self::step) and
/// [`advance_to`](Self::advance_to); two engines built from the same
/// settings and start time produce identical frames.
#[derive(Debug, Clone)]
pub struct SimulationEngine {
    rng: StdRng,
    clock: DateTime<Utc>,
    timezone: Tz,
    pub water_heater: WaterHeater,
    pub ev_charger: EvCharger,
    pub household: Household,
    pub meter: Meter,
}

impl SimulationEngine {
    pub fn new(settings: &SimulationSection, start: DateTime<Utc>) -> Self {
        Self {
            rng: StdRng::seed_from_u64(settings.seed),
            clock: start,
            timezone: site_timezone(&settings.timezone),
            water_heater: WaterHeater::default(),
            ev_charger: EvCharger::default(),
            household: Household::new(settings.building, settings.presence, settings.occupants),
            meter: Meter::new(INITIAL_METER_KWH),
        }
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn clock(&self) -> DateTime<Utc> {
        self.clock
    }

    /// Wall-clock time at the simulated site, used for load patterns.
    pub fn local_time(&self) -> NaiveDateTime {
        self.clock.with_timezone(&self.timezone).naive_local()
    }

    /// Advance every model by `dt` and return the resulting frame.
    pub fn step(&mut self, dt: Duration) -> SimFrame {
        let mut remaining = dt.as_secs_f64();
        while remaining > 0.0 {
            let chunk = remaining.min(MAX_STEP_SECS);
            self.step_once(chunk);
            remaining -= chunk;
        }
        self.frame()
    }

    /// Catch up to `now`. Times at or before the engine clock are ignored.
    pub fn advance_to(&mut self, now: DateTime<Utc>) {
        if let Ok(gap) = (now - self.clock).to_std() {
            if !gap.is_zero() {
                self.step(gap);
            }
        }
    }

    fn step_once(&mut self, dt_secs: f64) {
        self.clock += chrono::Duration::milliseconds((dt_secs * 1000.0).round() as i64);
        let local = self.local_time();
        let dt_hours = dt_secs / 3600.0;

        self.water_heater.step(dt_hours);
        self.ev_charger.step(dt_secs);
        self.household.step(dt_secs, local, &mut self.rng);
        let loads = Loads {
            water_heater_w: self.water_heater.power_w(),
            ev_charger_w: self.ev_charger.power_w(),
            household_w: self.household.power_w,
        };
        self.meter.step(dt_secs, loads, local, &mut self.rng);
    }

    /// Current readings without advancing time.
    pub fn frame(&self) -> SimFrame {
        SimFrame {
            timestamp: self.clock,
            local_time: self.local_time(),
            activity: self.household.activity().to_string(),
            meter: self.meter_sample(),
            water_heater: self.water_heater_sample(),
            ev_charger: self.ev_charger_sample(),
        }
    }

    pub fn reading(&self, local_id: &str) -> Option<TelemetrySample> {
        match local_id {
            METER_ID => Some(self.meter_sample()),
            WATER_HEATER_ID => Some(self.water_heater_sample()),
            EV_CHARGER_ID => Some(self.ev_charger_sample()),
            _ => None,
        }
    }

    fn meter_sample(&self) -> TelemetrySample {
        let m = &self.meter;
        let mut s = TelemetrySample::new(METER_ID, "", self.clock);
        s.power_w = Some(round(m.power_w, 1));
        s.energy_total_kwh = Some(round(m.energy_import_kwh, 3));
        s.energy_today_kwh = Some(round(m.energy_today_kwh, 3));
        for phase in 0..3 {
            s.voltage_by_phase.set(phase, round(m.voltage_v[phase], 1));
            s.current_by_phase.set(phase, round(m.current_a[phase], 2));
        }
        s
    }

    fn water_heater_sample(&self) -> TelemetrySample {
        let h = &self.water_heater;
        let mut s = TelemetrySample::new(WATER_HEATER_ID, "", self.clock);
        s.power_w = Some(h.power_w());
        s.energy_total_kwh = Some(round(h.energy_kwh, 3));
        s.temperature_c = Some(round(h.temperature_c, 1));
        s.target_temperature_c = Some(h.target_c);
        s.is_on = Some(h.mode != WaterHeaterMode::Off);
        s
    }

    fn ev_charger_sample(&self) -> TelemetrySample {
        let c = &self.ev_charger;
        let mut s = TelemetrySample::new(EV_CHARGER_ID, "", self.clock);
        s.power_w = Some(round(c.power_w(), 1));
        s.energy_total_kwh = Some(round(c.total_kwh, 3));
        s.session_energy_kwh = Some(round(c.session_kwh, 3));
        s.charge_limit_a = Some(c.current_limit_a);
        s.is_on = Some(c.enabled && c.connected);
        s.current_by_phase.set(0, round(c.current_a, 2));
        s.voltage_by_phase.set(0, crate::models::GRID_VOLTAGE_V);
        s
    }

    // ---- controls ----

    pub fn shower(&mut self, litres: f64) {
        self.water_heater.shower(litres);
        info!(litres, temperature_c = self.water_heater.temperature_c, "Simulated shower");
    }

    pub fn set_water_heater_mode(&mut self, mode: WaterHeaterMode) {
        self.water_heater.set_mode(mode);
        debug!(?mode, target_c = self.water_heater.target_c, "Water heater mode set");
    }

    pub fn set_water_heater_target(&mut self, target_c: f64) {
        self.water_heater.set_target(target_c);
    }

    pub fn connect_ev(&mut self, soc_percent: Option<f64>) {
        self.ev_charger
            .connect(soc_percent.unwrap_or(crate::models::DEFAULT_SOC));
        info!(soc = self.ev_charger.soc_percent, "Vehicle connected");
    }

    pub fn disconnect_ev(&mut self) {
        self.ev_charger.disconnect();
        info!("Vehicle disconnected");
    }

    /// Returns false when no vehicle is connected.
    pub fn start_charging(&mut self) -> bool {
        self.ev_charger.start()
    }

    pub fn stop_charging(&mut self) {
        self.ev_charger.stop();
    }

    pub fn set_charge_limit(&mut self, amps: f64) {
        self.ev_charger.set_current_limit(amps);
    }

    pub fn set_presence(&mut self, presence: PresenceMode) {
        self.household.presence = presence;
        info!(?presence, "Presence mode changed");
    }

    pub fn set_building(&mut self, building: BuildingType) {
        self.household.building = building;
    }

    pub fn set_occupants(&mut self, occupants: u8) {
        self.household.set_occupants(occupants);
    }

    /// Infinite frame sequence with a fixed step, starting from this state.
    pub fn frames(self, step: Duration) -> Frames {
        Frames {
            origin: self.clone(),
            current: self,
            step,
        }
    }
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Lazy, never-ending sequence of frames. [`restart`](Self::restart) rewinds
/// to the initial state, replaying the same frames.
pub struct Frames {
    origin: SimulationEngine,
    current: SimulationEngine,
    step: Duration,
}

impl Frames {
    pub fn restart(&mut self) {
        self.current = self.origin.clone();
    }

    pub fn engine(&self) -> &SimulationEngine {
        &self.current
    }
}

impl Iterator for Frames {
    type Item = SimFrame;

    fn next(&mut self) -> Option<SimFrame> {
        Some(self.current.step(self.step))
    }
}
