//! Hourly household load patterns, watts above base load.
//!
//! Each row is `(weekday, weekend)` for one local hour.

pub type HourlyPattern = [(f64, f64); 24];

/// Primary home with the family present.
pub const HOME_OCCUPIED: HourlyPattern = [
    (100.0, 150.0),
    (50.0, 100.0),
    (50.0, 50.0),
    (50.0, 50.0),
    (50.0, 50.0),
    (100.0, 50.0),
    (800.0, 200.0),
    (1200.0, 300.0),
    (400.0, 600.0),
    (200.0, 800.0),
    (200.0, 600.0),
    (200.0, 800.0),
    (300.0, 1000.0),
    (200.0, 600.0),
    (200.0, 500.0),
    (300.0, 600.0),
    (500.0, 800.0),
    (1500.0, 1200.0),
    (1800.0, 1500.0),
    (1000.0, 1000.0),
    (800.0, 800.0),
    (600.0, 700.0),
    (400.0, 500.0),
    (200.0, 300.0),
];

/// Primary home while away: standby loads only.
pub const HOME_AWAY: HourlyPattern = [(50.0, 50.0); 24];

/// Cabin during a visit.
pub const CABIN_OCCUPIED: HourlyPattern = [
    (100.0, 150.0),
    (50.0, 100.0),
    (50.0, 50.0),
    (50.0, 50.0),
    (50.0, 50.0),
    (50.0, 50.0),
    (50.0, 100.0),
    (100.0, 200.0),
    (200.0, 500.0),
    (300.0, 800.0),
    (400.0, 700.0),
    (300.0, 900.0),
    (500.0, 1200.0),
    (300.0, 600.0),
    (300.0, 500.0),
    (400.0, 600.0),
    (500.0, 800.0),
    (800.0, 1200.0),
    (1200.0, 1500.0),
    (800.0, 1000.0),
    (600.0, 800.0),
    (500.0, 700.0),
    (300.0, 500.0),
    (200.0, 300.0),
];

/// Empty cabin: frost protection.
pub const CABIN_EMPTY: HourlyPattern = [(20.0, 20.0); 24];

pub const BASE_LOAD_HOME_W: f64 = 250.0;
pub const BASE_LOAD_CABIN_W: f64 = 80.0;
pub const BASE_LOAD_CABIN_EMPTY_W: f64 = 30.0;

/// Appliance spikes `(watts, label)` for an occupied home.
pub const HOME_SPIKES: &[(f64, &str)] = &[
    (1800.0, "cooking"),
    (2200.0, "kettle"),
    (1500.0, "dishwasher"),
    (2000.0, "washing"),
    (900.0, "toaster"),
];

/// Appliance spikes for an occupied cabin.
pub const CABIN_SPIKES: &[(f64, &str)] = &[
    (1500.0, "sauna"),
    (2200.0, "kettle"),
    (1000.0, "cooking"),
    (800.0, "coffee maker"),
];
