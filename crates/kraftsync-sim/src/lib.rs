//! Simulated energy devices.
//!
//! A seeded engine models a grid meter with household load, a thermostatic
//! water heater and an EV charger. It plugs into the bridge as both a host
//! platform and a telemetry source, replacing real hardware.

pub mod engine;
pub mod host;
pub mod models;
pub mod patterns;

pub use engine::{
    Frames, SimFrame, SimulationEngine, DEVICE_IDS, EV_CHARGER_ID, METER_ID, WATER_HEATER_ID,
};
pub use host::{shared_engine, simulated_devices, SharedEngine, SimulatedHost, SimulatedSource};
pub use models::{ChargerStatus, WaterHeaterMode};
