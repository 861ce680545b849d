//! Synchronization core of kraftsync.
//!
//! - [`mapper`]: keeps the local-device to cloud-device mapping in line with
//!   discovery and publishes immutable snapshots to readers
//! - [`publisher`]: periodic telemetry push
//! - [`router`] and [`poller`]: remote command resolution, dispatch and ack
//! - [`bridge`]: the periodic loops and user services for one site

pub mod bridge;
pub mod diagnostics;
pub mod mapper;
pub mod poller;
pub mod publisher;
pub mod router;
pub mod status;

pub use bridge::{Bridge, LoopKind};
pub use diagnostics::{redact, Diagnostics};
pub use mapper::{cloud_id_for, DeviceMapper, MapperOptions, MappingDiff, MappingSnapshot};
pub use poller::{CommandPoller, CommandStats, PollReport};
pub use publisher::{CycleReport, PublisherOptions, PublisherStats, TelemetryPublisher};
pub use router::{resolve, CommandRouter, CommandState};
pub use status::{LoopStatus, LoopTracker};
