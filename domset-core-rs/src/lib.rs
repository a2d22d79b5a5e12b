//! # Domset: group temperature control for CASU arenas
//!
//! Each CASU samples its six IR proximity sensors, turns them into an
//! activity fraction, and joins a dominating-set group: the node with the
//! lowest id among itself and its neighbors is the group master.
//!
//! ## Control loop
//!
//! - every `td` (0.1 s): sample IR, push the active fraction into a bounded history
//! - every `ttemp` (5 s): slaves report their average to the master; the
//!   master aggregates, integrates, runs the debounced heat / cool decision
//!   and broadcasts a new temperature reference plus blow duration
//! - masters also exchange telemetry and overrides with the bridge peer
//!
//! ## Quick Start
//!
//! ```ignore
//! use domset_core::prelude::*;
//!
//! let arena = SimArena::new();
//! let casu = SimCasu::new("casu-001", arena.clone());
//! let topology = Topology::new(1, [2, 3]);
//! let mut node = DomsetController::new(casu, topology, ControllerConfig::default())?;
//!
//! node.calibrate_ir_thresholds()?;
//! node.initialize_temperature()?;
//! let summary = node.run(&stop)?;
//! ```

// Core modules
pub mod types;
pub mod error;
pub mod config;
pub mod topology;
pub mod hal;
pub mod sampler;
pub mod aggregator;
pub mod controller;
pub mod airflow;
pub mod bridge;
pub mod bus;
pub mod event_log;
pub mod node;
pub mod sim;

// Re-exports for convenience
pub use types::*;
pub use error::{DomsetError, HalError, Result};
pub use config::{ControllerConfig, WaitPolicy};
pub use topology::Topology;
pub use hal::{Hal, Rgb};
pub use sampler::{ActivityHistory, ActivitySample, Calibration, SensorSampler};
pub use aggregator::{GroupActivity, GroupAggregator};
pub use controller::{ControlDecision, ControllerState, TemperatureController, Thresholds};
pub use airflow::{Airflow, AirflowCommand};
pub use bridge::{BridgeOverride, BridgeTelemetry};
pub use bus::{GroupBus, GroupSnapshot, Inbound};
pub use event_log::EventLog;
pub use node::{DomsetController, RunSummary, StopReason};
pub use sim::{SimArena, SimCasu};

/// Prelude - commonly used items
pub mod prelude {
    pub use crate::types::*;
    pub use crate::error::{DomsetError, HalError, Result};
    pub use crate::config::{ControllerConfig, WaitPolicy};
    pub use crate::topology::Topology;
    pub use crate::hal::Hal;
    pub use crate::event_log::EventLog;
    pub use crate::node::{DomsetController, RunSummary, StopReason};
    pub use crate::sim::{SimArena, SimCasu};
}
