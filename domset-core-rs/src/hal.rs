//! Hardware Abstraction Layer
//!
//! The controller only needs a narrow slice of the CASU driver:
//! - Monotonic time and delay
//! - Raw 6-channel IR readings
//! - Temperature, airflow and diagnostic LED actuation
//! - Addressed text messages to named peers
//!
//! # Implementing a HAL
//!
//! ```ignore
//! struct ArenaCasu { /* driver handle */ }
//!
//! impl Hal for ArenaCasu {
//!     fn time_us(&self) -> TimeUs {
//!         // Read monotonic clock
//!     }
//!
//!     fn read_ir_raw(&mut self) -> Result<[u16; IR_CHANNELS], HalError> {
//!         // Query the IR array
//!     }
//!
//!     // ... implement other methods
//! }
//! ```
//!
//! `sim::SimCasu` is the in-process implementation used for tests and
//! the arena simulator.

use crate::error::HalError;
use crate::types::{RawMessage, TimeUs, IR_CHANNELS};

/// Diagnostic LED colour
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    pub const RED: Rgb = Rgb { r: 1.0, g: 0.0, b: 0.0 };
    pub const WHITE: Rgb = Rgb { r: 1.0, g: 1.0, b: 1.0 };
}

/// CASU driver trait
pub trait Hal {
    /// Peer name of this node (`casu-NNN`)
    fn name(&self) -> &str;

    /// Current time in microseconds. Must be monotonically increasing.
    fn time_us(&self) -> TimeUs;

    /// Block for `us` microseconds
    fn delay_us(&self, us: u64);

    /// Read the raw IR proximity array
    fn read_ir_raw(&mut self) -> Result<[u16; IR_CHANNELS], HalError>;

    /// Current temperature setpoint of the peltier controller
    fn temp_setpoint(&self) -> Result<f64, HalError>;

    /// Set temperature setpoint (°C)
    fn set_temp(&mut self, temp: f64) -> Result<(), HalError>;

    /// Enable airflow at the given intensity
    fn set_airflow_intensity(&mut self, intensity: f64) -> Result<(), HalError>;

    /// Turn airflow off
    fn airflow_standby(&mut self) -> Result<(), HalError>;

    fn set_diagnostic_led(&mut self, color: Rgb) -> Result<(), HalError>;

    fn diagnostic_led_standby(&mut self) -> Result<(), HalError>;

    /// Send a text payload to a named peer
    fn send_message(&mut self, peer: &str, payload: &str) -> Result<(), HalError>;

    /// Pop the next inbound message (non-blocking)
    fn read_message(&mut self) -> Option<RawMessage>;

    /// Current time in seconds
    fn time_s(&self) -> f64 {
        crate::types::us_to_secs(self.time_us())
    }
}
