//! Controller configuration
//!
//! Every constant of the group temperature controller lives here so a run
//! can be reproduced from a single TOML file. Defaults are the values the
//! arena experiments were run with.

use crate::error::{DomsetError, Result};
use crate::types::{MAX_TEMP, MIN_TEMP, INTEGRATION_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How long a blocking bus wait may last
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WaitPolicy {
    /// Wait forever. One silent peer stalls the node indefinitely.
    Unbounded,
    /// Give up after `timeout_s` and continue with what arrived
    Bounded { timeout_s: f64 },
}

impl WaitPolicy {
    pub fn bounded(timeout_s: f64) -> Self {
        WaitPolicy::Bounded { timeout_s }
    }

    /// Timeout in seconds, `None` for an unbounded wait
    pub fn timeout_s(&self) -> Option<f64> {
        match self {
            WaitPolicy::Unbounded => None,
            WaitPolicy::Bounded { timeout_s } => Some(*timeout_s),
        }
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Sensor sample period (s)
    pub td: f64,
    /// Control period (s)
    pub ttemp: f64,
    /// Run length bound (s)
    pub time_length: f64,
    /// Cool threshold ramp duration (s)
    pub time_length_cool: f64,
    /// Heat threshold ramp duration (s)
    pub time_length_heat: f64,

    pub initial_temp_ref: f64,
    pub min_temp: f64,
    pub max_temp: f64,

    /// Activity history capacity in samples
    pub history_capacity: usize,
    /// Raw IR reading at which a channel is considered saturated
    pub ir_saturation: u16,
    /// Threshold used before calibration
    pub default_ir_threshold: u32,
    pub calibration_margin: u32,
    pub calibration_duration: f64,

    pub integration_limit: f64,
    pub integrate_limit_lower: f64,
    pub integrate_limit_upper: f64,
    pub stop_initial_heating: u32,
    pub inflection_heat: f64,
    pub inflection_cool: f64,
    pub start_heat: f64,
    pub stop_heat: f64,
    pub start_cool: f64,
    pub stop_cool: f64,
    pub rho: f64,
    pub step_heat: f64,
    pub step_cool: f64,
    pub max_temp_step: f64,

    /// Blow allowed only inside [start, stop] seconds of the run
    pub blow_allowed_start: f64,
    pub blow_allowed_stop: f64,
    pub scaling_blow: f64,
    pub integrate_min_windup: u32,
    pub blow_start_condition: u32,
    pub default_blow_duration: f64,
    pub blow_trigger_enabled: bool,

    /// Phase boundary after which the controller state is reset
    pub baseline_duration_s: Option<f64>,

    /// Master wait for neighbor reports
    pub group_wait: WaitPolicy,
    /// Slave wait for the master directive
    pub directive_wait: WaitPolicy,
    /// Busy-poll interval while waiting on the bus (s)
    pub poll_interval: f64,

    /// Peer name of the cross-species bridge
    pub bridge_peer: String,
    /// Substring identifying bridge-originated senders
    pub bridge_sender_tag: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let td = 0.1;
        let ttemp = 5.0;
        Self {
            td,
            ttemp,
            time_length: 1800.0,
            time_length_cool: 750.0,
            time_length_heat: 500.0,
            initial_temp_ref: 28.0,
            min_temp: MIN_TEMP,
            max_temp: MAX_TEMP,
            history_capacity: (10.0 * ttemp / td).round() as usize,
            ir_saturation: 65535,
            default_ir_threshold: 25000,
            calibration_margin: 500,
            calibration_duration: 10.0,
            integration_limit: INTEGRATION_LIMIT,
            integrate_limit_lower: 10.0 / ttemp,
            integrate_limit_upper: 20.0 / ttemp,
            stop_initial_heating: 10,
            inflection_heat: 0.17,
            inflection_cool: 0.85,
            start_heat: 0.1,
            stop_heat: 0.7,
            start_cool: 0.2,
            stop_cool: 0.5,
            rho: 0.85,
            step_heat: 0.05,
            step_cool: 0.03,
            max_temp_step: 0.5,
            blow_allowed_start: 5.0 * 60.0,
            blow_allowed_stop: 1500.0 - 10.0 * 60.0,
            scaling_blow: 0.2,
            integrate_min_windup: 100,
            blow_start_condition: 12,
            default_blow_duration: 60.0,
            blow_trigger_enabled: false,
            baseline_duration_s: None,
            group_wait: WaitPolicy::bounded(2.0 * ttemp),
            directive_wait: WaitPolicy::bounded(2.0 * ttemp),
            poll_interval: 0.01,
            bridge_peer: "cats".to_string(),
            bridge_sender_tag: "iface".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Parse from TOML text; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ControllerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DomsetError::Config(e.to_string()))
    }

    /// Sensor ticks per control tick (50 with the defaults)
    pub fn ticks_per_control(&self) -> u32 {
        ((self.ttemp / self.td).round() as u32).max(1)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("td", self.td),
            ("ttemp", self.ttemp),
            ("time_length_heat", self.time_length_heat),
            ("time_length_cool", self.time_length_cool),
            ("poll_interval", self.poll_interval),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(DomsetError::Config(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        // an infinite run length is allowed, it ends on the stop flag
        if self.time_length.is_nan() || self.time_length <= 0.0 {
            return Err(DomsetError::Config(format!(
                "time_length must be positive, got {}",
                self.time_length
            )));
        }
        for (name, value) in [
            ("initial_temp_ref", self.initial_temp_ref),
            ("min_temp", self.min_temp),
            ("max_temp", self.max_temp),
            ("calibration_duration", self.calibration_duration),
            ("integration_limit", self.integration_limit),
            ("integrate_limit_lower", self.integrate_limit_lower),
            ("integrate_limit_upper", self.integrate_limit_upper),
            ("inflection_heat", self.inflection_heat),
            ("inflection_cool", self.inflection_cool),
            ("start_heat", self.start_heat),
            ("stop_heat", self.stop_heat),
            ("start_cool", self.start_cool),
            ("stop_cool", self.stop_cool),
            ("step_heat", self.step_heat),
            ("step_cool", self.step_cool),
            ("max_temp_step", self.max_temp_step),
            ("blow_allowed_start", self.blow_allowed_start),
            ("blow_allowed_stop", self.blow_allowed_stop),
            ("scaling_blow", self.scaling_blow),
            ("default_blow_duration", self.default_blow_duration),
            ("baseline_duration_s", self.baseline_duration_s.unwrap_or(0.0)),
        ] {
            if !value.is_finite() {
                return Err(DomsetError::Config(format!("{} must be finite, got {}", name, value)));
            }
        }
        if self.ttemp < self.td {
            return Err(DomsetError::Config("control period shorter than sample period".into()));
        }
        if self.min_temp >= self.max_temp {
            return Err(DomsetError::Config(format!(
                "temperature bounds inverted: [{}, {}]",
                self.min_temp, self.max_temp
            )));
        }
        if !(self.initial_temp_ref >= self.min_temp && self.initial_temp_ref <= self.max_temp) {
            return Err(DomsetError::Config("initial temperature outside bounds".into()));
        }
        if self.integrate_limit_lower > self.integrate_limit_upper {
            return Err(DomsetError::Config("initial-heating bounds inverted".into()));
        }
        if !(self.rho > 0.0 && self.rho <= 1.0) {
            return Err(DomsetError::Config(format!("rho must be in (0, 1], got {}", self.rho)));
        }
        if self.history_capacity == 0 {
            return Err(DomsetError::Config("history capacity must be non-zero".into()));
        }
        for policy in [self.group_wait, self.directive_wait] {
            if let Some(t) = policy.timeout_s() {
                if t.is_nan() || t < 0.0 {
                    return Err(DomsetError::Config(format!(
                        "wait timeout must be non-negative, got {}",
                        t
                    )));
                }
            }
        }
        Ok(())
    }

    /// Set run length
    pub fn with_time_length(mut self, seconds: f64) -> Self {
        self.time_length = seconds;
        self
    }

    /// Set both bus wait policies
    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.group_wait = policy;
        self.directive_wait = policy;
        self
    }

    /// Reset the controller state once this many seconds into the run
    pub fn with_baseline(mut self, seconds: f64) -> Self {
        self.baseline_duration_s = Some(seconds);
        self
    }

    /// Enable the minimum-activity blow trigger
    pub fn with_blow_trigger(mut self) -> Self {
        self.blow_trigger_enabled = true;
        self
    }
}
