//! Group temperature controller (master only)
//!
//! Once per control period the master turns aggregated group activity into
//! a heat / cool / hold decision and a new temperature reference:
//!
//! 1. Initial-heating latch: `temp_ctrl` counts up (never down) once the
//!    activity integral passes the lower bound. No decision is taken
//!    before it is non-zero.
//! 2. Threshold ramps: the heat and cool thresholds move from their start
//!    to their stop value along an exponential ramp over the phase
//!    duration.
//! 3. Debounce: each raw condition drives an exponentially decayed
//!    accumulator; the decision is the accumulator above one half.
//!    Cool wins over heat.
//! 4. Setpoint: `temp_ref` moves by at most `max_temp_step` per tick and
//!    always stays inside `[min_temp, max_temp]`.

use crate::config::ControllerConfig;
use crate::types::ActivityStats;
use tracing::{debug, warn};

/// Mutable controller state, created after calibration and reset at phase boundaries
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub temp_ref: f64,
    pub temp_ref_old: f64,
    /// Non-decreasing between resets, capped at the integration limit
    pub integrate_activity: f64,
    pub heat_float: f64,
    pub cool_float: f64,
    /// Initial-heating latch, monotone up to `stop_initial_heating`
    pub temp_ctrl: u32,
    pub initial_heating: bool,
    /// Run start (s)
    pub time_start: f64,
    /// Heat ramp start (s)
    pub time_start_heat: f64,
    /// Cool ramp start (s)
    pub time_start_cool: f64,
}

impl ControllerState {
    pub fn new(temp_ref: f64, now: f64) -> Self {
        Self {
            temp_ref,
            temp_ref_old: temp_ref,
            integrate_activity: 0.0,
            heat_float: 0.0,
            cool_float: 0.0,
            temp_ctrl: 0,
            initial_heating: false,
            time_start: now,
            time_start_heat: now,
            time_start_cool: now,
        }
    }
}

/// Thresholds reported to the bridge and the event log
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Thresholds {
    pub heat: f64,
    pub cool: f64,
    pub blow: f64,
}

/// Outcome of one control step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlDecision {
    pub heat: bool,
    pub cool: bool,
    pub delta: f64,
    pub temp_ref: f64,
    pub thresholds: Thresholds,
}

impl ControlDecision {
    pub fn changed(&self) -> bool {
        self.delta != 0.0
    }
}

/// Exponential ramp progress in [0, 1) for `elapsed` seconds into a ramp of `length` seconds
pub fn ramp_progress(elapsed: f64, length: f64, inflection: f64) -> f64 {
    let mut i_n = (elapsed / length).max(0.0);
    if i_n >= 1.0 {
        i_n = 0.99;
    }
    let x = 1.0 - 1.0 / (1.0 - i_n);
    1.0 - (inflection * x).exp()
}

fn lerp(start: f64, stop: f64, progress: f64) -> f64 {
    (1.0 - progress) * start + progress * stop
}

/// Hysteresis-filtered temperature controller
#[derive(Debug, Clone)]
pub struct TemperatureController {
    config: ControllerConfig,
    state: ControllerState,
    thresholds: Thresholds,
}

impl TemperatureController {
    pub fn new(config: &ControllerConfig, now: f64) -> Self {
        Self {
            config: config.clone(),
            state: ControllerState::new(config.initial_temp_ref, now),
            thresholds: Thresholds {
                heat: config.start_heat,
                cool: config.start_cool,
                blow: 0.0,
            },
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn temp_ref(&self) -> f64 {
        self.state.temp_ref
    }

    /// Thresholds of the last step
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Add one tick of group activity (the un-normalized group sum) to the
    /// saturating integral
    pub fn integrate(&mut self, activity: f64) {
        let limit = self.config.integration_limit;
        if self.state.integrate_activity < limit && activity > 0.0 {
            self.state.integrate_activity = (self.state.integrate_activity + activity).min(limit);
        }
    }

    /// Phase boundary: clear integral and accumulators, restart both ramps
    pub fn reset(&mut self, now: f64) {
        self.state.integrate_activity = 0.0;
        self.state.heat_float = 0.0;
        self.state.cool_float = 0.0;
        self.restart_ramps(now);
        debug!("Controller: State reset at t={:.1}", now - self.state.time_start);
    }

    /// Anchor the run clock (blow window) and both ramps at `now`
    pub fn start_run(&mut self, now: f64) {
        self.state.time_start = now;
        self.restart_ramps(now);
    }

    /// Restart the heat and cool ramps only
    pub fn restart_ramps(&mut self, now: f64) {
        self.state.time_start_heat = now;
        self.state.time_start_cool = now;
    }

    /// Restore the initial temperature reference
    pub fn reset_temp_ref(&mut self) {
        self.state.temp_ref = self.config.initial_temp_ref;
    }

    /// Shift the reference by `delta`, staying inside the bounds
    pub fn adjust_temp_ref(&mut self, delta: f64) {
        if !delta.is_finite() {
            warn!("Controller: Ignoring non-finite temp_ref delta {}", delta);
            return;
        }
        self.state.temp_ref = self.clamp_temp(self.state.temp_ref + delta);
    }

    fn clamp_temp(&self, t: f64) -> f64 {
        t.clamp(self.config.min_temp, self.config.max_temp)
    }

    /// Ramped heat and cool thresholds at time `now`
    pub fn scaling(&self, now: f64) -> (f64, f64) {
        let c = &self.config;
        let progress_heat = ramp_progress(
            now - self.state.time_start_heat,
            c.time_length_heat,
            c.inflection_heat,
        );
        let progress_cool = ramp_progress(
            now - self.state.time_start_cool,
            c.time_length_cool,
            c.inflection_cool,
        );
        (
            lerp(c.start_heat, c.stop_heat, progress_heat),
            lerp(c.start_cool, c.stop_cool, progress_cool),
        )
    }

    /// Whether blowing is allowed at time `now`
    pub fn in_blow_window(&self, now: f64) -> bool {
        let t = now - self.state.time_start;
        t > self.config.blow_allowed_start && t < self.config.blow_allowed_stop
    }

    /// Run one control period over aggregated statistics
    pub fn step(&mut self, stats: &ActivityStats, group_size: usize, now: f64) -> ControlDecision {
        let c = &self.config;
        let s = &mut self.state;

        if s.integrate_activity > c.integrate_limit_lower && s.temp_ctrl < c.stop_initial_heating {
            s.temp_ctrl += 1;
        }
        s.initial_heating = !(s.integrate_activity < c.integrate_limit_lower
            || s.integrate_activity > c.integrate_limit_upper
            || s.temp_ctrl >= c.stop_initial_heating);

        let (scaling_heat, scaling_cool) = self.scaling(now);
        let c = &self.config;
        let s = &mut self.state;

        s.cool_float *= 1.0 - c.rho;
        if stats.maximum < scaling_cool && s.temp_ctrl > 0 {
            s.cool_float += c.rho;
        }
        let cool = s.cool_float > 0.5;

        s.heat_float *= 1.0 - c.rho;
        if stats.average > scaling_heat && s.temp_ctrl > 0 && !cool {
            s.heat_float += c.rho;
        }
        let heat = s.heat_float > 0.5 && !cool;

        let mut delta = 0.0;
        if heat {
            delta = c.step_heat * group_size as f64;
        }
        if cool {
            delta = -c.step_cool;
        }
        delta = delta.min(c.max_temp_step);

        s.temp_ref_old = s.temp_ref;
        s.temp_ref = (s.temp_ref + delta).clamp(c.min_temp, c.max_temp);

        let blow = if self.in_blow_window(now) {
            self.config.scaling_blow
        } else {
            0.0
        };
        self.thresholds = Thresholds {
            heat: scaling_heat,
            cool: scaling_cool,
            blow,
        };

        debug!(
            "Controller: avg={:.3} max={:.3} heat_th={:.3} cool_th={:.3} heat={} cool={} t_ref={:.2}",
            stats.average, stats.maximum, scaling_heat, scaling_cool, heat, cool, self.state.temp_ref
        );

        ControlDecision {
            heat,
            cool,
            delta,
            temp_ref: self.state.temp_ref,
            thresholds: self.thresholds,
        }
    }
}
