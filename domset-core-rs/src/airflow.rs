//! Airflow actuation and the minimum-activity blow trigger

use crate::config::ControllerConfig;
use tracing::debug;

/// Actuator change requested by an airflow update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirflowCommand {
    /// Nothing to do
    Hold,
    /// Enable continuous airflow
    Start,
    /// Put airflow in standby
    Stop,
}

/// Blow-duration state machine
///
/// `blow` is the requested blow duration in seconds, 0 when idle. A
/// transition from 0 starts the timer; the blow ends when the duration
/// elapses or the request drops back to 0. Every end clears the
/// minimum-activity integrator.
#[derive(Debug, Clone)]
pub struct Airflow {
    blow: f64,
    blow_prev: f64,
    start_blow: f64,
    min_activity_integrator: u32,

    scaling_blow: f64,
    integrate_min_windup: u32,
    blow_start_condition: u32,
    default_blow_duration: f64,
}

impl Airflow {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            blow: 0.0,
            blow_prev: 0.0,
            start_blow: 0.0,
            min_activity_integrator: 0,
            scaling_blow: config.scaling_blow,
            integrate_min_windup: config.integrate_min_windup,
            blow_start_condition: config.blow_start_condition,
            default_blow_duration: config.default_blow_duration,
        }
    }

    /// Requested blow duration (s)
    pub fn blow(&self) -> f64 {
        self.blow
    }

    pub fn set_blow(&mut self, blow: f64) {
        self.blow = blow.max(0.0);
    }

    pub fn is_blowing(&self) -> bool {
        self.blow_prev > 0.0
    }

    pub fn min_activity_integrator(&self) -> u32 {
        self.min_activity_integrator
    }

    /// Advance the state machine at time `now` (s)
    pub fn update(&mut self, now: f64) -> AirflowCommand {
        let command = if self.blow > 0.0 {
            if self.blow_prev == 0.0 {
                self.start_blow = now;
                debug!("Airflow: Start blowing for {:.1}s", self.blow);
                AirflowCommand::Start
            } else if now - self.start_blow > self.blow {
                debug!("Airflow: Blow of {:.1}s elapsed", self.blow);
                self.blow = 0.0;
                self.min_activity_integrator = 0;
                AirflowCommand::Stop
            } else {
                AirflowCommand::Hold
            }
        } else if self.blow_prev != 0.0 {
            self.min_activity_integrator = 0;
            AirflowCommand::Stop
        } else {
            AirflowCommand::Hold
        };
        self.blow_prev = self.blow;
        command
    }

    /// Minimum-activity heuristic: request a default blow after the group
    /// minimum stays under `scaling_blow` for enough control ticks.
    ///
    /// Returns true when it set a new blow request.
    pub fn evaluate_trigger(&mut self, minimum_activity: f64, in_window: bool) -> bool {
        if !in_window || self.blow != 0.0 {
            return false;
        }
        if self.min_activity_integrator < self.integrate_min_windup {
            if minimum_activity < self.scaling_blow {
                self.min_activity_integrator += 1;
            } else {
                self.min_activity_integrator = 0;
            }
        }
        if self.min_activity_integrator >= self.blow_start_condition {
            self.blow = self.default_blow_duration;
            debug!(
                "Airflow: Minimum activity low for {} ticks, requesting blow",
                self.min_activity_integrator
            );
            return true;
        }
        false
    }
}
