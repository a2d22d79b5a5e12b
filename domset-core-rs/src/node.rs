//! Domset node: one CASU running the group controller
//!
//! Every sample period the node reads its IR array. Every control period
//! (`ttemp / td` samples) it runs one control tick:
//!
//! - master: collect neighbor reports, aggregate, compute the setpoint,
//!   fold in bridge overrides, broadcast the directive, emit telemetry
//! - slave: report its own activity and apply the master's directive
//!
//! followed by the airflow state machine on both roles.
//!
//! All mutable state lives in [`DomsetController`]; nothing is global.

use crate::aggregator::{GroupActivity, GroupAggregator};
use crate::airflow::{Airflow, AirflowCommand};
use crate::bridge::{BridgeOverride, BridgeTelemetry};
use crate::bus::{GroupBus, GroupSnapshot};
use crate::config::ControllerConfig;
use crate::controller::{ControllerState, TemperatureController};
use crate::error::{HalError, Result};
use crate::event_log::EventLog;
use crate::hal::{Hal, Rgb};
use crate::sampler::{Calibration, SensorSampler};
use crate::topology::Topology;
use crate::types::{secs_to_us, ControlDirective, Role, IR_CHANNELS};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

// ============================================================================
// Run Summary
// ============================================================================

/// Why the run loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The external stop flag was raised
    StopFlag,
    /// The configured run length elapsed
    Elapsed,
}

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub control_ticks: u64,
    pub final_temp_ref: f64,
    pub stop_reason: StopReason,
}

// ============================================================================
// Pending Bridge Effects
// ============================================================================

/// Effects of the last bridge override, applied around the next computation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PendingBridge {
    blow: Option<f64>,
    reset_temp: bool,
    reset_threshold: bool,
    delta_temp_ref: f64,
}

impl PendingBridge {
    fn absorb(&mut self, o: &BridgeOverride) {
        self.blow = Some(o.blow);
        self.reset_temp |= o.reset_temp;
        self.reset_threshold |= o.reset_threshold;
        self.delta_temp_ref += o.delta_temp_ref;
    }
}

/// Log a transient HAL failure and carry on; surface a fatal one
fn tolerate(context: &str, result: std::result::Result<(), HalError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            warn!("Node: {} failed: {}", context, e);
            Ok(())
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Per-node controller context
pub struct DomsetController<H: Hal> {
    hal: H,
    config: ControllerConfig,
    topology: Topology,

    // Pipeline
    sampler: SensorSampler,
    aggregator: GroupAggregator,
    controller: TemperatureController,
    airflow: Airflow,
    bus: GroupBus,
    log: EventLog,

    // Setpoint currently applied to the actuator
    temp_ref: f64,
    applied_temp: Option<f64>,
    pending: PendingBridge,
    last_group: Option<GroupActivity>,

    // Timing
    ticks: u64,
    control_ticks: u64,
    phase_reset_done: bool,
}

impl<H: Hal> std::fmt::Debug for DomsetController<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomsetController")
            .field("node", &self.hal.name())
            .field("role", &self.topology.role())
            .field("temp_ref", &self.temp_ref)
            .field("ticks", &self.ticks)
            .finish()
    }
}

impl<H: Hal> DomsetController<H> {
    /// Build a controller; rows go nowhere until [`with_event_log`](Self::with_event_log)
    pub fn new(hal: H, topology: Topology, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let now = hal.time_s();
        info!(
            "Node: {} starting as {} of group {:?} (master casu-{:03})",
            hal.name(),
            topology.role(),
            topology.neighbors().collect::<Vec<_>>(),
            topology.master_id()
        );
        Ok(Self {
            sampler: SensorSampler::new(
                config.default_ir_threshold,
                config.ir_saturation,
                config.history_capacity,
            ),
            aggregator: GroupAggregator::new(topology.group_size()),
            controller: TemperatureController::new(&config, now),
            airflow: Airflow::new(&config),
            bus: GroupBus::new(topology.clone(), config.bridge_sender_tag.clone()),
            log: EventLog::sink(),
            temp_ref: config.initial_temp_ref,
            applied_temp: None,
            pending: PendingBridge::default(),
            last_group: None,
            ticks: 0,
            control_ticks: 0,
            phase_reset_done: false,
            hal,
            config,
            topology,
        })
    }

    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn into_hal(self) -> H {
        self.hal
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn role(&self) -> Role {
        self.topology.role()
    }

    /// Setpoint this node is applying
    pub fn temp_ref(&self) -> f64 {
        self.temp_ref
    }

    /// Master controller state (idle on slaves)
    pub fn controller_state(&self) -> &ControllerState {
        self.controller.state()
    }

    pub fn airflow(&self) -> &Airflow {
        &self.airflow
    }

    pub fn sampler(&self) -> &SensorSampler {
        &self.sampler
    }

    /// Aggregate of the last master control tick
    pub fn last_group(&self) -> Option<&GroupActivity> {
        self.last_group.as_ref()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn control_ticks(&self) -> u64 {
        self.control_ticks
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    // ------------------------------------------------------------------------
    // Setup phases
    // ------------------------------------------------------------------------

    /// Learn per-channel IR thresholds from the empty arena
    pub fn calibrate_ir_thresholds(&mut self) -> Result<[u32; IR_CHANNELS]> {
        tolerate("led", self.hal.set_diagnostic_led(Rgb::RED))?;

        let start = self.hal.time_s();
        let mut calibration = Calibration::new();
        while self.hal.time_s() - start < self.config.calibration_duration {
            match self.hal.read_ir_raw() {
                Ok(raw) => calibration.observe(&raw),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!("Node: Calibration read failed: {}", e),
            }
            self.hal.delay_us(secs_to_us(self.config.td));
        }

        if calibration.samples() > 0 {
            self.sampler
                .set_thresholds(calibration.thresholds(self.config.calibration_margin));
        } else {
            warn!("Node: No calibration samples, keeping default IR thresholds");
        }
        let thresholds = *self.sampler.thresholds();
        info!("Node: {} IR thresholds {:?}", self.hal.name(), thresholds);

        tolerate("led", self.hal.diagnostic_led_standby())?;
        self.log.ir_thresholds(self.hal.time_s(), &thresholds)?;
        Ok(thresholds)
    }

    /// Idle with the LED white for `duration` seconds
    pub fn initial_wait(&mut self, duration: f64) -> Result<()> {
        tolerate("led", self.hal.set_diagnostic_led(Rgb::WHITE))?;
        self.hal.delay_us(secs_to_us(duration));
        tolerate("led", self.hal.diagnostic_led_standby())
    }

    /// Apply the initial setpoint to the actuator.
    ///
    /// Returns the setpoint the actuator held before, when it could be read.
    pub fn initialize_temperature(&mut self) -> Result<Option<f64>> {
        let previous = match self.hal.temp_setpoint() {
            Ok(t) => Some(t),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("Node: Setpoint read failed: {}", e);
                None
            }
        };
        self.temp_ref = self.config.initial_temp_ref;
        info!(
            "Node: {} setpoint {:?} -> {:.2}",
            self.hal.name(),
            previous,
            self.temp_ref
        );
        self.apply_temp_ref()?;
        Ok(previous)
    }

    // ------------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------------

    /// Phase boundary: reset integral, accumulators and ramps
    pub fn begin_phase(&mut self) {
        let now = self.hal.time_s();
        self.controller.reset(now);
        self.phase_reset_done = true;
        info!("Node: {} new phase at {:.1}s", self.hal.name(), now);
    }

    /// One sample period; runs a control tick every `ticks_per_control` calls
    pub fn step(&mut self) -> Result<()> {
        let timestamp = self.hal.time_us();
        let sample = match self.hal.read_ir_raw() {
            Ok(raw) => self.sampler.sample(timestamp, &raw),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("Node: IR read failed: {}", e);
                self.sampler.sample_failed(timestamp)
            }
        };
        self.log
            .active_sensors(self.hal.time_s(), &sample.active_flags())?;

        self.ticks += 1;
        if self.ticks % u64::from(self.config.ticks_per_control()) == 0 {
            self.control_tick()?;
        }
        Ok(())
    }

    /// One control period
    pub fn control_tick(&mut self) -> Result<()> {
        self.control_ticks += 1;
        let own = self.sampler.self_stats();
        self.log.self_activity(self.hal.time_s(), own.average)?;

        if self.topology.is_master() {
            self.update_master()?;
        } else {
            self.update_slave()?;
        }
        self.airflow_control()
    }

    /// Run until `stop` is raised or the run length elapses
    pub fn run(&mut self, stop: &AtomicBool) -> Result<RunSummary> {
        let start = self.hal.time_s();
        self.controller.start_run(start);
        self.log.zero_time(start)?;
        let td_us = secs_to_us(self.config.td);

        let stop_reason = loop {
            if stop.load(Ordering::Relaxed) {
                break StopReason::StopFlag;
            }
            let elapsed = self.hal.time_s() - start;
            if elapsed >= self.config.time_length {
                break StopReason::Elapsed;
            }
            if let Some(baseline) = self.config.baseline_duration_s {
                if !self.phase_reset_done && elapsed >= baseline {
                    self.begin_phase();
                }
            }

            if let Err(e) = self.step() {
                error!("Node: {} stopping: {}", self.hal.name(), e);
                self.standby();
                return Err(e);
            }
            self.hal.delay_us(td_us);
        };

        self.standby();
        info!(
            "Node: {} finished ({:?}) after {} ticks, t_ref={:.2}",
            self.hal.name(),
            stop_reason,
            self.ticks,
            self.temp_ref
        );
        Ok(RunSummary {
            ticks: self.ticks,
            control_ticks: self.control_ticks,
            final_temp_ref: self.temp_ref,
            stop_reason,
        })
    }

    /// Best effort: actuators off, log flushed
    fn standby(&mut self) {
        if let Err(e) = self.hal.airflow_standby() {
            warn!("Node: Airflow standby failed: {}", e);
        }
        if let Err(e) = self.hal.diagnostic_led_standby() {
            warn!("Node: LED standby failed: {}", e);
        }
        if let Err(e) = self.log.flush() {
            warn!("Node: Event log flush failed: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Control tick internals
    // ------------------------------------------------------------------------

    fn update_master(&mut self) -> Result<()> {
        let snapshot = if self.topology.group_size() == 1 {
            self.bus.poll_one(&mut self.hal);
            GroupSnapshot::default()
        } else {
            self.bus.wait_for_group(
                &mut self.hal,
                self.config.group_wait,
                self.config.poll_interval,
            )
        };
        self.respond_to_bridge();

        let now = self.hal.time_s();
        if self.pending.reset_threshold {
            self.controller.restart_ramps(now);
        }

        let own = self.sampler.self_stats();
        let group = self.aggregator.combine(
            own,
            self.topology.neighbors().map(|id| (id, snapshot.get(id))),
        );
        self.controller.integrate(group.sum);
        self.controller
            .step(&group.stats, self.topology.group_size(), now);

        if self.pending.delta_temp_ref != 0.0 {
            self.controller.adjust_temp_ref(self.pending.delta_temp_ref);
        }
        if self.pending.reset_temp {
            self.controller.reset_temp_ref();
        }
        if self.config.blow_trigger_enabled {
            let in_window = self.controller.in_blow_window(now);
            self.airflow
                .evaluate_trigger(group.stats.minimum, in_window);
        }
        if let Some(blow) = self.pending.blow {
            self.airflow.set_blow(blow);
        }
        self.pending = PendingBridge::default();

        self.temp_ref = self.controller.temp_ref();
        let thresholds = self.controller.thresholds();
        self.log.group_activity(now, group.stats.average)?;
        self.log.new_temp(now, self.temp_ref)?;
        self.log.thresholds(now, &thresholds)?;
        self.last_group = Some(group);

        let telemetry = BridgeTelemetry::new(&group.stats, self.temp_ref, &thresholds);
        if let Err(e) = self
            .bus
            .send_telemetry(&mut self.hal, &self.config.bridge_peer, &telemetry)
        {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Node: Telemetry not sent: {}", e);
        }

        let directive = ControlDirective::new(self.temp_ref, self.airflow.blow());
        self.bus.broadcast_directive(&mut self.hal, &directive)?;
        self.apply_temp_ref()
    }

    fn update_slave(&mut self) -> Result<()> {
        let own = self.sampler.self_stats();
        tolerate("report", self.bus.send_report(&mut self.hal, own.average))?;

        match self.bus.wait_for_directive(
            &mut self.hal,
            self.config.directive_wait,
            self.config.poll_interval,
        ) {
            Some(directive) => {
                debug!(
                    "Node: {} directive t_ref={:.2} blow={:.1}",
                    self.hal.name(),
                    directive.t_ref,
                    directive.blow
                );
                self.temp_ref = directive.t_ref;
                self.airflow.set_blow(directive.blow);
            }
            None => warn!(
                "Node: {} keeping t_ref={:.2} without a directive",
                self.hal.name(),
                self.temp_ref
            ),
        }
        self.apply_temp_ref()
    }

    /// Fold the most recent bridge message into the pending effects
    fn respond_to_bridge(&mut self) {
        match self.bus.take_bridge() {
            Some(Ok(o)) => {
                info!("Node: Bridge override {}", o.to_payload());
                self.pending.absorb(&o);
            }
            Some(Err(e)) => warn!("Node: Ignoring bridge message: {}", e),
            None => {}
        }
    }

    fn airflow_control(&mut self) -> Result<()> {
        let now = self.hal.time_s();
        match self.airflow.update(now) {
            AirflowCommand::Start => {
                tolerate("airflow", self.hal.set_airflow_intensity(1.0))?;
                self.log.airflow(now, true)
            }
            AirflowCommand::Stop => {
                tolerate("airflow", self.hal.airflow_standby())?;
                self.log.airflow(now, false)
            }
            AirflowCommand::Hold => Ok(()),
        }
    }

    /// Push the setpoint to the actuator when it differs from the applied one
    fn apply_temp_ref(&mut self) -> Result<()> {
        if self.applied_temp == Some(self.temp_ref) {
            return Ok(());
        }
        tolerate("set_temp", self.hal.set_temp(self.temp_ref))?;
        self.applied_temp = Some(self.temp_ref);
        self.log.current_temp(self.hal.time_s(), self.temp_ref)
    }
}
