//! In-process CASU simulation
//!
//! `SimArena` is a post office shared by every simulated node; `SimCasu`
//! implements [`Hal`] on top of it with a scripted IR array, recorded
//! actuator commands and injectable faults.
//!
//! Two clocks are available:
//! - virtual (default): `delay_us` advances the node's own clock instantly
//! - wall: real elapsed time, optionally sped up, for the arena runner

use crate::error::HalError;
use crate::hal::{Hal, Rgb};
use crate::types::{secs_to_us, us_to_secs, RawMessage, TimeUs, IR_CHANNELS};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// IR reading well above the default detection threshold
pub const IR_ACTIVE: u16 = 30_000;

/// Saturated (invalid) IR reading
pub const IR_SATURATED: u16 = 65_535;

/// Raw IR array with the first `active` channels detecting
pub fn ir_with_active(active: usize) -> [u16; IR_CHANNELS] {
    let mut raw = [0; IR_CHANNELS];
    for v in raw.iter_mut().take(active) {
        *v = IR_ACTIVE;
    }
    raw
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug, Clone)]
struct Envelope {
    not_before: TimeUs,
    msg: RawMessage,
}

/// Shared mailboxes keyed by peer name
#[derive(Debug, Clone, Default)]
pub struct SimArena {
    mailboxes: Arc<Mutex<HashMap<String, VecDeque<Envelope>>>>,
}

impl SimArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for `to`, readable immediately
    pub fn post(&self, from: &str, to: &str, data: &str) {
        self.post_at(from, to, data, 0);
    }

    /// Queue a message for `to`, readable once the recipient clock reaches `not_before`
    pub fn post_at(&self, from: &str, to: &str, data: &str, not_before: TimeUs) {
        self.mailboxes
            .lock()
            .entry(to.to_string())
            .or_default()
            .push_back(Envelope {
                not_before,
                msg: RawMessage::new(from, data),
            });
    }

    /// Number of queued messages for `name`
    pub fn pending(&self, name: &str) -> usize {
        self.mailboxes.lock().get(name).map_or(0, |q| q.len())
    }

    /// Remove and return everything queued for `name`
    pub fn take_all(&self, name: &str) -> Vec<RawMessage> {
        self.mailboxes
            .lock()
            .get_mut(name)
            .map(|q| q.drain(..).map(|e| e.msg).collect())
            .unwrap_or_default()
    }

    fn pop_ready(&self, name: &str, now: TimeUs) -> Option<RawMessage> {
        let mut boxes = self.mailboxes.lock();
        let queue = boxes.get_mut(name)?;
        let pos = queue.iter().position(|e| e.not_before <= now)?;
        queue.remove(pos).map(|e| e.msg)
    }
}

// ============================================================================
// Clock
// ============================================================================

#[derive(Debug)]
enum SimClock {
    Virtual(AtomicU64),
    Wall { origin: Instant, speedup: f64 },
}

impl SimClock {
    fn now_us(&self) -> TimeUs {
        match self {
            SimClock::Virtual(t) => t.load(Ordering::SeqCst),
            SimClock::Wall { origin, speedup } => {
                secs_to_us(origin.elapsed().as_secs_f64() * speedup)
            }
        }
    }

    fn delay(&self, us: u64) {
        match self {
            SimClock::Virtual(t) => {
                t.fetch_add(us, Ordering::SeqCst);
                // let peer threads make progress while this node busy-polls
                std::thread::yield_now();
            }
            SimClock::Wall { speedup, .. } => {
                std::thread::sleep(Duration::from_secs_f64(us_to_secs(us) / speedup));
            }
        }
    }
}

// ============================================================================
// Simulated CASU
// ============================================================================

/// Airflow actuator event
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AirflowEvent {
    On(f64),
    Standby,
}

type IrScript = Box<dyn FnMut(TimeUs) -> [u16; IR_CHANNELS] + Send>;

/// Simulated CASU driver
pub struct SimCasu {
    name: String,
    arena: SimArena,
    clock: SimClock,
    ir: IrScript,

    temp: f64,
    temps: Vec<(f64, f64)>,
    airflow: Vec<(f64, AirflowEvent)>,
    led: Option<Rgb>,
    led_history: Vec<Option<Rgb>>,
    sent: u64,

    ir_faults: u32,
    ir_fault_from: Option<(TimeUs, HalError)>,
    send_faults: u32,
}

impl std::fmt::Debug for SimCasu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCasu")
            .field("name", &self.name)
            .field("clock", &self.clock)
            .field("temp", &self.temp)
            .finish()
    }
}

impl SimCasu {
    /// Node on a virtual clock starting at 0 with an idle IR array
    pub fn new(name: impl Into<String>, arena: SimArena) -> Self {
        Self {
            name: name.into(),
            arena,
            clock: SimClock::Virtual(AtomicU64::new(0)),
            ir: Box::new(|_| [0; IR_CHANNELS]),
            temp: 28.0,
            temps: Vec::new(),
            airflow: Vec::new(),
            led: None,
            led_history: Vec::new(),
            sent: 0,
            ir_faults: 0,
            ir_fault_from: None,
            send_faults: 0,
        }
    }

    /// Run on the wall clock, `speedup` times faster than real time.
    ///
    /// A speedup that is not a positive finite number runs in real time.
    pub fn with_wall_clock(mut self, speedup: f64) -> Self {
        let speedup = if speedup.is_finite() && speedup > 0.0 {
            speedup
        } else {
            1.0
        };
        self.clock = SimClock::Wall {
            origin: Instant::now(),
            speedup,
        };
        self
    }

    /// Constant IR reading
    pub fn with_ir(self, raw: [u16; IR_CHANNELS]) -> Self {
        self.with_ir_script(move |_| raw)
    }

    /// IR reading as a function of the node clock
    pub fn with_ir_script(
        mut self,
        script: impl FnMut(TimeUs) -> [u16; IR_CHANNELS] + Send + 'static,
    ) -> Self {
        self.ir = Box::new(script);
        self
    }

    /// The next `count` IR reads fail transiently
    pub fn fail_ir_reads(&mut self, count: u32) {
        self.ir_faults = count;
    }

    /// Every IR read from `at` on fails with `error`
    pub fn fail_ir_from(&mut self, at: TimeUs, error: HalError) {
        self.ir_fault_from = Some((at, error));
    }

    /// The next `count` sends fail transiently
    pub fn fail_sends(&mut self, count: u32) {
        self.send_faults = count;
    }

    /// Advance a virtual clock (no-op on the wall clock)
    pub fn advance_time(&self, us: u64) {
        if let SimClock::Virtual(t) = &self.clock {
            t.fetch_add(us, Ordering::SeqCst);
        }
    }

    pub fn arena(&self) -> &SimArena {
        &self.arena
    }

    /// Current actuator setpoint
    pub fn temp(&self) -> f64 {
        self.temp
    }

    /// Every setpoint command as (time s, temp)
    pub fn temp_history(&self) -> &[(f64, f64)] {
        &self.temps
    }

    pub fn airflow_history(&self) -> &[(f64, AirflowEvent)] {
        &self.airflow
    }

    pub fn led(&self) -> Option<Rgb> {
        self.led
    }

    pub fn led_history(&self) -> &[Option<Rgb>] {
        &self.led_history
    }

    /// Messages successfully sent
    pub fn sent(&self) -> u64 {
        self.sent
    }

    fn set_led(&mut self, led: Option<Rgb>) {
        self.led = led;
        self.led_history.push(led);
    }
}

impl Hal for SimCasu {
    fn name(&self) -> &str {
        &self.name
    }

    fn time_us(&self) -> TimeUs {
        self.clock.now_us()
    }

    fn delay_us(&self, us: u64) {
        self.clock.delay(us);
    }

    fn read_ir_raw(&mut self) -> Result<[u16; IR_CHANNELS], HalError> {
        let now = self.time_us();
        if let Some((at, error)) = &self.ir_fault_from {
            if now >= *at {
                return Err(error.clone());
            }
        }
        if self.ir_faults > 0 {
            self.ir_faults -= 1;
            return Err(HalError::Transient("ir read timeout".into()));
        }
        Ok((self.ir)(now))
    }

    fn temp_setpoint(&self) -> Result<f64, HalError> {
        Ok(self.temp)
    }

    fn set_temp(&mut self, temp: f64) -> Result<(), HalError> {
        self.temp = temp;
        let t = self.time_s();
        self.temps.push((t, temp));
        Ok(())
    }

    fn set_airflow_intensity(&mut self, intensity: f64) -> Result<(), HalError> {
        let t = self.time_s();
        self.airflow.push((t, AirflowEvent::On(intensity)));
        Ok(())
    }

    fn airflow_standby(&mut self) -> Result<(), HalError> {
        let t = self.time_s();
        self.airflow.push((t, AirflowEvent::Standby));
        Ok(())
    }

    fn set_diagnostic_led(&mut self, color: Rgb) -> Result<(), HalError> {
        self.set_led(Some(color));
        Ok(())
    }

    fn diagnostic_led_standby(&mut self) -> Result<(), HalError> {
        self.set_led(None);
        Ok(())
    }

    fn send_message(&mut self, peer: &str, payload: &str) -> Result<(), HalError> {
        if self.send_faults > 0 {
            self.send_faults -= 1;
            return Err(HalError::Transient(format!("send to {} dropped", peer)));
        }
        self.arena.post(&self.name, peer, payload);
        self.sent += 1;
        Ok(())
    }

    fn read_message(&mut self) -> Option<RawMessage> {
        let now = self.time_us();
        self.arena.pop_ready(&self.name, now)
    }
}
