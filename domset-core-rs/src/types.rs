//! Core types for the domset protocol

use serde::{Deserialize, Serialize};

/// Numeric CASU identifier (the `NNN` of `casu-NNN`)
pub type NodeId = u32;

/// Timestamp in microseconds on the HAL clock
pub type TimeUs = u64;

/// Number of IR proximity channels on a CASU
pub const IR_CHANNELS: usize = 6;

/// Lowest admissible temperature reference (°C)
pub const MIN_TEMP: f64 = 26.0;

/// Highest admissible temperature reference (°C)
pub const MAX_TEMP: f64 = 36.0;

/// Saturation cap of the activity integral
pub const INTEGRATION_LIMIT: f64 = 100.0;

/// Activity value meaning "no valid reading"
pub const ACTIVITY_SENTINEL: f64 = -1.0;

/// Convert HAL microseconds to seconds
pub fn us_to_secs(t: TimeUs) -> f64 {
    t as f64 / 1_000_000.0
}

/// Convert seconds to HAL microseconds
pub fn secs_to_us(s: f64) -> TimeUs {
    (s.max(0.0) * 1_000_000.0).round() as TimeUs
}

/// Role of a node inside its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Lowest id of the group, computes and broadcasts the directive
    Master,
    /// Reports activity to the master and applies its directives
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

/// Intra-group control directive, master to slaves
///
/// Decoding goes through [`ControlDirective::new`], so a parsed directive
/// always carries a setpoint inside the temperature bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DirectiveWire")]
pub struct ControlDirective {
    pub t_ref: f64,
    pub blow: f64,
}

#[derive(Deserialize)]
struct DirectiveWire {
    t_ref: f64,
    blow: f64,
}

impl TryFrom<DirectiveWire> for ControlDirective {
    type Error = String;

    fn try_from(wire: DirectiveWire) -> Result<Self, Self::Error> {
        if !wire.t_ref.is_finite() || !wire.blow.is_finite() {
            return Err(format!(
                "non-finite directive t_ref={} blow={}",
                wire.t_ref, wire.blow
            ));
        }
        Ok(Self::new(wire.t_ref, wire.blow))
    }
}

impl ControlDirective {
    pub fn new(t_ref: f64, blow: f64) -> Self {
        Self {
            t_ref: t_ref.clamp(MIN_TEMP, MAX_TEMP),
            blow,
        }
    }

    /// Serialize to the JSON wire form `{"t_ref": .., "blow": ..}`
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from the JSON wire form
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Activity report from one neighbor, as held by the master inbox
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupReport {
    pub sender: NodeId,
    /// Reported self average, `ACTIVITY_SENTINEL` if the sender had no valid reading
    pub activity: f64,
    /// Position in the inbound stream
    pub arrival: u64,
}

impl GroupReport {
    pub fn is_functional(&self) -> bool {
        self.activity >= 0.0
    }
}

/// Group-wide activity statistics for one control tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityStats {
    pub average: f64,
    pub maximum: f64,
    pub minimum: f64,
}

impl ActivityStats {
    /// Fallback when there is no valid sample: average unknown, max 0, min 1
    pub fn unknown() -> Self {
        Self {
            average: ACTIVITY_SENTINEL,
            maximum: 0.0,
            minimum: 1.0,
        }
    }

    pub fn uniform(value: f64) -> Self {
        Self {
            average: value,
            maximum: value,
            minimum: value,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.average < 0.0
    }
}

impl Default for ActivityStats {
    fn default() -> Self {
        Self {
            average: 0.0,
            maximum: 0.0,
            minimum: 1.0,
        }
    }
}

/// A raw addressed message as delivered by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub sender: String,
    pub data: String,
}

impl RawMessage {
    pub fn new(sender: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            data: data.into(),
        }
    }
}

/// Canonical peer name for a CASU id
pub fn casu_name(id: NodeId) -> String {
    format!("casu-{:03}", id)
}

/// Parse the three-digit id suffix of a peer name (`casu-007` -> 7)
pub fn parse_casu_id(name: &str) -> Option<NodeId> {
    if name.len() < 3 {
        return None;
    }
    let suffix = name.get(name.len() - 3..)?;
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
