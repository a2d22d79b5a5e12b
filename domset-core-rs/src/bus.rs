//! Addressed message bus on top of the HAL mailbox
//!
//! Inbound traffic is classified once, when it is pulled off the driver:
//! - group neighbor -> master: activity report (JSON number)
//! - master -> slave: control directive (JSON object)
//! - bridge: override text, kept raw until consumed
//!
//! Per sender only the most recent unconsumed value is kept; older queued
//! duplicates are overwritten when the bus catches up.
//!
//! The blocking waits busy-poll the driver. With `WaitPolicy::Unbounded`
//! a silent neighbor (or master) stalls the caller forever; this is the
//! historical behavior and is only logged. `WaitPolicy::Bounded` returns
//! a partial snapshot at the deadline instead.

use crate::bridge::{BridgeOverride, BridgeTelemetry};
use crate::config::WaitPolicy;
use crate::error::{DomsetError, HalError, Result};
use crate::hal::Hal;
use crate::topology::Topology;
use crate::types::{
    parse_casu_id, secs_to_us, ControlDirective, GroupReport, NodeId, RawMessage,
    ACTIVITY_SENTINEL,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Waiting longer than this is reported once per wait
const STALL_WARN_S: f64 = 10.0;

/// Classification of one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Report(GroupReport),
    Directive {
        from: NodeId,
        directive: ControlDirective,
    },
    Bridge(String),
    /// From a recognized peer but unusable, or from an unexpected peer on a slave
    Ignored(RawMessage),
}

/// Reports consumed by one aggregation tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSnapshot {
    pub reports: BTreeMap<NodeId, GroupReport>,
    /// Neighbors with no fresh report
    pub missing: Vec<NodeId>,
    /// The wait ended at its deadline rather than on a full set
    pub timed_out: bool,
}

impl GroupSnapshot {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&GroupReport> {
        self.reports.get(&id)
    }
}

/// Per-node view of the group message bus
#[derive(Debug, Clone)]
pub struct GroupBus {
    topology: Topology,
    bridge_tag: String,
    reports: BTreeMap<NodeId, GroupReport>,
    directive: Option<ControlDirective>,
    bridge: Option<String>,
    arrivals: u64,
    superseded: u64,
}

impl GroupBus {
    pub fn new(topology: Topology, bridge_tag: impl Into<String>) -> Self {
        Self {
            topology,
            bridge_tag: bridge_tag.into(),
            reports: BTreeMap::new(),
            directive: None,
            bridge: None,
            arrivals: 0,
            superseded: 0,
        }
    }

    /// Number of queued values overwritten by a newer one from the same sender
    pub fn superseded(&self) -> u64 {
        self.superseded
    }

    /// Classify a raw message without storing it
    pub fn classify(&mut self, msg: RawMessage) -> Inbound {
        if msg.sender.contains(&self.bridge_tag) {
            return Inbound::Bridge(msg.data);
        }
        let sender = parse_casu_id(&msg.sender);

        if self.topology.is_master() {
            match sender.filter(|id| self.topology.is_neighbor(*id)) {
                Some(id) => {
                    self.arrivals += 1;
                    let activity = parse_activity(&msg.data).unwrap_or_else(|e| {
                        warn!("Bus: Report from casu {} unusable: {}", id, e);
                        ACTIVITY_SENTINEL
                    });
                    Inbound::Report(GroupReport {
                        sender: id,
                        activity,
                        arrival: self.arrivals,
                    })
                }
                // anything not from a group member is bridge input
                None => Inbound::Bridge(msg.data),
            }
        } else if sender == Some(self.topology.master_id()) {
            match ControlDirective::from_json(&msg.data) {
                Ok(directive) => Inbound::Directive {
                    from: self.topology.master_id(),
                    directive,
                },
                Err(e) => {
                    warn!("Bus: Malformed directive from master: {}", e);
                    Inbound::Ignored(msg)
                }
            }
        } else {
            Inbound::Ignored(msg)
        }
    }

    /// Classify and keep the latest value per sender
    pub fn offer(&mut self, msg: RawMessage) {
        match self.classify(msg) {
            Inbound::Report(report) => {
                if self.reports.insert(report.sender, report).is_some() {
                    self.superseded += 1;
                }
            }
            Inbound::Directive { directive, .. } => {
                if self.directive.replace(directive).is_some() {
                    self.superseded += 1;
                }
            }
            Inbound::Bridge(payload) => {
                if self.bridge.replace(payload).is_some() {
                    self.superseded += 1;
                }
            }
            Inbound::Ignored(msg) => {
                debug!("Bus: Ignoring message from {}", msg.sender);
            }
        }
    }

    /// Pull one message off the driver; false if none was waiting
    pub fn poll_one<H: Hal>(&mut self, hal: &mut H) -> bool {
        match hal.read_message() {
            Some(msg) => {
                self.offer(msg);
                true
            }
            None => false,
        }
    }

    /// Pull everything currently waiting
    pub fn drain<H: Hal>(&mut self, hal: &mut H) -> usize {
        let mut n = 0;
        while self.poll_one(hal) {
            n += 1;
        }
        n
    }

    /// Neighbors with no fresh report since the last consumption
    pub fn missing(&self) -> Vec<NodeId> {
        self.topology
            .neighbors()
            .filter(|id| !self.reports.contains_key(id))
            .collect()
    }

    pub fn has_all_reports(&self) -> bool {
        self.topology.neighbors().all(|id| self.reports.contains_key(&id))
    }

    /// Consume the current reports
    pub fn take_reports(&mut self) -> GroupSnapshot {
        let missing = self.missing();
        GroupSnapshot {
            reports: std::mem::take(&mut self.reports),
            missing,
            timed_out: false,
        }
    }

    pub fn take_directive(&mut self) -> Option<ControlDirective> {
        self.directive.take()
    }

    /// Consume the most recent bridge message, parsed
    pub fn take_bridge(&mut self) -> Option<Result<BridgeOverride>> {
        self.bridge.take().map(|payload| BridgeOverride::parse(&payload))
    }

    /// Master barrier: poll until every neighbor reported or the policy gives up
    pub fn wait_for_group<H: Hal>(
        &mut self,
        hal: &mut H,
        policy: WaitPolicy,
        poll_interval_s: f64,
    ) -> GroupSnapshot {
        let complete = self.wait_until(hal, policy, poll_interval_s, |bus| bus.has_all_reports());
        let mut snapshot = self.take_reports();
        snapshot.timed_out = !complete;
        if !complete {
            warn!(
                "Bus: Group wait timed out, missing reports from {:?}",
                snapshot.missing
            );
        }
        snapshot
    }

    /// Slave barrier: poll until the master directive arrives or the policy gives up
    pub fn wait_for_directive<H: Hal>(
        &mut self,
        hal: &mut H,
        policy: WaitPolicy,
        poll_interval_s: f64,
    ) -> Option<ControlDirective> {
        let arrived = self.wait_until(hal, policy, poll_interval_s, |bus| bus.directive.is_some());
        if !arrived {
            warn!(
                "Bus: No directive from master casu {} before deadline",
                self.topology.master_id()
            );
        }
        self.take_directive()
    }

    fn wait_until<H: Hal>(
        &mut self,
        hal: &mut H,
        policy: WaitPolicy,
        poll_interval_s: f64,
        done: impl Fn(&Self) -> bool,
    ) -> bool {
        let started = hal.time_us();
        let deadline = policy.timeout_s().map(|t| started + secs_to_us(t));
        let poll_us = secs_to_us(poll_interval_s).max(1);
        let stall_us = secs_to_us(STALL_WARN_S);
        let mut warned = false;

        loop {
            self.drain(hal);
            if done(self) {
                return true;
            }
            let now = hal.time_us();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return false;
                }
            }
            if !warned && now.saturating_sub(started) >= stall_us {
                warn!(
                    "Bus: {} waiting for {:.0}s, still missing {:?}",
                    hal.name(),
                    STALL_WARN_S,
                    self.stall_reason()
                );
                warned = true;
            }
            hal.delay_us(poll_us);
        }
    }

    fn stall_reason(&self) -> Vec<NodeId> {
        if self.topology.is_master() {
            self.missing()
        } else {
            vec![self.topology.master_id()]
        }
    }

    /// Slave: report self average activity to the master
    pub fn send_report<H: Hal>(&self, hal: &mut H, activity: f64) -> std::result::Result<(), HalError> {
        let payload = serde_json::Value::from(activity).to_string();
        hal.send_message(&self.topology.master_name(), &payload)
    }

    /// Master: send the same directive to every neighbor.
    ///
    /// Transient failures are logged per neighbor; an unreachable device aborts.
    pub fn broadcast_directive<H: Hal>(
        &self,
        hal: &mut H,
        directive: &ControlDirective,
    ) -> Result<()> {
        let payload = directive.to_json()?;
        for id in self.topology.neighbors() {
            let peer = crate::types::casu_name(id);
            match hal.send_message(&peer, &payload) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!("Bus: Failed to send directive to {}: {}", peer, e),
            }
        }
        Ok(())
    }

    /// Master: emit telemetry to the bridge peer
    pub fn send_telemetry<H: Hal>(
        &self,
        hal: &mut H,
        bridge_peer: &str,
        telemetry: &BridgeTelemetry,
    ) -> Result<()> {
        let payload = telemetry.to_json()?;
        hal.send_message(bridge_peer, &payload)?;
        Ok(())
    }
}

/// Parse the leading JSON number of a report payload
fn parse_activity(data: &str) -> Result<f64> {
    let head = data.split(';').next().unwrap_or_default().trim();
    serde_json::from_str::<f64>(head)
        .map_err(|e| DomsetError::Report(format!("{:?}: {}", data, e)))
}
