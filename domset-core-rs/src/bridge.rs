//! Cross-species bridge channel
//!
//! Masters emit one telemetry record per control period and accept
//! override directives from the bridge. Overrides arrive as `;`-joined
//! `key:value` text, telemetry leaves as JSON with 3-decimal string fields.

use crate::controller::Thresholds;
use crate::error::{DomsetError, Result};
use crate::types::ActivityStats;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const FIELD_BLOW: &str = "blow";
const FIELD_RESET_TEMP: &str = "reset_temp";
const FIELD_DELTA_TEMP_REF: &str = "delta_temp_ref";
const FIELD_RESET_THRESHOLD: &str = "reset_threshold";

/// Override directive sent by the bridge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeOverride {
    /// Blow duration (s); replaces any locally computed blow
    pub blow: f64,
    /// Restore the initial temperature reference
    pub reset_temp: bool,
    /// Offset added to the temperature reference
    pub delta_temp_ref: f64,
    /// Restart the heat and cool threshold ramps
    pub reset_threshold: bool,
}

impl BridgeOverride {
    /// Parse `blow:<f>;reset_temp:<f>;delta_temp_ref:<f>;reset_threshold:<f>`.
    ///
    /// Field order is free and unknown keys are ignored; every expected key
    /// must be present with a finite numeric value.
    pub fn parse(payload: &str) -> Result<Self> {
        let fields: HashMap<&str, &str> = payload
            .split(';')
            .filter_map(|part| part.split_once(':'))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let number = |field: &str| -> Result<f64> {
            fields
                .get(field)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .ok_or_else(|| DomsetError::BridgeParse {
                    field: field.to_string(),
                    payload: payload.to_string(),
                })
        };

        Ok(Self {
            blow: number(FIELD_BLOW)?,
            reset_temp: number(FIELD_RESET_TEMP)? == 1.0,
            delta_temp_ref: number(FIELD_DELTA_TEMP_REF)?,
            reset_threshold: number(FIELD_RESET_THRESHOLD)? == 1.0,
        })
    }

    /// Render in the bridge wire format
    pub fn to_payload(&self) -> String {
        format!(
            "{}:{};{}:{};{}:{};{}:{}",
            FIELD_BLOW,
            self.blow,
            FIELD_RESET_TEMP,
            if self.reset_temp { 1.0 } else { 0.0 },
            FIELD_DELTA_TEMP_REF,
            self.delta_temp_ref,
            FIELD_RESET_THRESHOLD,
            if self.reset_threshold { 1.0 } else { 0.0 },
        )
    }
}

/// Telemetry record sent to the bridge every control period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTelemetry {
    pub max: String,
    pub avg: String,
    pub min: String,
    #[serde(rename = "tref")]
    pub temp_ref: String,
    #[serde(rename = "thres_max")]
    pub threshold_cool: String,
    #[serde(rename = "thres_avg")]
    pub threshold_heat: String,
    #[serde(rename = "thres_min")]
    pub threshold_blow: String,
}

fn fmt3(value: f64) -> String {
    format!("{:.3}", value)
}

impl BridgeTelemetry {
    pub fn new(stats: &ActivityStats, temp_ref: f64, thresholds: &Thresholds) -> Self {
        Self {
            max: fmt3(stats.maximum),
            avg: fmt3(stats.average),
            min: fmt3(stats.minimum),
            temp_ref: fmt3(temp_ref),
            threshold_cool: fmt3(thresholds.cool),
            threshold_heat: fmt3(thresholds.heat),
            threshold_blow: fmt3(thresholds.blow),
        }
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
