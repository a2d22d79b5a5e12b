//! IR sensor sampling and the activity history
//!
//! Every sample tick the six raw IR channels are compared against their
//! calibrated thresholds. Channels at the saturation value are ignored for
//! that tick. The fraction of valid channels above threshold is pushed into
//! a bounded history whose mean is the node's self activity.

use crate::types::{ActivityStats, TimeUs, ACTIVITY_SENTINEL, IR_CHANNELS};
use std::collections::VecDeque;

/// One tick of IR readings, classified per channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivitySample {
    pub timestamp: TimeUs,
    /// `None` for a saturated (invalid) channel
    pub channels: [Option<bool>; IR_CHANNELS],
}

impl ActivitySample {
    /// Classify a raw reading against per-channel thresholds
    pub fn classify(
        timestamp: TimeUs,
        raw: &[u16; IR_CHANNELS],
        thresholds: &[u32; IR_CHANNELS],
        saturation: u16,
    ) -> Self {
        let mut channels = [None; IR_CHANNELS];
        for (i, slot) in channels.iter_mut().enumerate() {
            if raw[i] < saturation {
                *slot = Some(u32::from(raw[i]) > thresholds[i]);
            }
        }
        Self { timestamp, channels }
    }

    /// A sample with no valid channel (failed read)
    pub fn invalid(timestamp: TimeUs) -> Self {
        Self {
            timestamp,
            channels: [None; IR_CHANNELS],
        }
    }

    pub fn valid_count(&self) -> usize {
        self.channels.iter().filter(|c| c.is_some()).count()
    }

    /// Fraction of valid channels above threshold, or the sentinel
    pub fn active_fraction(&self) -> f64 {
        let valid = self.valid_count();
        if valid == 0 {
            return ACTIVITY_SENTINEL;
        }
        let active = self.channels.iter().filter(|c| **c == Some(true)).count();
        active as f64 / valid as f64
    }

    /// Per-channel activity with invalid channels reported inactive
    pub fn active_flags(&self) -> [bool; IR_CHANNELS] {
        self.channels.map(|c| c.unwrap_or(false))
    }
}

/// Bounded FIFO of active fractions
#[derive(Debug, Clone)]
pub struct ActivityHistory {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl ActivityHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest entry when full
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Mean of non-sentinel entries
    pub fn valid_mean(&self) -> Option<f64> {
        let (sum, count) = self
            .samples
            .iter()
            .filter(|v| **v >= 0.0)
            .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        (count > 0).then(|| sum / count as f64)
    }

    /// Self statistics: average = max = min = valid mean, or the bounded fallback
    pub fn stats(&self) -> ActivityStats {
        match self.valid_mean() {
            Some(mean) => ActivityStats::uniform(mean),
            None => ActivityStats::unknown(),
        }
    }
}

/// Per-node sampler: thresholds plus history
#[derive(Debug, Clone)]
pub struct SensorSampler {
    thresholds: [u32; IR_CHANNELS],
    saturation: u16,
    history: ActivityHistory,
    last: Option<ActivitySample>,
}

impl SensorSampler {
    pub fn new(default_threshold: u32, saturation: u16, capacity: usize) -> Self {
        Self {
            thresholds: [default_threshold; IR_CHANNELS],
            saturation,
            history: ActivityHistory::new(capacity),
            last: None,
        }
    }

    pub fn thresholds(&self) -> &[u32; IR_CHANNELS] {
        &self.thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: [u32; IR_CHANNELS]) {
        self.thresholds = thresholds;
    }

    /// Classify a raw reading and push its active fraction
    pub fn sample(&mut self, timestamp: TimeUs, raw: &[u16; IR_CHANNELS]) -> ActivitySample {
        let sample = ActivitySample::classify(timestamp, raw, &self.thresholds, self.saturation);
        self.record(sample);
        sample
    }

    /// Record a tick on which the IR array could not be read
    pub fn sample_failed(&mut self, timestamp: TimeUs) -> ActivitySample {
        let sample = ActivitySample::invalid(timestamp);
        self.record(sample);
        sample
    }

    fn record(&mut self, sample: ActivitySample) {
        self.history.push(sample.active_fraction());
        self.last = Some(sample);
    }

    pub fn last_sample(&self) -> Option<&ActivitySample> {
        self.last.as_ref()
    }

    pub fn history(&self) -> &ActivityHistory {
        &self.history
    }

    /// Self average activity over the history window
    pub fn self_stats(&self) -> ActivityStats {
        self.history.stats()
    }
}

/// Running per-channel maximum used to calibrate IR thresholds
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    maxima: [u16; IR_CHANNELS],
    samples: usize,
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, raw: &[u16; IR_CHANNELS]) {
        for (max, value) in self.maxima.iter_mut().zip(raw.iter()) {
            *max = (*max).max(*value);
        }
        self.samples += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Background maximum plus margin, per channel
    pub fn thresholds(&self, margin: u32) -> [u32; IR_CHANNELS] {
        self.maxima.map(|m| u32::from(m) + margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TH: [u32; IR_CHANNELS] = [1000; IR_CHANNELS];

    #[test]
    fn test_active_fraction() {
        let raw = [2000, 2000, 0, 0, 0, 0];
        let s = ActivitySample::classify(0, &raw, &TH, 65535);
        assert!((s.active_fraction() - 2.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_saturated_channels_excluded() {
        let raw = [65535, 65535, 65535, 65535, 2000, 0];
        let s = ActivitySample::classify(0, &raw, &TH, 65535);
        assert_eq!(s.valid_count(), 2);
        assert_eq!(s.active_fraction(), 0.5);
        assert_eq!(s.active_flags(), [false, false, false, false, true, false]);
    }

    #[test]
    fn test_all_saturated_is_sentinel_not_zero() {
        let raw = [65535; IR_CHANNELS];
        let s = ActivitySample::classify(0, &raw, &TH, 65535);
        assert_eq!(s.active_fraction(), ACTIVITY_SENTINEL);
    }

    #[test]
    fn test_threshold_is_strict() {
        let raw = [1000, 1001, 0, 0, 0, 0];
        let s = ActivitySample::classify(0, &raw, &TH, 65535);
        assert_eq!(s.channels[0], Some(false));
        assert_eq!(s.channels[1], Some(true));
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut h = ActivityHistory::new(3);
        for v in [1.0, 0.0, 0.0, 0.0] {
            h.push(v);
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.valid_mean(), Some(0.0));
    }

    #[test]
    fn test_history_mean_skips_sentinels() {
        let mut h = ActivityHistory::new(10);
        h.push(1.0);
        h.push(ACTIVITY_SENTINEL);
        h.push(0.5);
        assert_eq!(h.valid_mean(), Some(0.75));
        assert_eq!(h.stats(), ActivityStats::uniform(0.75));
    }

    #[test]
    fn test_history_without_valid_entries_falls_back() {
        let mut h = ActivityHistory::new(4);
        assert_eq!(h.stats(), ActivityStats::unknown());
        h.push(ACTIVITY_SENTINEL);
        let stats = h.stats();
        assert_eq!(stats.average, -1.0);
        assert_eq!(stats.maximum, 0.0);
        assert_eq!(stats.minimum, 1.0);
    }

    #[test]
    fn test_sampler_failed_read_records_sentinel() {
        let mut sampler = SensorSampler::new(1000, 65535, 5);
        sampler.sample(0, &[2000; IR_CHANNELS]);
        sampler.sample_failed(100_000);
        assert_eq!(sampler.history().len(), 2);
        assert_eq!(sampler.self_stats().average, 1.0);
    }

    #[test]
    fn test_calibration_margin() {
        let mut cal = Calibration::new();
        cal.observe(&[100, 200, 300, 400, 500, 600]);
        cal.observe(&[150, 100, 300, 900, 0, 600]);
        assert_eq!(cal.samples(), 2);
        assert_eq!(cal.thresholds(500), [650, 700, 800, 1400, 1000, 1100]);
    }
}
