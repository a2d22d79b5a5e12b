//! Group activity aggregation (master only)
//!
//! Combines the master's own activity with the latest report of every
//! neighbor. Members without a usable value (sentinel, missing or
//! malformed report) are dropped from the divisor for that tick.

use crate::types::{ActivityStats, GroupReport, NodeId};
use tracing::debug;

/// Result of one aggregation tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupActivity {
    pub stats: ActivityStats,
    /// Members that contributed a valid value
    pub functional: usize,
    /// Sum of the valid member values before normalisation
    pub sum: f64,
}

/// Stateless combiner for a group of fixed size
#[derive(Debug, Clone, Copy)]
pub struct GroupAggregator {
    group_size: usize,
}

impl GroupAggregator {
    pub fn new(group_size: usize) -> Self {
        Self {
            group_size: group_size.max(1),
        }
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Combine self statistics with one entry per neighbor.
    ///
    /// `None` marks a neighbor with no report this tick.
    pub fn combine<'a>(
        &self,
        own: ActivityStats,
        neighbors: impl IntoIterator<Item = (NodeId, Option<&'a GroupReport>)>,
    ) -> GroupActivity {
        let mut functional = self.group_size;

        let mut stats = if own.is_unknown() {
            functional -= 1;
            ActivityStats::default()
        } else {
            own
        };
        let mut sum = stats.average;

        for (id, report) in neighbors {
            match report {
                Some(r) if r.is_functional() => {
                    sum += r.activity;
                    stats.maximum = stats.maximum.max(r.activity);
                    stats.minimum = stats.minimum.min(r.activity);
                }
                Some(_) => {
                    debug!("Aggregator: casu {} reported no valid activity", id);
                    functional = functional.saturating_sub(1);
                }
                None => {
                    debug!("Aggregator: no report from casu {}", id);
                    functional = functional.saturating_sub(1);
                }
            }
        }

        stats.average = if functional > 0 {
            sum / functional as f64
        } else {
            sum
        };

        GroupActivity {
            stats,
            functional,
            sum,
        }
    }
}
