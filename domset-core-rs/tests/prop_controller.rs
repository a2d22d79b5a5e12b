//! Property tests for the group controller
//!
//! - Setpoint never leaves [26, 36]
//! - Heat and cool are never both decided
//! - Group average stays in [0, 1] whatever reports go missing
//! - Reset is idempotent

use domset_core::sampler::ActivityHistory;
use domset_core::*;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn activity() -> impl Strategy<Value = f64> {
    prop_oneof![
        1 => Just(ACTIVITY_SENTINEL),
        6 => 0.0f64..=1.0f64,
    ]
}

fn stats() -> impl Strategy<Value = ActivityStats> {
    (0.0f64..=1.0, 0.0f64..=1.0, 0.0f64..=1.0).prop_map(|(a, b, c)| {
        let mut v = [a, b, c];
        v.sort_by(|x, y| x.total_cmp(y));
        ActivityStats {
            minimum: v[0],
            average: v[1],
            maximum: v[2],
        }
    })
}

// ============================================================================
// Controller
// ============================================================================

proptest! {
    /// CORE INVARIANT: temp_ref stays inside the admissible band
    #[test]
    fn temp_ref_stays_in_bounds(
        ticks in prop::collection::vec((stats(), 1usize..12, -5.0f64..5.0), 1..200)
    ) {
        let mut ctrl = TemperatureController::new(&ControllerConfig::default(), 0.0);
        for (i, (s, group_size, bridge_delta)) in ticks.into_iter().enumerate() {
            let now = 5.0 * i as f64;
            ctrl.integrate(s.average * group_size as f64);
            let d = ctrl.step(&s, group_size, now);
            prop_assert!(d.temp_ref >= MIN_TEMP && d.temp_ref <= MAX_TEMP);
            ctrl.adjust_temp_ref(bridge_delta);
            prop_assert!(ctrl.temp_ref() >= MIN_TEMP && ctrl.temp_ref() <= MAX_TEMP);
        }
    }

    /// Heat and cool are mutually exclusive, and the step is bounded
    #[test]
    fn heat_and_cool_exclusive(
        ticks in prop::collection::vec((stats(), 1usize..20), 1..100)
    ) {
        let mut ctrl = TemperatureController::new(&ControllerConfig::default(), 0.0);
        ctrl.integrate(3.0);
        for (i, (s, group_size)) in ticks.into_iter().enumerate() {
            let d = ctrl.step(&s, group_size, 5.0 * i as f64);
            prop_assert!(!(d.heat && d.cool));
            prop_assert!(d.delta <= 0.5);
            if d.cool {
                prop_assert_eq!(d.delta, -0.03);
            }
        }
    }

    /// The activity integral never decreases and never passes the limit
    #[test]
    fn integral_monotone_and_capped(values in prop::collection::vec(-1.0f64..10.0, 0..300)) {
        let mut ctrl = TemperatureController::new(&ControllerConfig::default(), 0.0);
        let mut prev = 0.0;
        for v in values {
            ctrl.integrate(v);
            let now = ctrl.state().integrate_activity;
            prop_assert!(now >= prev);
            prop_assert!(now <= INTEGRATION_LIMIT);
            prev = now;
        }
    }

    /// Applying reset twice equals applying it once
    #[test]
    fn reset_idempotent(
        ticks in prop::collection::vec(stats(), 0..30),
        at in 0.0f64..2000.0
    ) {
        let mut ctrl = TemperatureController::new(&ControllerConfig::default(), 0.0);
        for (i, s) in ticks.iter().enumerate() {
            ctrl.integrate(s.average);
            ctrl.step(s, 1, 5.0 * i as f64);
        }
        ctrl.reset(at);
        let once = ctrl.state().clone();
        ctrl.reset(at);
        prop_assert_eq!(&once, ctrl.state());
    }
}

// ============================================================================
// Aggregation and sampling
// ============================================================================

proptest! {
    /// CORE INVARIANT: group average in [0, 1]
    #[test]
    fn group_average_in_unit_interval(
        own in activity(),
        reports in prop::collection::vec(prop::option::of(activity()), 0..10)
    ) {
        let own_stats = if own < 0.0 {
            ActivityStats::unknown()
        } else {
            ActivityStats::uniform(own)
        };
        let reports: Vec<(NodeId, Option<GroupReport>)> = reports
            .into_iter()
            .enumerate()
            .map(|(i, a)| {
                let id = i as NodeId + 2;
                (id, a.map(|activity| GroupReport { sender: id, activity, arrival: 0 }))
            })
            .collect();

        let agg = GroupAggregator::new(reports.len() + 1);
        let out = agg.combine(own_stats, reports.iter().map(|(id, r)| (*id, r.as_ref())));

        prop_assert!(out.stats.average >= 0.0 && out.stats.average <= 1.0 + 1e-12);
        prop_assert!(out.functional <= reports.len() + 1);
        prop_assert!(out.stats.minimum <= 1.0 && out.stats.maximum >= 0.0);
    }

    /// History never grows past its capacity
    #[test]
    fn history_bounded(capacity in 1usize..100, values in prop::collection::vec(activity(), 0..400)) {
        let mut history = ActivityHistory::new(capacity);
        for v in values {
            history.push(v);
            prop_assert!(history.len() <= capacity);
        }
        if let Some(mean) = history.valid_mean() {
            prop_assert!((0.0..=1.0).contains(&mean));
        }
    }

    /// Active fraction is the sentinel or a fraction of valid channels
    #[test]
    fn active_fraction_well_formed(raw in prop::array::uniform6(any::<u16>())) {
        let sample = ActivitySample::classify(0, &raw, &[25_000; IR_CHANNELS], 65535);
        let f = sample.active_fraction();
        if sample.valid_count() == 0 {
            prop_assert_eq!(f, ACTIVITY_SENTINEL);
        } else {
            prop_assert!((0.0..=1.0).contains(&f));
        }
    }
}
