//! End-to-end controller scenarios on simulated CASUs

use domset_core::sim::{ir_with_active, AirflowEvent, SimArena, SimCasu};
use domset_core::{
    secs_to_us, ControllerConfig, DomsetController, EventLog, Hal, HalError, StopReason,
    Topology, WaitPolicy, IR_CHANNELS,
};
use std::sync::atomic::AtomicBool;

const IDLE: [u16; IR_CHANNELS] = [0; IR_CHANNELS];

fn lone_node(casu: SimCasu, config: ControllerConfig) -> DomsetController<SimCasu> {
    DomsetController::new(casu, Topology::new(1, []), config).unwrap()
}

/// Differences between successive setpoints sent to the actuator
fn setpoint_steps(casu: &SimCasu) -> Vec<f64> {
    casu.temp_history()
        .windows(2)
        .map(|w| w[1].1 - w[0].1)
        .collect()
}

/// Advance one control period by hand
fn control_period(node: &mut DomsetController<SimCasu>) {
    for _ in 0..node.config().ticks_per_control() {
        node.step().unwrap();
        node.hal_mut().delay_us(100_000);
    }
}

// ============================================================================
// Lone node
// ============================================================================

#[test]
fn lone_node_full_activity_heats_to_max() {
    let casu = SimCasu::new("casu-001", SimArena::new()).with_ir(ir_with_active(6));
    let mut node = lone_node(casu, ControllerConfig::default().with_time_length(1200.0));
    node.initialize_temperature().unwrap();

    let summary = node.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(summary.stop_reason, StopReason::Elapsed);
    assert_eq!(summary.ticks, 12_000);
    assert_eq!(summary.control_ticks, 240);
    assert_eq!(summary.final_temp_ref, 36.0);
    assert_eq!(node.hal().temp(), 36.0);
    // latch saturated long ago
    assert_eq!(node.controller_state().temp_ctrl, 10);

    // +step_heat per control period until the clamp
    let steps = setpoint_steps(node.hal());
    let (last, climb) = steps.split_last().unwrap();
    assert!(!climb.is_empty());
    for step in climb {
        assert!((step - 0.05).abs() < 1e-9, "heating step {step}");
    }
    assert!(*last > 0.0 && *last <= 0.05 + 1e-9, "final step {last}");
    // after the initial setpoint, one change per control period
    for w in node.hal().temp_history()[1..].windows(2) {
        assert!((w[1].0 - w[0].0 - 5.0).abs() < 1e-6, "setpoints {:?}", w);
    }
}

#[test]
fn lone_node_cools_to_min_once_activity_stops() {
    let casu = SimCasu::new("casu-001", SimArena::new()).with_ir_script(|t| {
        if t < 30_000_000 {
            ir_with_active(6)
        } else {
            IDLE
        }
    });
    let mut node = lone_node(casu, ControllerConfig::default().with_time_length(900.0));
    let summary = node.run(&AtomicBool::new(false)).unwrap();

    assert_eq!(summary.final_temp_ref, 26.0);
    let temps = node.hal().temp_history();
    let peak = temps.iter().map(|(_, t)| *t).fold(f64::MIN, f64::max);
    assert!(peak > 28.0, "expected initial heating, peak {peak}");

    // a run of +step_heat, then -step_cool per control period until the clamp
    let steps = setpoint_steps(node.hal());
    let turn = steps.iter().position(|s| *s < 0.0).unwrap();
    assert!(turn > 0);
    for step in &steps[..turn] {
        assert!((step - 0.05).abs() < 1e-9, "heating step {step}");
    }
    let (last, descent) = steps[turn..].split_last().unwrap();
    assert!(!descent.is_empty());
    for step in descent {
        assert!((step + 0.03).abs() < 1e-9, "cooling step {step}");
    }
    assert!(*last < 0.0 && *last >= -0.03 - 1e-9, "final step {last}");
}

#[test]
fn no_activity_never_latches() {
    let casu = SimCasu::new("casu-001", SimArena::new()).with_ir(IDLE);
    let mut node = lone_node(casu, ControllerConfig::default().with_time_length(300.0));
    let summary = node.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(summary.final_temp_ref, 28.0);
    assert_eq!(node.controller_state().temp_ctrl, 0);
    assert_eq!(node.controller_state().integrate_activity, 0.0);
}

#[test]
fn saturated_sensors_do_not_count_as_activity() {
    let casu = SimCasu::new("casu-001", SimArena::new()).with_ir([65535; IR_CHANNELS]);
    let mut node = lone_node(casu, ControllerConfig::default());
    control_period(&mut node);
    assert!(node.sampler().self_stats().is_unknown());
    let group = node.last_group().unwrap();
    assert_eq!(group.functional, 0);
    assert_eq!(group.stats.average, 0.0);
}

#[test]
fn stop_flag_ends_run_immediately() {
    let casu = SimCasu::new("casu-001", SimArena::new());
    let mut node = lone_node(casu, ControllerConfig::default());
    let summary = node.run(&AtomicBool::new(true)).unwrap();
    assert_eq!(summary.stop_reason, StopReason::StopFlag);
    assert_eq!(summary.ticks, 0);
    assert_eq!(node.hal().airflow_history(), &[(0.0, AirflowEvent::Standby)]);
}

// ============================================================================
// Airflow
// ============================================================================

#[test]
fn bridge_blow_runs_about_sixty_seconds() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-001", arena.clone()).with_ir(IDLE);
    arena.post(
        "cats-iface",
        "casu-001",
        "blow:60;reset_temp:0;delta_temp_ref:0;reset_threshold:0",
    );
    let mut node = lone_node(casu, ControllerConfig::default().with_time_length(120.0));
    node.run(&AtomicBool::new(false)).unwrap();

    let events = node.hal().airflow_history();
    let (on_at, first) = events[0];
    assert_eq!(first, AirflowEvent::On(1.0));
    let (off_at, second) = events[1];
    assert_eq!(second, AirflowEvent::Standby);
    let duration = off_at - on_at;
    assert!(duration > 60.0 && duration <= 65.0 + 1e-6, "blew for {duration}");
    assert!(!node.airflow().is_blowing());
}

// ============================================================================
// Group waits
// ============================================================================

#[test]
fn bounded_wait_returns_partial_group_on_silent_neighbor() {
    let casu = SimCasu::new("casu-001", SimArena::new()).with_ir(ir_with_active(3));
    let config = ControllerConfig::default().with_wait_policy(WaitPolicy::bounded(10.0));
    let mut node = DomsetController::new(casu, Topology::new(1, [2]), config).unwrap();

    for _ in 0..10 {
        node.step().unwrap();
    }
    let before = node.hal().time_s();
    node.control_tick().unwrap();
    let waited = node.hal().time_s() - before;

    assert!(waited >= 10.0 && waited < 10.1, "waited {waited}");
    let group = node.last_group().unwrap();
    assert_eq!(group.functional, 1);
    assert_eq!(group.stats.average, 0.5);
}

#[test]
fn unbounded_wait_blocks_until_report_arrives() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-001", arena.clone()).with_ir(ir_with_active(6));
    arena.post_at("casu-002", "casu-001", "0.5", secs_to_us(30.0));
    let config = ControllerConfig::default().with_wait_policy(WaitPolicy::Unbounded);
    let mut node = DomsetController::new(casu, Topology::new(1, [2]), config).unwrap();

    for _ in 0..10 {
        node.step().unwrap();
    }
    node.control_tick().unwrap();

    assert!(node.hal().time_s() >= 30.0);
    let group = node.last_group().unwrap();
    assert_eq!(group.functional, 2);
    assert!((group.stats.average - 0.75).abs() < 1e-12);
    assert_eq!(group.stats.minimum, 0.5);
    // directive went to the neighbor
    let sent = arena.take_all("casu-002");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].data.contains("t_ref"));
}

#[test]
fn slave_keeps_setpoint_without_directive() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-002", arena.clone()).with_ir(ir_with_active(6));
    let mut node =
        DomsetController::new(casu, Topology::new(2, [1]), ControllerConfig::default()).unwrap();
    control_period(&mut node);

    assert_eq!(node.temp_ref(), 28.0);
    let reports = arena.take_all("casu-001");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].data.parse::<f64>().unwrap(), 1.0);
}

#[test]
fn slave_applies_master_directive() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-002", arena.clone());
    arena.post("casu-001", "casu-002", r#"{"t_ref":31.5,"blow":20.0}"#);
    let mut node =
        DomsetController::new(casu, Topology::new(2, [1, 3]), ControllerConfig::default())
            .unwrap();
    control_period(&mut node);

    assert_eq!(node.temp_ref(), 31.5);
    assert_eq!(node.hal().temp(), 31.5);
    assert!(node.airflow().is_blowing());
}

#[test]
fn slave_clamps_out_of_range_directive() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-002", arena.clone());
    arena.post("casu-001", "casu-002", r#"{"t_ref":50.0,"blow":0.0}"#);
    let mut node =
        DomsetController::new(casu, Topology::new(2, [1]), ControllerConfig::default()).unwrap();
    control_period(&mut node);

    assert_eq!(node.temp_ref(), 36.0);
    assert_eq!(node.hal().temp(), 36.0);
}

#[test]
fn master_integrates_group_sum() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-001", arena.clone()).with_ir(ir_with_active(6));
    arena.post("casu-002", "casu-001", "1.0");
    let mut node =
        DomsetController::new(casu, Topology::new(1, [2]), ControllerConfig::default()).unwrap();
    control_period(&mut node);

    let group = node.last_group().unwrap();
    assert_eq!(group.functional, 2);
    assert_eq!(group.stats.average, 1.0);
    assert_eq!(node.controller_state().integrate_activity, 2.0);
}

#[test]
fn master_and_slave_run_together() {
    let arena = SimArena::new();
    let config = ControllerConfig::default().with_time_length(120.0);
    let master = DomsetController::new(
        SimCasu::new("casu-001", arena.clone()).with_ir(ir_with_active(6)),
        Topology::new(1, [2]),
        config.clone(),
    )
    .unwrap();
    let slave = DomsetController::new(
        SimCasu::new("casu-002", arena.clone()).with_ir(ir_with_active(6)),
        Topology::new(2, [1]),
        config,
    )
    .unwrap();

    let stop = AtomicBool::new(false);
    let (master, slave) = std::thread::scope(|s| {
        let m = s.spawn(|| {
            let mut node = master;
            node.run(&stop).map(|summary| (summary, node.into_hal()))
        });
        let sl = s.spawn(|| {
            let mut node = slave;
            node.run(&stop).map(|summary| (summary, node.into_hal()))
        });
        (m.join().unwrap(), sl.join().unwrap())
    });
    let (master_summary, master_hal) = master.unwrap();
    let (_, slave_hal) = slave.unwrap();

    assert!(master_summary.final_temp_ref > 28.0);
    let master_temps: Vec<f64> = master_hal.temp_history().iter().map(|(_, t)| *t).collect();
    for (_, t) in slave_hal.temp_history() {
        assert!(
            *t == 28.0 || master_temps.iter().any(|m| (m - t).abs() < 1e-9),
            "slave applied {t} which the master never set"
        );
    }
}

// ============================================================================
// Bridge overrides
// ============================================================================

#[test]
fn bridge_delta_and_reset_temp() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-001", arena.clone()).with_ir(IDLE);
    let mut node = lone_node(casu, ControllerConfig::default());

    arena.post(
        "cats-iface",
        "casu-001",
        "blow:0;reset_temp:0;delta_temp_ref:2;reset_threshold:0",
    );
    control_period(&mut node);
    assert_eq!(node.temp_ref(), 30.0);

    // consumed: no further shift
    control_period(&mut node);
    assert_eq!(node.temp_ref(), 30.0);

    arena.post(
        "cats-iface",
        "casu-001",
        "blow:0;reset_temp:1;delta_temp_ref:0;reset_threshold:0",
    );
    control_period(&mut node);
    assert_eq!(node.temp_ref(), 28.0);
    assert_eq!(node.hal().temp(), 28.0);
}

#[test]
fn bridge_delta_is_clamped() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-001", arena.clone()).with_ir(IDLE);
    let mut node = lone_node(casu, ControllerConfig::default());
    arena.post(
        "cats-iface",
        "casu-001",
        "blow:0;reset_temp:0;delta_temp_ref:50;reset_threshold:0",
    );
    control_period(&mut node);
    assert_eq!(node.temp_ref(), 36.0);
}

#[test]
fn bridge_reset_threshold_restarts_ramps_only() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-001", arena.clone()).with_ir(ir_with_active(6));
    let mut node = lone_node(casu, ControllerConfig::default());
    for _ in 0..4 {
        control_period(&mut node);
    }
    let integral = node.controller_state().integrate_activity;
    assert!(integral > 0.0);

    arena.post(
        "cats-iface",
        "casu-001",
        "blow:0;reset_temp:0;delta_temp_ref:0;reset_threshold:1",
    );
    control_period(&mut node);
    let state = node.controller_state();
    assert!(state.time_start_heat > 0.0);
    assert_eq!(state.time_start_heat, state.time_start_cool);
    // the integral keeps growing
    assert_eq!(state.integrate_activity, integral + 1.0);
}

#[test]
fn malformed_bridge_message_is_ignored() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-001", arena.clone()).with_ir(IDLE);
    let mut node = lone_node(casu, ControllerConfig::default());
    arena.post("cats-iface", "casu-001", "blow:60");
    control_period(&mut node);
    assert_eq!(node.temp_ref(), 28.0);
    assert!(!node.airflow().is_blowing());
}

#[test]
fn non_finite_bridge_values_are_rejected() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-001", arena.clone()).with_ir(IDLE);
    let mut node = lone_node(casu, ControllerConfig::default());

    for bad in ["NaN", "inf", "-inf"] {
        arena.post(
            "cats-iface",
            "casu-001",
            &format!("blow:0;reset_temp:0;delta_temp_ref:{};reset_threshold:0", bad),
        );
        control_period(&mut node);
        assert_eq!(node.temp_ref(), 28.0, "after delta {bad}");
    }
    arena.post(
        "cats-iface",
        "casu-001",
        "blow:NaN;reset_temp:0;delta_temp_ref:0;reset_threshold:0",
    );
    control_period(&mut node);

    assert_eq!(node.hal().temp(), 28.0);
    assert!(!node.airflow().is_blowing());
    assert!(node.hal().airflow_history().is_empty());
}

#[test]
fn master_emits_telemetry_every_control_period() {
    let arena = SimArena::new();
    let casu = SimCasu::new("casu-001", arena.clone()).with_ir(ir_with_active(3));
    let mut node = lone_node(casu, ControllerConfig::default());
    control_period(&mut node);
    control_period(&mut node);

    let telemetry = arena.take_all("cats");
    assert_eq!(telemetry.len(), 2);
    let json: serde_json::Value = serde_json::from_str(&telemetry[1].data).unwrap();
    assert_eq!(json["avg"], "0.500");
    assert_eq!(json["tref"], "28.000");
    assert_eq!(json["thres_min"], "0.000");
}

// ============================================================================
// Phases and failures
// ============================================================================

#[test]
fn baseline_resets_controller_once() {
    let casu = SimCasu::new("casu-001", SimArena::new()).with_ir(ir_with_active(6));
    let config = ControllerConfig::default()
        .with_time_length(120.0)
        .with_baseline(60.0);
    let mut node = lone_node(casu, config);
    node.run(&AtomicBool::new(false)).unwrap();

    let state = node.controller_state();
    assert_eq!(state.time_start_heat, 60.0);
    assert_eq!(state.time_start_cool, 60.0);
    // control ticks at 64.9 s .. 119.9 s after the reset
    assert_eq!(state.integrate_activity, 12.0);
}

#[test]
fn transient_ir_failures_are_tolerated() {
    let mut casu = SimCasu::new("casu-001", SimArena::new()).with_ir(ir_with_active(6));
    casu.fail_ir_reads(20);
    let mut node = lone_node(casu, ControllerConfig::default().with_time_length(30.0));
    let summary = node.run(&AtomicBool::new(false)).unwrap();
    assert_eq!(summary.ticks, 300);
    assert_eq!(node.sampler().self_stats().average, 1.0);
}

#[test]
fn unreachable_device_stops_run_in_standby() {
    let dir = tempfile::tempdir().unwrap();
    let mut casu = SimCasu::new("casu-001", SimArena::new()).with_ir(ir_with_active(6));
    casu.fail_ir_from(secs_to_us(20.0), HalError::Unreachable("usb".into()));
    let log = EventLog::create(dir.path(), "casu-001").unwrap();
    let path = log.path().unwrap().to_path_buf();
    let mut node = lone_node(casu, ControllerConfig::default()).with_event_log(log);

    let err = node.run(&AtomicBool::new(false)).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(node.ticks(), 200);
    assert_eq!(
        node.hal().airflow_history().last().map(|(_, e)| *e),
        Some(AirflowEvent::Standby)
    );
    assert_eq!(node.hal().led(), None);

    // log was flushed on the way out
    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.starts_with("ZT;0\n"));
    assert_eq!(text.lines().filter(|l| l.starts_with("CAS;")).count(), 200);
}

#[test]
fn event_log_records_control_rows() {
    let dir = tempfile::tempdir().unwrap();
    let casu = SimCasu::new("casu-001", SimArena::new()).with_ir(ir_with_active(6));
    let log = EventLog::create(dir.path(), "casu-001").unwrap();
    let path = log.path().unwrap().to_path_buf();
    let mut node = lone_node(casu, ControllerConfig::default().with_time_length(10.0))
        .with_event_log(log);
    node.calibrate_ir_thresholds().unwrap();
    node.initialize_temperature().unwrap();
    node.run(&AtomicBool::new(false)).unwrap();

    let text = std::fs::read_to_string(path).unwrap();
    let count = |tag: &str| text.lines().filter(|l| l.split(';').next() == Some(tag)).count();
    assert_eq!(count("IRT"), 1);
    assert_eq!(count("ZT"), 1);
    assert_eq!(count("CT"), 1);
    assert_eq!(count("CAS"), 100);
    assert_eq!(count("CAC"), 2);
    assert_eq!(count("NAC"), 2);
    assert_eq!(count("NT"), 2);
    assert_eq!(count("TH_HEAT"), 2);
    assert_eq!(count("TH_COOL"), 2);
    assert_eq!(count("TH_MIN"), 2);
}
