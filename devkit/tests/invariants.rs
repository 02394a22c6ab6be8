//! Properties that must hold on every cycle, whatever the network does.

use std::time::Duration;

use pinger_devkit::fixtures::{device, devices, snmp_device, test_config};
use pinger_devkit::{ScriptedProber, Step, TestHarness};
use pinger_kernel::log_buffer::FlushResult;
use pinger_kernel::models::{ProbeKind, SnmpMetrics};

#[tokio::test(start_paused = true)]
async fn in_flight_probes_never_exceed_the_limit() {
    let mut config = test_config();
    config.concurrency.initial = 10;
    let prober = ScriptedProber::new().with_delay(Duration::from_millis(100));
    let mut h = TestHarness::builder().config(config).devices(devices(40)).prober(prober).build().await.unwrap();

    for _ in 0..4 {
        let limit_at_start = h.supervisor.concurrency().current_limit();
        h.prober.reset_max_in_flight();
        let report = h.cycle().await.unwrap();
        let observed = h.prober.max_in_flight();
        assert!(observed > 0);
        assert!(observed <= limit_at_start, "{observed} probes in flight with limit {limit_at_start}");
        assert_eq!(report.probed, 40);
    }
    // 4 x 100 ms cycles are fast, so the limit grew in single steps
    assert_eq!(h.supervisor.concurrency().current_limit(), 30);
}

#[tokio::test]
async fn each_device_is_probed_once_per_cycle() {
    let mut registry = devices(5);
    registry.push(device("3"));
    let mut h = TestHarness::new(registry).await.unwrap();

    let report = h.cycle().await.unwrap();
    assert_eq!(report.devices, 5);
    for id in 1..=5 {
        assert_eq!(h.prober.calls(&id.to_string()), 1);
    }
    h.cycle().await.unwrap();
    assert_eq!(h.prober.calls("3"), 2);
}

#[tokio::test]
async fn transitions_and_notifications_match_one_to_one() {
    let prober = ScriptedProber::new();
    prober.script("1", [Step::Up(5), Step::down(), Step::down(), Step::Up(5)]);
    prober.script("2", [Step::down(), Step::Up(5), Step::Up(5), Step::down()]);
    let mut h = TestHarness::builder().devices(devices(3)).prober(prober).build().await.unwrap();

    let mut transitions = 0;
    for _ in 0..4 {
        let report = h.cycle().await.unwrap();
        transitions += report.transitions.len();
        assert_eq!(report.dispatch.queued, report.transitions.len());
    }
    assert_eq!(transitions, 4);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 4);
    assert_eq!(sent.iter().filter(|m| m.device_id == "1").count(), 2);
}

#[tokio::test]
async fn quiet_device_gets_a_heartbeat_per_interval() {
    let prober = ScriptedProber::new().with_default(Step::Up(12));
    let mut h = TestHarness::builder().devices(devices(1)).prober(prober).build().await.unwrap();

    // 11 cycles, 60 s apart: 0 .. 600 s
    h.cycles(11, Duration::from_secs(60)).await.unwrap();

    let records = h.ping_log.for_device("1");
    let stamps: Vec<i64> = records.iter().map(|r| r.timestamp.unix_timestamp()).collect();
    assert_eq!(stamps.len(), 3);
    assert_eq!(stamps[1] - stamps[0], 300);
    assert_eq!(stamps[2] - stamps[1], 300);
}

#[tokio::test]
async fn logworthy_outcomes_reach_the_sink_in_the_same_cycle() {
    let prober = ScriptedProber::new();
    prober.script("2", [Step::Up(5), Step::down()]);
    let mut h = TestHarness::builder().devices(devices(3)).prober(prober).build().await.unwrap();

    let first = h.cycle().await.unwrap();
    assert_eq!(first.logged, 3);
    assert_eq!(h.ping_log.records().len(), 3);

    let second = h.cycle().await.unwrap();
    assert_eq!(second.logged, 1);
    let down = h.ping_log.for_device("2");
    assert_eq!(down.len(), 2);
    assert!(!down[1].reachable);
    assert_eq!(down[1].kind, ProbeKind::IcmpTimeout);
    assert!(h.supervisor.buffer().is_empty());
}

#[tokio::test]
async fn more_logworthy_outcomes_than_buffer_slots_all_reach_the_sink() {
    // default buffer holds 100 records
    let mut h = TestHarness::new(devices(250)).await.unwrap();

    let report = h.cycle().await.unwrap();
    assert_eq!(report.logged, 250);
    assert_eq!(report.written, 250);
    assert_eq!(report.flush, FlushResult::Written(50));
    assert_eq!(h.ping_log.records().len(), 250);
    assert_eq!(h.ping_log.batches(), 3);
    assert_eq!(h.health.report().errors.log_records_dropped, 0);
    assert!(h.supervisor.buffer().is_empty());
}

#[tokio::test]
async fn snmp_changes_are_logged_within_tolerance_rules() {
    let sample = |signal: i32, ccq: u32| SnmpMetrics {
        signal_dbm: Some(signal),
        ccq: Some(ccq),
        traffic_in: Some(1_000 + ccq as u64),
        ..Default::default()
    };
    let prober = ScriptedProber::new();
    prober.script(
        "1",
        [
            Step::UpWith(8, sample(-60, 90)),
            Step::UpWith(8, sample(-61, 91)),
            Step::UpWith(8, sample(-64, 91)),
            Step::UpWith(8, sample(-64, 80)),
        ],
    );
    let mut h = TestHarness::builder().devices(vec![snmp_device("1")]).prober(prober).build().await.unwrap();

    h.cycles(4, Duration::from_secs(30)).await.unwrap();

    let signals: Vec<Option<i32>> = h
        .ping_log
        .for_device("1")
        .iter()
        .map(|r| r.metrics.as_ref().and_then(|m| m.signal_dbm))
        .collect();
    assert_eq!(signals, vec![Some(-60), Some(-64), Some(-64)]);
    assert_eq!(h.metrics.records().len(), 3);
}

#[tokio::test]
async fn snmp_failure_keeps_device_up() {
    let prober = ScriptedProber::new();
    prober.script("1", [Step::Up(5), Step::Degraded(5, ProbeKind::SnmpTimeout)]);
    let mut h = TestHarness::builder().devices(vec![snmp_device("1")]).prober(prober).build().await.unwrap();

    h.cycle().await.unwrap();
    let report = h.cycle().await.unwrap();
    assert!(report.transitions.is_empty());
    assert_eq!(report.offline, 0);
    assert_eq!(h.health.report().errors.snmp_timeout, 1);
}
