//! Sampler lifecycle tests: gate, idempotence, stop synchronization, gaps

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::*;

const FAST: Duration = Duration::from_millis(2);

fn busy(power: f64) -> StubReading {
    StubReading::ok(80.0, 4 << 30, power)
}

fn fast_config() -> SamplerConfig {
    SamplerConfig::new()
        .with_interval(FAST)
        .with_idle_power_watts(41.0)
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached within 5s");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_stop_without_start_is_noop() {
    let monitor = Arc::new(StubMonitor::idle(2));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
    sampler.stop();
    sampler.stop();
    assert!(!sampler.is_running());
    assert_eq!(monitor.begin_calls(), 0);
    assert_eq!(monitor.end_calls(), 0);

    let stats = sampler.get_stats();
    assert_eq!(stats.device_count(), 2);
    assert!(!stats.any_available());
}

#[test]
fn test_start_twice_spawns_one_sampler() {
    let monitor = Arc::new(StubMonitor::constant(1, busy(200.0)));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());

    sampler.start().expect("start");
    sampler.start().expect("second start is a no-op");
    assert!(sampler.is_running());
    sampler.stop();

    assert_eq!(monitor.begin_calls(), 1, "polling mode enabled exactly once");
    assert_eq!(monitor.end_calls(), 1, "polling mode disabled exactly once");
}

#[test]
fn test_stop_waits_for_polling_teardown() {
    let monitor = Arc::new(StubMonitor::idle(1));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
    sampler.start().expect("start");
    wait_for(|| monitor.begin_calls() == 1);
    sampler.stop();
    assert!(!sampler.is_running());
    assert_eq!(monitor.end_calls(), 1);
}

#[test]
fn test_gate_never_opens_reports_unavailable() {
    // 40 W idle is below the 41 W threshold
    let monitor = Arc::new(StubMonitor::constant(2, busy(40.0)));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
    sampler.start().expect("start");
    wait_for(|| monitor.reads() >= 20);
    let stats = sampler.get_stats();

    assert_eq!(stats.device_count(), 2);
    assert!(stats.slot(0).is_none());
    assert!(stats.slot(1).is_none());
}

#[test]
fn test_pre_gate_readings_are_discarded() {
    // Warm-up readings carry a huge VRAM value that must not leak into the stats
    let warmup = StubReading::ok(100.0, u64::MAX / 2, 10.0);
    let monitor = Arc::new(StubMonitor::scripted(vec![vec![
        warmup,
        warmup,
        warmup,
        busy(150.0),
    ]]));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
    sampler.start().expect("start");
    wait_for(|| monitor.reads() >= 10);
    let stats = sampler.get_stats();

    let summary = stats.slot(0).expect("gate opened");
    assert!((summary.power_watts.max - 150.0).abs() < f64::EPSILON);
    assert!((summary.power_watts.avg - 150.0).abs() < f64::EPSILON);
    assert_eq!(summary.vram_bytes.max, (4u64 << 30) as f64);
}

#[test]
fn test_gate_opened_by_any_device() {
    // Device 0 idles, device 1 crosses the threshold; both record after the gate opens
    let monitor = Arc::new(StubMonitor::scripted(vec![
        vec![StubReading::ok(0.0, 1024, 30.0)],
        vec![busy(120.0)],
    ]));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
    sampler.start().expect("start");
    wait_for(|| monitor.reads() >= 12);
    let stats = sampler.get_stats();

    let idle_device = stats.slot(0).expect("recorded after gate");
    assert!((idle_device.power_watts.max - 30.0).abs() < f64::EPSILON);
    assert!(stats.slot(1).is_some());
}

#[test]
fn test_stats_stable_after_stop() {
    let monitor = Arc::new(StubMonitor::constant(1, busy(100.0)));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
    sampler.start().expect("start");
    wait_for(|| monitor.reads() >= 8);
    sampler.stop();

    let reads_at_stop = monitor.reads();
    let first = sampler.get_stats();
    thread::sleep(Duration::from_millis(20));
    sampler.stop();
    let second = sampler.get_stats();

    assert_eq!(first, second);
    assert_eq!(monitor.reads(), reads_at_stop, "no reads after stop returned");
}

#[test]
fn test_start_after_finish_does_not_restart() {
    let monitor = Arc::new(StubMonitor::constant(1, busy(100.0)));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
    sampler.start().expect("start");
    sampler.stop();
    let before = sampler.get_stats();

    sampler.start().expect("no-op");
    assert!(!sampler.is_running());
    assert_eq!(monitor.begin_calls(), 1);
    assert_eq!(sampler.get_stats(), before);
}

#[test]
fn test_get_stats_stops_running_sampler() {
    let monitor = Arc::new(StubMonitor::constant(1, busy(100.0)));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
    sampler.start().expect("start");
    wait_for(|| monitor.reads() >= 5);

    let stats = sampler.get_stats();
    assert!(!sampler.is_running());
    assert_eq!(monitor.end_calls(), 1);
    assert!(stats.slot(0).is_some());
}

#[test]
fn test_read_failures_are_gaps_not_fatal() {
    let monitor = Arc::new(StubMonitor::scripted(vec![vec![
        busy(100.0),
        busy(100.0),
        StubReading::Fail,
        StubReading::Fail,
        busy(300.0),
    ]]));
    let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
    sampler.start().expect("start");
    wait_for(|| monitor.reads() >= 10);
    let stats = sampler.get_stats();

    let summary = stats.slot(0).expect("sampling survived the failures");
    assert!((summary.power_watts.max - 300.0).abs() < f64::EPSILON);
    // Gate tick consumed the first reading, failures contributed nothing
    assert!(summary.samples + 3 <= monitor.reads());
}

#[test]
fn test_deadline_ends_sampling() {
    let monitor = Arc::new(StubMonitor::constant(1, busy(100.0)));
    let config = fast_config().with_max_duration(Duration::from_millis(30));
    let mut sampler = TelemetrySampler::new(monitor.clone(), config);
    sampler.start().expect("start");
    wait_for(|| monitor.end_calls() == 1);

    let reads = monitor.reads();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(monitor.reads(), reads, "thread exited at its deadline");
    sampler.stop();
    assert!(sampler.get_stats().slot(0).is_some());
}

#[test]
fn test_stop_interrupts_long_interval() {
    let monitor = Arc::new(StubMonitor::idle(1));
    let config = fast_config().with_interval(Duration::from_secs(30));
    let mut sampler = TelemetrySampler::new(monitor.clone(), config);
    sampler.start().expect("start");
    wait_for(|| monitor.reads() >= 1);

    let begin = Instant::now();
    sampler.stop();
    assert!(begin.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_drop_stops_thread() {
    let monitor = Arc::new(StubMonitor::idle(1));
    {
        let mut sampler = TelemetrySampler::new(monitor.clone(), fast_config());
        sampler.start().expect("start");
    }
    assert_eq!(monitor.end_calls(), 1);
}

#[test]
fn test_sampler_config_from_bench_config() {
    let bench = BenchConfig::new()
        .with_idle_power_watts(55.0)
        .with_sample_interval(Duration::from_millis(250))
        .with_max_sampling(Duration::from_secs(60));
    let config = SamplerConfig::from(&bench);
    assert_eq!(config.interval, Duration::from_millis(250));
    assert!((config.idle_power_watts - 55.0).abs() < f64::EPSILON);
    assert_eq!(config.max_duration, Duration::from_secs(60));
}
