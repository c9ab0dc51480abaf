use super::*;

struct FixedProbe {
    load: f64,
    free: u64,
}

impl MetricsProbe for FixedProbe {
    fn read(&mut self) -> (f64, u64) {
        (self.load, self.free)
    }
}

fn sample(time: i64) -> Sample {
    Sample {
        time,
        cpu_load: 0.5,
        free_memory_bytes: 1024,
    }
}

// ============================================================================
// Window maintenance
// ============================================================================

#[test]
fn record_prunes_relative_to_new_sample() {
    let sampler = Sampler::with_window(Duration::from_secs(5), 60);
    sampler.record(sample(1000));
    sampler.record(sample(1030));
    sampler.record(sample(1059));
    assert_eq!(sampler.len(), 3);

    // 1061 - 60 = 1001, so the first sample falls out
    sampler.record(sample(1061));
    let times: Vec<i64> = sampler.get_at(1061, 3600).iter().map(|s| s.time).collect();
    assert_eq!(times, vec![1030, 1059, 1061]);
}

#[test]
fn sample_exactly_at_window_edge_is_kept() {
    let sampler = Sampler::with_window(Duration::from_secs(5), 60);
    sampler.record(sample(1000));
    sampler.record(sample(1060));
    assert_eq!(sampler.len(), 2);
}

#[test]
fn get_filters_by_requested_time() {
    let sampler = Sampler::with_window(Duration::from_secs(5), 3600);
    for t in [100, 200, 300, 400] {
        sampler.record(sample(t));
    }

    let recent = sampler.get_at(400, 150);
    assert_eq!(recent.iter().map(|s| s.time).collect::<Vec<_>>(), vec![300, 400]);
    assert!(recent.iter().all(|s| s.time >= 400 - 150));

    assert_eq!(sampler.get_at(400, 3600).len(), 4);
    assert!(sampler.get_at(10_000, 10).is_empty());
}

#[test]
fn sample_serializes_camel_case() {
    let value = serde_json::to_value(sample(42)).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"time": 42, "cpuLoad": 0.5, "freeMemoryBytes": 1024})
    );
}

// ============================================================================
// Schedule
// ============================================================================

#[tokio::test(start_paused = true)]
async fn start_takes_immediate_sample_then_ticks() {
    let sampler = Arc::new(Sampler::with_window(Duration::from_secs(1), 3600));
    sampler.start_with_probe(FixedProbe {
        load: 1.25,
        free: 4096,
    });

    assert_eq!(sampler.len(), 1);
    assert!(sampler.is_running());
    let first = sampler.get(60)[0];
    assert_eq!(first.cpu_load, 1.25);
    assert_eq!(first.free_memory_bytes, 4096);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(sampler.len() >= 3, "expected ticks, got {}", sampler.len());

    sampler.stop();
    let stopped_at = sampler.len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sampler.len(), stopped_at);
    assert!(!sampler.is_running());
}

#[tokio::test(start_paused = true)]
async fn configured_interval_keeps_subsecond_precision() {
    let config = SamplerConfig {
        interval: Duration::from_millis(1500),
        window: Duration::from_secs(3600),
    };
    let sampler = Arc::new(Sampler::new(&config));
    sampler.start_with_probe(FixedProbe { load: 0.0, free: 1 });
    assert_eq!(sampler.len(), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(sampler.len(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sampler.len(), 2);
    sampler.stop();
}

#[tokio::test(start_paused = true)]
async fn start_twice_does_not_double_schedule() {
    let sampler = Arc::new(Sampler::with_window(Duration::from_secs(1), 3600));
    sampler.start_with_probe(FixedProbe { load: 0.0, free: 1 });
    sampler.start_with_probe(FixedProbe { load: 0.0, free: 1 });
    assert_eq!(sampler.len(), 1);
    sampler.stop();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let sampler = Arc::new(Sampler::with_window(Duration::from_secs(1), 60));
    sampler.stop();
    sampler.start_with_probe(FixedProbe { load: 0.0, free: 1 });
    sampler.stop();
    sampler.stop();
    assert!(!sampler.is_running());
}
