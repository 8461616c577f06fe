//! Metric emission helpers and the external process-metrics collector.
//!
//! Emissions go through a pluggable sink that defaults to structured
//! tracing events. Tests install their own sink to capture emissions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::pool::process::ProcessMetrics;

#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        let value = match event.value {
            MetricValue::Counter(v) | MetricValue::Gauge(v) | MetricValue::Histogram(v) => v,
        };
        tracing::info!(target: "metrics", metric = event.name, value);
    }
}

static METRIC_SINK: std::sync::OnceLock<RwLock<Arc<dyn MetricSink>>> = std::sync::OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

fn emit(name: &'static str, value: MetricValue) {
    sink().record(MetricEvent { name, value });
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn spawn_ok(duration: Duration) {
    emit("spawn_ok", MetricValue::Counter(1));
    emit("spawn_duration", MetricValue::Histogram(duration_ms(duration)));
}

pub fn spawn_err(duration: Duration) {
    emit("spawn_err", MetricValue::Counter(1));
    emit("spawn_duration", MetricValue::Histogram(duration_ms(duration)));
}

pub fn gc_detached(count: usize) {
    emit("gc_detached", MetricValue::Counter(count as u64));
}

pub fn set_pool_utilization(value: usize) {
    emit("pool_utilization", MetricValue::Gauge(value as u64));
}

pub fn set_pool_process_count(value: usize) {
    emit("pool_process_count", MetricValue::Gauge(value as u64));
}

pub fn set_pool_wait_list_size(value: usize) {
    emit("pool_wait_list_size", MetricValue::Gauge(value as u64));
}

/// Collects per-process resource usage for the analytics pass. Runs
/// outside the pool lock and may block.
pub trait ProcessMetricsCollector: Send + Sync {
    fn collect(&self, pids: &[i32]) -> std::io::Result<HashMap<i32, ProcessMetrics>>;
}

/// Default collector shelling out to `ps`.
pub struct PsProcessMetricsCollector;

impl ProcessMetricsCollector for PsProcessMetricsCollector {
    fn collect(&self, pids: &[i32]) -> std::io::Result<HashMap<i32, ProcessMetrics>> {
        if pids.is_empty() {
            return Ok(HashMap::new());
        }
        let pid_list = pids
            .iter()
            .map(|pid| pid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let output = std::process::Command::new("ps")
            .args(["-o", "pid=,rss=,%cpu=", "-p", &pid_list])
            .output()?;
        // `ps` exits nonzero when some pids are gone; its output is still
        // usable for the ones that remain.
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ps_output(&stdout)
            .ok_or_else(|| std::io::Error::other("cannot parse ps output"))
    }
}

fn parse_ps_output(stdout: &str) -> Option<HashMap<i32, ProcessMetrics>> {
    let mut metrics = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let pid: i32 = fields.next()?.parse().ok()?;
        let rss_kb: u64 = fields.next()?.parse().ok()?;
        let cpu_percent: f32 = fields.next()?.parse().ok()?;
        metrics.insert(
            pid,
            ProcessMetrics {
                cpu_percent,
                rss_bytes: rss_kb * 1024,
            },
        );
    }
    Some(metrics)
}

/// Collector used in tests: reports a fixed set of pids as alive.
pub struct StaticProcessMetricsCollector {
    pub alive: Vec<i32>,
}

impl ProcessMetricsCollector for StaticProcessMetricsCollector {
    fn collect(&self, pids: &[i32]) -> std::io::Result<HashMap<i32, ProcessMetrics>> {
        Ok(pids
            .iter()
            .filter(|pid| self.alive.contains(pid))
            .map(|&pid| (pid, ProcessMetrics::default()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestSink {
        events: Mutex<Vec<MetricEvent>>,
    }

    impl MetricSink for TestSink {
        fn record(&self, event: MetricEvent) {
            self.events.lock().expect("metrics lock").push(event);
        }
    }

    #[test]
    fn emits_counters_and_histograms() {
        let sink = Arc::new(TestSink::default());
        set_sink(sink.clone());

        spawn_ok(Duration::from_millis(12));
        spawn_err(Duration::from_millis(7));
        gc_detached(2);
        set_pool_utilization(3);

        let events = sink.events.lock().expect("metrics lock");
        assert!(events.iter().any(|e| e.name == "spawn_ok"));
        assert!(events.iter().any(|e| e.name == "spawn_err"));
        assert!(events.iter().any(|e| e.name == "spawn_duration"));
        assert!(events
            .iter()
            .any(|e| e.name == "gc_detached" && e.value == MetricValue::Counter(2)));
        assert!(events
            .iter()
            .any(|e| e.name == "pool_utilization" && e.value == MetricValue::Gauge(3)));
    }

    #[test]
    fn ps_output_parses() {
        let parsed = parse_ps_output("  123 4096 1.5\n  456 1024 0.0\n").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[&123].rss_bytes, 4096 * 1024);
        assert!((parsed[&123].cpu_percent - 1.5).abs() < f32::EPSILON);
    }

    #[test]
    fn ps_collector_sees_our_own_process() {
        let collector = PsProcessMetricsCollector;
        let pid = std::process::id() as i32;
        let metrics = collector.collect(&[pid]).expect("ps runs");
        assert!(metrics.contains_key(&pid));
        assert!(metrics[&pid].rss_bytes > 0);
    }

    #[test]
    fn static_collector_filters() {
        let collector = StaticProcessMetricsCollector { alive: vec![1, 2] };
        let metrics = collector.collect(&[1, 3]).unwrap();
        assert!(metrics.contains_key(&1));
        assert!(!metrics.contains_key(&3));
    }
}
