//! Minimal metrics registry for the fabric.
//!
//! Labels are flattened into sorted key vectors to keep deterministic
//! ordering. Histogram buckets are fixed in microseconds to avoid floating
//! point math.

use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

type LabelKey = Vec<(String, String)>;

fn label_key(labels: &[(&str, &str)]) -> LabelKey {
    let mut key: LabelKey = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    key.sort();
    key
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn render_labels(key: &LabelKey) -> String {
    key.iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Default)]
pub struct CounterVec {
    map: DashMap<LabelKey, AtomicU64>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.add(labels, 1);
    }

    pub fn add(&self, labels: &[(&str, &str)], v: u64) {
        self.map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(v, Ordering::Relaxed);
    }

    /// Current value for one label set (0 if never touched).
    pub fn get(&self, labels: &[(&str, &str)]) -> u64 {
        self.map
            .get(&label_key(labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} counter", name);
        for r in self.map.iter() {
            let _ = writeln!(out, "{}{{{}}} {}", name, render_labels(r.key()), r.value().load(Ordering::Relaxed));
        }
    }
}

#[derive(Default)]
pub struct GaugeVec {
    map: DashMap<LabelKey, AtomicI64>,
}

impl GaugeVec {
    pub fn set(&self, labels: &[(&str, &str)], v: i64) {
        self.map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicI64::new(0))
            .store(v, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &[(&str, &str)]) -> i64 {
        self.map
            .get(&label_key(labels))
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} gauge", name);
        for r in self.map.iter() {
            let _ = writeln!(out, "{}{{{}}} {}", name, render_labels(r.key()), r.value().load(Ordering::Relaxed));
        }
    }
}

// 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s, 5s
const BUCKETS_MICROS: [u64; 8] = [1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000];

#[derive(Default)]
struct AtomicHistogram {
    count: AtomicU64,
    sum: AtomicU64,
    buckets: [AtomicU64; 8],
}

#[derive(Default)]
pub struct HistogramVec {
    map: DashMap<LabelKey, AtomicHistogram>,
}

impl HistogramVec {
    /// Observe a duration (cumulative buckets, microsecond scale).
    pub fn observe(&self, labels: &[(&str, &str)], duration: Duration) {
        let hist = self.map.entry(label_key(labels)).or_insert_with(AtomicHistogram::default);
        let micros = duration.as_micros() as u64;

        hist.count.fetch_add(1, Ordering::Relaxed);
        hist.sum.fetch_add(micros, Ordering::Relaxed);
        for (i, &b) in BUCKETS_MICROS.iter().enumerate() {
            if micros <= b {
                hist.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for r in self.map.iter() {
            let hist = r.value();
            let labels = render_labels(r.key());
            let prefix = if labels.is_empty() { String::new() } else { format!("{},", labels) };

            for (i, &le) in BUCKETS_MICROS.iter().enumerate() {
                let _ = writeln!(out, "{}_bucket{{{}le=\"{}\"}} {}", name, prefix, le, hist.buckets[i].load(Ordering::Relaxed));
            }
            let count = hist.count.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{{}le=\"+Inf\"}} {}", name, prefix, count);
            let _ = writeln!(out, "{}_sum{{{}}} {}", name, labels, hist.sum.load(Ordering::Relaxed));
            let _ = writeln!(out, "{}_count{{{}}} {}", name, labels, count);
        }
    }
}

/// Per-adapter metric set.
#[derive(Default)]
pub struct FabricMetrics {
    /// labels: route = broadcast | unicast | client | control
    pub messages_sent: CounterVec,
    /// labels: channel
    pub messages_received: CounterVec,
    /// labels: channel
    pub expired_dropped: CounterVec,
    /// Correlated replies with no waiter left. labels: channel
    pub late_replies: CounterVec,
    /// Listener queue full. labels: channel
    pub dispatch_dropped: CounterVec,
    /// labels: source = envelope | frame | inbox | control
    pub decode_errors: CounterVec,
    pub heartbeats: CounterVec,
    pub heartbeat_failures: CounterVec,
    pub evictions: CounterVec,
    /// labels: outcome = ok | timeout | cancelled | failed
    pub requests: CounterVec,
    pub pending_requests: GaugeVec,
    pub request_duration: HistogramVec, // microseconds
}

impl FabricMetrics {
    /// Render all metrics plus any extra lines provided by callers.
    pub fn render(&self, extra: &[(&str, u64)]) -> String {
        let mut out = String::new();
        self.messages_sent.render("unified_messages_sent_total", &mut out);
        self.messages_received.render("unified_messages_received_total", &mut out);
        self.expired_dropped.render("unified_expired_dropped_total", &mut out);
        self.late_replies.render("unified_late_replies_total", &mut out);
        self.dispatch_dropped.render("unified_dispatch_dropped_total", &mut out);
        self.decode_errors.render("unified_decode_errors_total", &mut out);
        self.heartbeats.render("unified_heartbeats_total", &mut out);
        self.heartbeat_failures.render("unified_heartbeat_failures_total", &mut out);
        self.evictions.render("unified_evictions_total", &mut out);
        self.requests.render("unified_requests_total", &mut out);
        self.pending_requests.render("unified_pending_requests", &mut out);
        self.request_duration.render("unified_request_duration_micros", &mut out);
        for (k, v) in extra {
            let _ = writeln!(out, "{} {}", k, v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_order_insensitive() {
        let c = CounterVec::default();
        c.inc(&[("a", "1"), ("b", "2")]);
        c.inc(&[("b", "2"), ("a", "1")]);
        assert_eq!(c.get(&[("a", "1"), ("b", "2")]), 2);
        assert_eq!(c.get(&[("a", "9")]), 0);
    }

    #[test]
    fn render_prometheus_text() {
        let m = FabricMetrics::default();
        m.messages_received.inc(&[("channel", "chat")]);
        m.evictions.add(&[], 3);
        m.pending_requests.set(&[], 2);
        m.request_duration.observe(&[("outcome", "ok")], Duration::from_millis(2));

        let text = m.render(&[("unified_members", 4)]);
        assert!(text.contains("unified_messages_received_total{channel=\"chat\"} 1"));
        assert!(text.contains("unified_evictions_total{} 3"));
        assert!(text.contains("unified_pending_requests{} 2"));
        assert!(text.contains("unified_request_duration_micros_bucket{outcome=\"ok\",le=\"1000\"} 0"));
        assert!(text.contains("unified_request_duration_micros_bucket{outcome=\"ok\",le=\"5000\"} 1"));
        assert!(text.contains("unified_request_duration_micros_count{outcome=\"ok\"} 1"));
        assert!(text.contains("unified_members 4"));
    }

    #[test]
    fn label_values_are_escaped() {
        let c = CounterVec::default();
        c.inc(&[("channel", "a\"b")]);
        let mut out = String::new();
        c.render("x", &mut out);
        assert!(out.contains("x{channel=\"a\\\"b\"} 1"));
    }
}
