//! Collector health metrics.
//!
//! Every poll's [`Metadata`] is recorded here: skip counts, instance and
//! metric counts, partial polls and calculation time, per object. The
//! series are kept in a Prometheus registry and encoded in text format next
//! to the poll output.

use crate::pipeline::Metadata;
use ahash::AHashMap as HashMap;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::fmt::Write as FmtWrite;

/// Running statistics for a single metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl RunningStat {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
            self.last = value;
            self.sum = value;
            self.count = 1;
            return;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / (self.count as f64)
        }
    }

    /// `(last, avg, max, min, count)`
    pub fn snapshot(&self) -> (f64, f64, f64, f64, u64) {
        (self.last, self.avg(), self.max, self.min, self.count)
    }
}

pub struct CollectorHealth {
    registry: Registry,
    skips: IntCounterVec,
    partial: IntCounterVec,
    instances: GaugeVec,
    metrics: GaugeVec,
    calc_seconds: GaugeVec,
    calc_stats: HashMap<String, RunningStat>,
}

impl CollectorHealth {
    /// Registers the health series; `poller` becomes a constant label.
    pub fn new(poller: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).const_label("poller", poller);

        let skips = IntCounterVec::new(
            opts("harvest_poll_skips_total", "Values skipped by counter arithmetic and plugins"),
            &["object"],
        )?;
        let partial = IntCounterVec::new(
            opts("harvest_poll_partial_total", "Polls whose transfer was truncated"),
            &["object"],
        )?;
        let instances = GaugeVec::new(opts("harvest_poll_instances", "Instances in the last poll"), &["object"])?;
        let metrics = GaugeVec::new(
            opts("harvest_poll_metrics", "Valid exported values in the last poll"),
            &["object"],
        )?;
        let calc_seconds = GaugeVec::new(
            opts("harvest_poll_calc_seconds", "Time spent cooking and post-processing the last poll"),
            &["object"],
        )?;

        registry.register(Box::new(skips.clone()))?;
        registry.register(Box::new(partial.clone()))?;
        registry.register(Box::new(instances.clone()))?;
        registry.register(Box::new(metrics.clone()))?;
        registry.register(Box::new(calc_seconds.clone()))?;

        Ok(Self {
            registry,
            skips,
            partial,
            instances,
            metrics,
            calc_seconds,
            calc_stats: HashMap::new(),
        })
    }

    pub fn record(&mut self, meta: &Metadata) {
        let object = meta.object.as_str();
        self.skips.with_label_values(&[object]).inc_by(meta.skips as u64);
        if meta.partial {
            self.partial.with_label_values(&[object]).inc();
        }
        self.instances.with_label_values(&[object]).set(meta.instances as f64);
        self.metrics.with_label_values(&[object]).set(meta.metrics as f64);
        let secs = meta.calc_time.as_secs_f64();
        self.calc_seconds.with_label_values(&[object]).set(secs);
        self.calc_stats.entry(meta.object.clone()).or_default().add(secs);
    }

    pub fn calc_stat(&self, object: &str) -> Option<&RunningStat> {
        self.calc_stats.get(object)
    }

    /// Text exposition of the health series followed by a commented calc-time
    /// summary per object.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "failed to encode health metrics");
        }
        let mut out = String::from_utf8_lossy(&buffer).into_owned();

        let mut objects: Vec<&String> = self.calc_stats.keys().collect();
        objects.sort();
        for object in objects {
            let (last, avg, max, min, count) = self.calc_stats[object].snapshot();
            writeln!(
                out,
                "# calc_seconds object={object} last={last:.6} avg={avg:.6} max={max:.6} min={min:.6} polls={count}"
            )
            .ok();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_running_stat() {
        let mut s = RunningStat::default();
        assert_eq!(s.avg(), 0.0);
        for v in [2.0, 4.0, 9.0] {
            s.add(v);
        }
        assert_eq!(s.snapshot(), (9.0, 5.0, 9.0, 2.0, 3));
    }

    #[test]
    fn test_record_and_encode() {
        let mut h = CollectorHealth::new("p1").unwrap();
        let meta = Metadata {
            object: "volume".into(),
            instances: 4,
            metrics: 12,
            skips: 3,
            partial: true,
            calc_time: Duration::from_millis(5),
        };
        h.record(&meta);
        h.record(&meta);
        let out = h.encode();
        assert!(out.contains("harvest_poll_skips_total{object=\"volume\",poller=\"p1\"} 6"));
        assert!(out.contains("harvest_poll_partial_total{object=\"volume\",poller=\"p1\"} 2"));
        assert!(out.contains("harvest_poll_instances{object=\"volume\",poller=\"p1\"} 4"));
        assert!(out.contains("# calc_seconds object=volume"));
        assert_eq!(h.calc_stat("volume").unwrap().snapshot().4, 2);
    }
}
