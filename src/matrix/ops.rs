//! Cross-poll arithmetic on matrix metrics.
//!
//! Every operator works in place on the current matrix and returns the number
//! of instance slots it newly marked skipped. Operators never abort half way
//! through a metric; a bad slot is skipped and the loop moves on.

use super::{Matrix, MatrixError, Metric, Values};
use tracing::trace;

/// Metrics with this suffix are never zeroed by the latency threshold.
const OPTIMAL_POINT_LATENCY: &str = "optimal_point_latency";

enum DeltaOutcome {
    Done,
    Negative,
}

fn delta_slot(cur: &mut Metric, idx: usize, prev: &Metric, pidx: usize) -> DeltaOutcome {
    let exact = match (&mut cur.values, &prev.values) {
        (Values::Uint64(c), Values::Uint64(p)) => Some(c[idx].checked_sub(p[pidx]).map(|d| c[idx] = d)),
        (Values::Uint8(c), Values::Uint8(p)) => Some(c[idx].checked_sub(p[pidx]).map(|d| c[idx] = d)),
        (Values::Int64(c), Values::Int64(p)) => Some(
            c[idx]
                .checked_sub(p[pidx])
                .filter(|d| *d >= 0)
                .map(|d| c[idx] = d),
        ),
        _ => None,
    };
    if let Some(done) = exact {
        return match done {
            Some(()) => DeltaOutcome::Done,
            None => DeltaOutcome::Negative,
        };
    }

    let (c, _) = cur.get_f64(idx);
    let (p, _) = prev.get_f64(pidx);
    let d = c - p;
    if d < 0.0 || cur.set_f64(idx, d).is_err() {
        return DeltaOutcome::Negative;
    }
    DeltaOutcome::Done
}

impl Matrix {
    /// `M[key] <- M[key] - prev[key]` per instance.
    ///
    /// An instance is skipped when it is missing from `prev`, when either side
    /// is partial or not valid, when exactly one of the two raw values is zero,
    /// or when the result is negative.
    pub fn delta(&mut self, key: &str, prev: &Matrix) -> Result<usize, MatrixError> {
        let prev_metric = prev.metric(key);
        let slots: Vec<(String, usize, bool)> = self
            .instances
            .iter()
            .map(|(k, i)| (k.clone(), i.index(), i.is_partial()))
            .collect();
        let metric = self
            .metrics
            .get_mut(key)
            .ok_or_else(|| MatrixError::InvalidMetricKey(key.to_string()))?;

        let mut skips = 0;
        for (inst_key, idx, cur_partial) in slots {
            if !metric.is_present(idx) {
                continue;
            }
            let (cur_raw, cur_ok) = metric.get_f64(idx);
            let prev_slot = prev
                .instance(&inst_key)
                .map(|p| (p.index(), p.is_partial()));

            let (pidx, prev_partial) = match (prev_slot, prev_metric) {
                (Some(slot), Some(_)) => slot,
                _ => {
                    trace!(metric = key, instance = %inst_key, "no previous value, skip delta");
                    metric.set_skipped(idx);
                    skips += 1;
                    continue;
                }
            };
            let Some(prev_metric) = prev_metric else {
                continue;
            };
            let (prev_raw, prev_ok) = prev_metric.get_f64(pidx);

            if cur_partial || prev_partial || !cur_ok || !prev_ok {
                trace!(metric = key, instance = %inst_key, "partial or invalid input, skip delta");
                metric.set_skipped(idx);
                skips += 1;
                continue;
            }

            // ONTAP occasionally reports a spurious zero on one side
            let spurious_zero = (cur_raw == 0.0 || prev_raw == 0.0) && cur_raw != prev_raw;

            match delta_slot(metric, idx, prev_metric, pidx) {
                DeltaOutcome::Done if !spurious_zero => {}
                _ => {
                    trace!(
                        metric = key,
                        instance = %inst_key,
                        cur = cur_raw,
                        prev = prev_raw,
                        "negative or spurious delta, skip"
                    );
                    metric.set_skipped(idx);
                    skips += 1;
                }
            }
        }
        Ok(skips)
    }

    /// `M[num] <- M[num] / M[den]` per instance. A zero denominator gives a
    /// valid zero.
    pub fn divide(&mut self, num: &str, den: &str) -> Result<usize, MatrixError> {
        let den_metric = self
            .metrics
            .get(den)
            .cloned()
            .ok_or_else(|| MatrixError::InvalidMetricKey(den.to_string()))?;
        let metric = self
            .metrics
            .get_mut(num)
            .ok_or_else(|| MatrixError::InvalidMetricKey(num.to_string()))?;

        let mut skips = 0;
        for idx in 0..metric.len() {
            let (n, n_ok) = metric.get_f64(idx);
            if !n_ok {
                continue;
            }
            let (d, d_ok) = den_metric.get_f64(idx);
            if !d_ok {
                metric.set_skipped(idx);
                skips += 1;
                continue;
            }
            if d == 0.0 {
                metric.set_f64(idx, 0.0)?;
                continue;
            }
            if n < 0.0 || d < 0.0 {
                metric.set_skipped(idx);
                skips += 1;
                continue;
            }
            if metric.set_f64(idx, n / d).is_err() {
                skips += 1;
            }
        }
        Ok(skips)
    }

    /// Like [`Matrix::divide`], but a denominator below the minimum base zeroes
    /// the numerator instead of dividing.
    ///
    /// The minimum base is `threshold` scaled by the elapsed time between
    /// `prev` and `cached` (read from `ts_key`) when that is available for the
    /// instance, otherwise `threshold` itself.
    pub fn divide_with_threshold(
        &mut self,
        num: &str,
        den: &str,
        threshold: u32,
        cached: Option<&Matrix>,
        prev: Option<&Matrix>,
        ts_key: &str,
    ) -> Result<usize, MatrixError> {
        let den_metric = self
            .metrics
            .get(den)
            .cloned()
            .ok_or_else(|| MatrixError::InvalidMetricKey(den.to_string()))?;
        let slots: Vec<(String, usize)> = self
            .instances
            .iter()
            .map(|(k, i)| (k.clone(), i.index()))
            .collect();
        let metric = self
            .metrics
            .get_mut(num)
            .ok_or_else(|| MatrixError::InvalidMetricKey(num.to_string()))?;
        let ignore_threshold = num.ends_with(OPTIMAL_POINT_LATENCY);

        let mut skips = 0;
        for (inst_key, idx) in slots {
            let (n, n_ok) = metric.get_f64(idx);
            if !n_ok {
                continue;
            }
            let (d, d_ok) = den_metric.get_f64(idx);
            if !d_ok {
                metric.set_skipped(idx);
                skips += 1;
                continue;
            }
            if n < 0.0 || d < 0.0 {
                metric.set_skipped(idx);
                skips += 1;
                continue;
            }

            let elapsed = match (cached, prev) {
                (Some(c), Some(p)) => {
                    let (c_ts, c_ok) = c.get_value(ts_key, &inst_key);
                    let (p_ts, p_ok) = p.get_value(ts_key, &inst_key);
                    if c_ok && p_ok && c_ts > p_ts {
                        c_ts - p_ts
                    } else {
                        1.0
                    }
                }
                _ => 1.0,
            };
            let minimum_base = f64::from(threshold) * elapsed;

            let v = if d == 0.0 || (!ignore_threshold && d < minimum_base) {
                0.0
            } else {
                n / d
            };
            if metric.set_f64(idx, v).is_err() {
                skips += 1;
            }
        }
        Ok(skips)
    }

    /// `M[key] <- M[key] * s` per instance. Slots that are already invalid are
    /// left alone; negative inputs and overflowed products count as skips.
    pub fn multiply_by_scalar(&mut self, key: &str, s: f64) -> Result<usize, MatrixError> {
        let metric = self
            .metrics
            .get_mut(key)
            .ok_or_else(|| MatrixError::InvalidMetricKey(key.to_string()))?;
        let mut skips = 0;
        for idx in 0..metric.len() {
            let (v, ok) = metric.get_f64(idx);
            if !ok {
                continue;
            }
            if v < 0.0 {
                metric.set_skipped(idx);
                skips += 1;
                continue;
            }
            if metric.set_f64(idx, v * s).is_err() {
                skips += 1;
            }
        }
        Ok(skips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{MetricType, ValueState};

    fn matrix_with(key: &str, metric_type: MetricType, values: &[(&str, f64)]) -> Matrix {
        let mut m = Matrix::new("ZapiPerf", "volume", "volume");
        m.new_metric(key, metric_type).unwrap();
        for (inst, v) in values {
            m.new_instance(inst).unwrap();
            m.set_value(key, inst, *v).unwrap();
        }
        m
    }

    #[test]
    fn test_delta_spurious_zero_is_skipped() {
        let prev = matrix_with("total_ops", MetricType::Float64, &[("a", 10.0)]);
        let mut cur = matrix_with("total_ops", MetricType::Float64, &[("a", 0.0)]);
        let skips = cur.delta("total_ops", &prev).unwrap();
        assert_eq!(skips, 1);
        assert!(cur.value_state("total_ops", "a").unwrap().is_skipped());
    }

    #[test]
    fn test_delta_both_zero_is_valid() {
        let prev = matrix_with("total_ops", MetricType::Float64, &[("a", 0.0)]);
        let mut cur = matrix_with("total_ops", MetricType::Float64, &[("a", 0.0)]);
        assert_eq!(cur.delta("total_ops", &prev).unwrap(), 0);
        assert_eq!(cur.get_value("total_ops", "a"), (0.0, true));
    }

    #[test]
    fn test_delta_uint64_is_exact() {
        let big = 18_000_000_000_000_000_000_u64;
        let mut prev = matrix_with("bytes", MetricType::Uint64, &[]);
        prev.new_instance("a").unwrap();
        prev.set_value_u64("bytes", "a", big).unwrap();
        let mut cur = prev.clone();
        cur.set_value_u64("bytes", "a", big + 3).unwrap();
        assert_eq!(cur.delta("bytes", &prev).unwrap(), 0);
        let idx = cur.instance("a").unwrap().index();
        assert_eq!(
            cur.metric("bytes").unwrap().format_value(idx).as_deref(),
            Some("3")
        );
    }

    #[test]
    fn test_delta_negative_uint64_is_skipped() {
        let prev = matrix_with("bytes", MetricType::Uint64, &[("a", 10.0)]);
        let mut cur = matrix_with("bytes", MetricType::Uint64, &[("a", 4.0)]);
        assert_eq!(cur.delta("bytes", &prev).unwrap(), 1);
        assert!(cur.value_state("bytes", "a").unwrap().is_skipped());
    }

    #[test]
    fn test_divide_zero_denominator_is_valid_zero() {
        let mut m = matrix_with("read_latency", MetricType::Float64, &[("a", 50.0)]);
        m.new_metric("read_ops", MetricType::Float64).unwrap();
        m.set_value("read_ops", "a", 0.0).unwrap();
        assert_eq!(m.divide("read_latency", "read_ops").unwrap(), 0);
        assert_eq!(m.get_value("read_latency", "a"), (0.0, true));
    }

    #[test]
    fn test_divide_negative_is_skipped() {
        let mut m = matrix_with("x", MetricType::Float64, &[("a", -5.0), ("b", 8.0)]);
        m.new_metric("y", MetricType::Float64).unwrap();
        m.set_value("y", "a", 2.0).unwrap();
        m.set_value("y", "b", 2.0).unwrap();
        assert_eq!(m.divide("x", "y").unwrap(), 1);
        assert!(m.value_state("x", "a").unwrap().is_skipped());
        assert_eq!(m.get_value("x", "b"), (4.0, true));
    }

    #[test]
    fn test_divide_with_threshold() {
        let mut m = matrix_with(
            "read_latency",
            MetricType::Float64,
            &[("low", 100.0), ("high", 100.0)],
        );
        m.new_metric("read_ops", MetricType::Float64).unwrap();
        m.set_value("read_ops", "low", 5.0).unwrap();
        m.set_value("read_ops", "high", 50.0).unwrap();
        let skips = m
            .divide_with_threshold("read_latency", "read_ops", 10, None, None, "timestamp")
            .unwrap();
        assert_eq!(skips, 0);
        assert_eq!(m.get_value("read_latency", "low"), (0.0, true));
        assert_eq!(m.get_value("read_latency", "high"), (2.0, true));
    }

    #[test]
    fn test_divide_with_threshold_scales_by_elapsed_time() {
        let prev = matrix_with("timestamp", MetricType::Float64, &[("a", 100.0)]);
        let cached = matrix_with("timestamp", MetricType::Float64, &[("a", 160.0)]);
        let mut m = matrix_with("avg_latency", MetricType::Float64, &[("a", 1200.0)]);
        m.new_metric("total_ops", MetricType::Float64).unwrap();
        // 300 ops over 60s is below 10 ops/s
        m.set_value("total_ops", "a", 300.0).unwrap();
        m.divide_with_threshold("avg_latency", "total_ops", 10, Some(&cached), Some(&prev), "timestamp")
            .unwrap();
        assert_eq!(m.get_value("avg_latency", "a"), (0.0, true));
    }

    #[test]
    fn test_optimal_point_latency_ignores_threshold() {
        let mut m = matrix_with("optimal_point_latency", MetricType::Float64, &[("a", 30.0)]);
        m.new_metric("optimal_point_ops", MetricType::Float64).unwrap();
        m.set_value("optimal_point_ops", "a", 3.0).unwrap();
        m.divide_with_threshold("optimal_point_latency", "optimal_point_ops", 10, None, None, "timestamp")
            .unwrap();
        assert_eq!(m.get_value("optimal_point_latency", "a"), (10.0, true));
    }

    #[test]
    fn test_multiply_by_scalar() {
        let mut m = matrix_with("busy", MetricType::Float64, &[("a", 0.25), ("b", -1.0)]);
        m.new_instance("c").unwrap();
        assert_eq!(m.multiply_by_scalar("busy", 100.0).unwrap(), 1);
        assert_eq!(m.get_value("busy", "a"), (25.0, true));
        assert!(m.value_state("busy", "b").unwrap().is_skipped());
        assert_eq!(m.value_state("busy", "c").unwrap(), ValueState::Absent);
    }

    #[test]
    fn test_multiply_by_scalar_leaves_skipped_slots_uncounted() {
        let mut m = matrix_with("busy", MetricType::Float64, &[("a", 0.5), ("b", 0.1)]);
        m.metric_mut("busy").unwrap().set_skipped(1);
        assert_eq!(m.multiply_by_scalar("busy", 100.0).unwrap(), 0);
        assert_eq!(m.get_value("busy", "a"), (50.0, true));
        assert!(m.value_state("busy", "b").unwrap().is_skipped());

        let mut m = matrix_with("pct", MetricType::Uint8, &[("a", 3.0)]);
        assert_eq!(m.multiply_by_scalar("pct", 100.0).unwrap(), 1);
        assert!(m.value_state("pct", "a").unwrap().is_skipped());
    }
}
