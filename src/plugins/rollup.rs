//! Folds child instances into parent instances of a second matrix.
//!
//! Plain metrics are summed. Latency metrics are averaged weighted by their
//! ops companion: the parent first accumulates `Σ latency × ops` and a hidden
//! `temp_<ops>` metric accumulates `Σ ops` over the children that reported a
//! non-zero latency; [`normalize`] then divides the two. A parent latency that
//! saw an unreadable child value, an unreadable ops value, or a partial child
//! ends up skipped, as does one whose ops sum is zero.

use crate::matrix::{Matrix, MatrixError, Metric, MetricType, Values};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use tracing::{debug, trace};

pub const OPS_KEY_PREFIX: &str = "temp_";

/// How latency metrics and their ops companions are recognised.
#[derive(Debug, Clone)]
pub enum LatencyRule {
    /// Metrics whose name ends with `_latency`; the ops key is the metric's
    /// comment.
    Suffix,
    /// Metrics whose key starts with `prefix`; the ops key is the metric key
    /// with `prefix` replaced by `op_name`.
    Prefix { prefix: String, op_name: String },
}

impl LatencyRule {
    /// The ops key of a latency metric, `None` for every other metric.
    pub fn ops_key(&self, key: &str, metric: &Metric) -> Option<String> {
        match self {
            LatencyRule::Suffix => metric.name().ends_with("_latency").then(|| metric.comment().to_string()),
            LatencyRule::Prefix { prefix, op_name } => key
                .starts_with(prefix.as_str())
                .then(|| key.replacen(prefix.as_str(), op_name, 1)),
        }
    }
}

/// Weighted roll-up of `members` (child key, parent key) from `data` into
/// `cache`. Parent instances must already exist in `cache`, and `cache` must
/// carry the metrics of `data` (a shape clone). Returns the number of parent
/// latency values left skipped.
pub fn roll_up(
    data: &Matrix,
    cache: &mut Matrix,
    members: &[(String, String)],
    rule: &LatencyRule,
) -> Result<usize, MatrixError> {
    let mut failed: HashMap<String, HashSet<String>> = HashMap::new();
    let mut latency_keys: Vec<(String, String)> = Vec::new();

    for (key, metric) in data.metrics() {
        if let Some(ops_key) = rule.ops_key(key, metric) {
            latency_keys.push((key.clone(), ops_key));
        }
    }
    // weighted sums must not truncate
    for (key, ops_key) in &latency_keys {
        if cache.metric(key).is_some_and(|m| m.metric_type() != MetricType::Float64) {
            cache.change_metric_type(key, MetricType::Float64)?;
        }
        let temp = cache.metric_or_insert(&format!("{OPS_KEY_PREFIX}{ops_key}"), MetricType::Float64);
        temp.set_exportable(false);
    }
    let ops_of: HashMap<&str, &str> = latency_keys.iter().map(|(k, o)| (k.as_str(), o.as_str())).collect();

    for (child_key, parent_key) in members {
        let Some(child) = data.instance(child_key) else {
            continue;
        };
        let Some(parent_idx) = cache.instance(parent_key).map(|i| i.index()) else {
            debug!(parent = %parent_key, "parent instance missing from cache");
            continue;
        };
        let idx = child.index();
        if child.is_partial() {
            if let Some(parent) = cache.instance_mut(parent_key) {
                parent.set_partial(true);
            }
        }

        for (mkey, metric) in data.metrics() {
            if !metric.exportable() && metric.metric_type() != MetricType::Float64 {
                continue;
            }
            let (value, ok) = metric.get_f64(idx);
            let ops_key = ops_of.get(mkey.as_str());

            let Some(ops_key) = ops_key else {
                if ok {
                    if let Some(target) = cache.metric_mut(mkey) {
                        add_into(target, parent_idx, metric, idx)?;
                    }
                }
                continue;
            };

            if !ok || child.is_partial() {
                trace!(metric = %mkey, instance = %child_key, "latency not usable");
                failed.entry(parent_key.clone()).or_default().insert(mkey.clone());
                continue;
            }
            let (ops, ops_ok) = data
                .metric(ops_key)
                .map_or((0.0, false), |m| m.get_f64(idx));
            if !ops_ok {
                trace!(metric = %mkey, ops = %ops_key, instance = %child_key, "ops not usable");
                failed.entry(parent_key.clone()).or_default().insert(mkey.clone());
                continue;
            }

            if value != 0.0 {
                if let Some(temp) = cache.metric_mut(&format!("{OPS_KEY_PREFIX}{ops_key}")) {
                    let (sum, _) = temp.get_f64(parent_idx);
                    temp.set_f64(parent_idx, sum + ops)?;
                }
            }
            if let Some(target) = cache.metric_mut(mkey) {
                let (sum, _) = target.get_f64(parent_idx);
                target.set_f64(parent_idx, sum + value * ops)?;
            }
        }
    }

    normalize(cache, &latency_keys, &failed)
}

/// Adds slot `src` of `source` to slot `dst` of `target`. Integer stores of
/// the same kind are summed exactly; a sum that overflows leaves the slot
/// skipped.
pub fn add_into(target: &mut Metric, dst: usize, source: &Metric, src: usize) -> Result<(), MatrixError> {
    let present = target.is_present(dst);
    if present && target.state(dst).is_skipped() {
        return Ok(());
    }
    let exact = match (target.values(), source.values()) {
        (Values::Uint64(t), Values::Uint64(s)) => {
            let acc = if present { t[dst] } else { 0 };
            Some(acc.checked_add(s[src]).map(Exact::Unsigned))
        }
        (Values::Int64(t), Values::Int64(s)) => {
            let acc = if present { t[dst] } else { 0 };
            Some(acc.checked_add(s[src]).map(Exact::Signed))
        }
        _ => None,
    };
    match exact {
        Some(Some(Exact::Unsigned(v))) => target.set_u64(dst, v),
        Some(Some(Exact::Signed(v))) => target.set_i64(dst, v),
        Some(None) => {
            debug!(metric = %target.name(), "roll-up sum overflows");
            target.set_skipped(dst);
            Ok(())
        }
        None => {
            let (acc, _) = target.get_f64(dst);
            let (value, _) = source.get_f64(src);
            target.set_f64(dst, acc + value)
        }
    }
}

enum Exact {
    Unsigned(u64),
    Signed(i64),
}

/// Divides accumulated weighted sums by their ops totals.
fn normalize(
    cache: &mut Matrix,
    latency_keys: &[(String, String)],
    failed: &HashMap<String, HashSet<String>>,
) -> Result<usize, MatrixError> {
    let mut skips = 0;
    let parents: Vec<(String, usize)> = cache
        .instances()
        .iter()
        .filter(|(_, i)| i.exportable())
        .map(|(k, i)| (k.clone(), i.index()))
        .collect();

    for (key, ops_key) in latency_keys {
        let totals: Vec<(f64, bool)> = {
            let temp = cache.metric(&format!("{OPS_KEY_PREFIX}{ops_key}"));
            parents
                .iter()
                .map(|(_, idx)| temp.map_or((0.0, false), |m| m.get_f64(*idx)))
                .collect()
        };
        let Some(metric) = cache.metric_mut(key) else {
            continue;
        };
        for ((parent_key, idx), (total, total_ok)) in parents.iter().zip(totals) {
            if failed.get(parent_key).is_some_and(|s| s.contains(key)) {
                metric.set_skipped(*idx);
                skips += 1;
                continue;
            }
            let (sum, ok) = metric.get_f64(*idx);
            if !ok {
                continue;
            }
            if total_ok && total != 0.0 {
                metric.set_f64(*idx, sum / total)?;
            } else {
                metric.set_f64(*idx, f64::NAN)?;
                skips += 1;
            }
        }
    }
    Ok(skips)
}
