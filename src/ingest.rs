//! Populates a matrix from transport records.

use crate::matrix::{Matrix, MatrixError};
use crate::record::{Record, RecordValue};
use crate::template::{Counter, CounterKind};
use serde_json::Value;
use tracing::{debug, trace};

/// Whether unknown instance keys create new instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Main query: every record becomes (or updates) an instance.
    Create,
    /// Endpoint query: records only enrich instances that already exist.
    UpdateOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub records: usize,
    pub new_instances: usize,
    pub values: usize,
    pub errors: usize,
}

/// Instance key of a record: the `^^` counter values joined with `.`.
pub fn instance_key(counters: &[Counter], record: &Record) -> Option<String> {
    let parts: Vec<String> = counters
        .iter()
        .filter(|c| c.kind == CounterKind::KeyLabel)
        .map(|c| label_text(&record.get(&c.name)))
        .collect();
    if parts.is_empty() || parts.iter().all(String::is_empty) {
        return None;
    }
    Some(parts.join("."))
}

fn label_text(value: &RecordValue) -> String {
    match value.raw() {
        Some(Value::Array(_)) => value
            .array()
            .iter()
            .map(RecordValue::string)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(","),
        _ => value.string(),
    }
}

fn set_metric(mat: &mut Matrix, key: &str, idx: usize, value: &RecordValue) -> Result<bool, MatrixError> {
    let Some(metric) = mat.metric_mut(key) else {
        return Err(MatrixError::InvalidMetricKey(key.to_string()));
    };
    match value.raw() {
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                metric.set_u64(idx, u)?;
            } else if let Some(i) = n.as_i64() {
                metric.set_i64(idx, i)?;
            } else {
                metric.set_f64(idx, n.as_f64().unwrap_or(f64::NAN))?;
            }
            Ok(true)
        }
        Some(Value::String(s)) if !s.is_empty() => {
            metric.set_str(idx, s)?;
            Ok(true)
        }
        Some(Value::Bool(b)) => {
            metric.set_u8(idx, u8::from(*b))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Reads `records` into `mat` using `counters`. Metric counters must already
/// exist in the matrix.
pub fn ingest(mat: &mut Matrix, counters: &[Counter], records: &[Record], mode: IngestMode) -> IngestSummary {
    let mut summary = IngestSummary::default();

    for record in records {
        summary.records += 1;
        let Some(key) = instance_key(counters, record) else {
            debug!(object = mat.object(), "record without instance key, skipped");
            continue;
        };

        if mat.instance(&key).is_none() {
            if mode == IngestMode::UpdateOnly {
                trace!(object = mat.object(), instance = %key, "endpoint record for unknown instance");
                continue;
            }
            if let Err(e) = mat.new_instance(&key) {
                debug!(error = %e, "failed to create instance");
                summary.errors += 1;
                continue;
            }
            summary.new_instances += 1;
        }
        let Some(idx) = mat.instance(&key).map(|i| i.index()) else {
            continue;
        };

        for counter in counters {
            let value = record.get(&counter.name);
            if !value.exists() {
                continue;
            }
            match counter.kind {
                CounterKind::Label | CounterKind::KeyLabel => {
                    let text = label_text(&value);
                    if let Some(inst) = mat.instance_mut(&key) {
                        inst.set_label(counter.display.clone(), text);
                    }
                }
                CounterKind::Metric(_) => match set_metric(mat, &counter.display, idx, &value) {
                    Ok(true) => summary.values += 1,
                    Ok(false) => {}
                    Err(e) => {
                        debug!(
                            object = mat.object(),
                            instance = %key,
                            counter = %counter.name,
                            error = %e,
                            "failed to set counter"
                        );
                        summary.errors += 1;
                    }
                },
            }
        }
    }
    summary
}

/// True when the cluster could not aggregate the record from every node.
fn is_partial_aggregation(record: &Record) -> bool {
    record.get("_aggregation").string() == "partial_aggregation"
        || (record.get("aggregation.complete").exists() && !record.get("aggregation.complete").bool())
}

/// Flags instances whose record reports an incomplete aggregation.
///
/// When `allow` is set such instances are kept as complete and exportable;
/// otherwise they are partial and hidden, so next poll's deltas skip them.
/// Returns the number of instances marked partial.
pub fn apply_partial_aggregation(mat: &mut Matrix, counters: &[Counter], records: &[Record], allow: bool) -> usize {
    let mut partials = 0;
    for record in records {
        let Some(key) = instance_key(counters, record) else {
            continue;
        };
        let Some(inst) = mat.instance_mut(&key) else {
            continue;
        };
        if is_partial_aggregation(record) && !allow {
            inst.set_partial(true);
            inst.set_exportable(false);
            partials += 1;
        } else {
            inst.set_partial(false);
            inst.set_exportable(true);
        }
    }
    if partials > 0 {
        debug!(object = mat.object(), partials, "partial aggregation");
    }
    partials
}
