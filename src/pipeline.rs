//! One object's poll, from records to exportable matrices.
//!
//! The pipeline owns the object's shape matrix (metrics without instances),
//! its compiled plugin chain and the raw matrix of the previous poll. Each
//! poll ingests the records into a fresh copy of the shape, cooks perf
//! counters against the previous poll, runs the plugins and hands back the
//! matrices to export.

use crate::config::Config;
use crate::ingest::{self, IngestMode};
use crate::matrix::{Matrix, MatrixError, MetricType, With};
use crate::plugins::{self, Plugin, PluginEnv};
use crate::record::{HrefBuilder, Record, Transport, TransportError};
use crate::template::{Counter, CounterKind, Property, Template};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

/// Per-instance collection time of a perf object.
pub const TIMESTAMP_KEY: &str = "timestamp";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Summary of one poll, fed into the collector health metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub object: String,
    pub instances: usize,
    /// Valid values of exportable metrics in the data matrix.
    pub metrics: usize,
    pub skips: usize,
    pub partial: bool,
    pub calc_time: Duration,
}

#[derive(Debug, Default)]
pub struct PollOutput {
    /// Data matrix first, then plugin matrices in chain order. Empty on the
    /// first poll of a perf object.
    pub matrices: Vec<Matrix>,
    pub metadata: Metadata,
}

/// A perf counter with its resolved denominator key.
#[derive(Debug, Clone)]
struct Cooked {
    key: String,
    property: Property,
    denominator: Option<String>,
}

pub struct Pipeline {
    template: Template,
    shape: Matrix,
    cooked: Vec<Cooked>,
    plugins: Vec<Box<dyn Plugin>>,
    cache: Option<Matrix>,
    latency_io_reqd: u32,
    allow_partial_aggregation: bool,
}

/// Matrix key the template's denominator name refers to.
fn resolve_denominator(counters: &[Counter], denominator: &str) -> String {
    counters
        .iter()
        .find(|c| c.name == denominator || c.display == denominator)
        .map(|c| c.display.clone())
        .unwrap_or_else(|| denominator.to_string())
}

/// Cooking order: denominators are consumed by other counters, so they come
/// after everything that divides by them.
fn cooking_order(counters: &[Counter]) -> Vec<Cooked> {
    let mut cooked: Vec<Cooked> = counters
        .iter()
        .filter(|c| matches!(c.kind, CounterKind::Metric(_)))
        .filter(|c| !matches!(c.property, Property::Raw | Property::String))
        .map(|c| Cooked {
            key: c.display.clone(),
            property: c.property,
            denominator: c.denominator.as_deref().map(|d| resolve_denominator(counters, d)),
        })
        .collect();
    let denominators: Vec<String> = cooked.iter().filter_map(|c| c.denominator.clone()).collect();
    cooked.sort_by_key(|c| denominators.contains(&c.key));
    cooked
}

fn build_shape(template: &Template, config: &Config) -> Matrix {
    let mut shape = Matrix::new(template.name.clone(), template.object.clone(), template.object.clone());
    shape.set_export_options(template.export_options.clone().unwrap_or_default());
    shape.set_global_labels(&config.global_labels());

    let all = template
        .counters
        .iter()
        .chain(template.endpoints.iter().flat_map(|e| e.counters.iter()));
    for counter in all {
        let CounterKind::Metric(declared) = counter.kind else {
            continue;
        };
        let metric_type = match counter.property {
            Property::Rate | Property::Average | Property::Percent => MetricType::Float64,
            _ => declared,
        };
        let denominator = counter
            .denominator
            .as_deref()
            .map(|d| resolve_denominator(&template.counters, d));
        let metric = shape.metric_or_insert(&counter.display, metric_type);
        if counter.property != Property::Raw {
            metric.set_property(counter.property.to_string());
        }
        if let Some(d) = denominator {
            metric.set_comment(d);
        }
    }

    if template.is_perf() {
        shape
            .metric_or_insert(TIMESTAMP_KEY, MetricType::Float64)
            .set_exportable(false);
    }
    shape
}

/// Seconds since the epoch of a record's `timestamp` field, which is either
/// numeric or an RFC 3339 string.
fn record_timestamp(record: &Record) -> Option<f64> {
    let value = record.get(TIMESTAMP_KEY);
    if !value.exists() {
        return None;
    }
    let text = value.string();
    if let Ok(v) = text.trim().parse::<f64>() {
        return Some(v);
    }
    chrono::DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|t| t.timestamp_millis() as f64 / 1000.0)
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn count_valid(mat: &Matrix) -> usize {
    mat.metrics()
        .values()
        .filter(|m| m.exportable())
        .map(|m| {
            mat.instances()
                .values()
                .filter(|i| i.exportable() && m.get_f64(i.index()).1)
                .count()
        })
        .sum()
}

impl Pipeline {
    pub fn new(template: Template, config: &Config) -> Self {
        let shape = build_shape(&template, config);
        let cooked = cooking_order(&template.counters);
        let env = PluginEnv {
            object: template.object.clone(),
        };

        let mut chain = Vec::new();
        for spec in &template.plugins {
            match plugins::build(spec, &env) {
                Ok(Some(plugin)) => chain.push(plugin),
                Ok(None) => {}
                Err(e) => warn!(plugin = %spec.name, object = %template.object, error = %e, "plugin init failed, skipped"),
            }
        }
        info!(
            object = %template.object,
            metrics = shape.metrics().len(),
            plugins = chain.len(),
            perf = template.is_perf(),
            "pipeline ready"
        );

        Self {
            template,
            shape,
            cooked,
            plugins: chain,
            cache: None,
            latency_io_reqd: config.latency_io_reqd(),
            allow_partial_aggregation: config.allow_partial_aggregation(),
        }
    }

    pub fn object(&self) -> &str {
        &self.template.object
    }

    pub fn is_perf(&self) -> bool {
        self.template.is_perf()
    }

    /// Matrix with the object's metrics and no instances.
    pub fn shape(&self) -> &Matrix {
        &self.shape
    }

    /// Raw matrix kept from the last perf poll.
    pub fn cache(&self) -> Option<&Matrix> {
        self.cache.as_ref()
    }

    fn href(&self, query: &str, counters: &[Counter]) -> String {
        HrefBuilder::new()
            .api_path(query)
            .fields(counters.iter().map(|c| c.name.clone()))
            .build()
    }

    /// Fetches the template query and runs the poll. A truncated transfer
    /// still produces a poll, marked partial.
    pub fn poll(&mut self, transport: &mut dyn Transport) -> Result<PollOutput, PipelineError> {
        let href = self.href(&self.template.query, &self.template.counters);
        let (records, partial) = match transport.fetch(&href) {
            Ok(records) => (records, false),
            Err(TransportError::Truncated { records, reason }) => {
                warn!(object = %self.template.object, received = records.len(), reason = %reason, "transfer truncated, poll is partial");
                (records, true)
            }
            Err(e) => return Err(e.into()),
        };
        self.poll_records(&records, partial, transport, None)
    }

    fn ingest_endpoints(&self, mat: &mut Matrix, transport: &mut dyn Transport) {
        for endpoint in &self.template.endpoints {
            let href = self.href(&endpoint.query, &endpoint.counters);
            let records = match transport.fetch(&href) {
                Ok(records) => records,
                Err(TransportError::Truncated { records, .. }) => records,
                Err(e) => {
                    warn!(object = %self.template.object, href = %href, error = %e, "endpoint fetch failed");
                    continue;
                }
            };
            let summary = ingest::ingest(mat, &endpoint.counters, &records, IngestMode::UpdateOnly);
            debug!(query = %endpoint.query, records = summary.records, values = summary.values, "endpoint ingested");
        }
    }

    fn set_timestamps(&self, mat: &mut Matrix, records: &[Record], poll_ts: f64) -> Result<(), MatrixError> {
        for key in mat.instance_keys() {
            mat.set_value(TIMESTAMP_KEY, &key, poll_ts)?;
        }
        for record in records {
            let (Some(key), Some(ts)) = (ingest::instance_key(&self.template.counters, record), record_timestamp(record))
            else {
                continue;
            };
            if mat.instance(&key).is_some() {
                mat.set_value(TIMESTAMP_KEY, &key, ts)?;
            }
        }
        Ok(())
    }

    /// Turns raw counters into rates, deltas, averages and percentages
    /// against `prev`. `mat` is left cooked; the returned count is the number
    /// of values skipped.
    fn cook(&self, mat: &mut Matrix, raw: &Matrix, prev: &Matrix) -> Result<usize, MatrixError> {
        let mut skips = mat.delta(TIMESTAMP_KEY, prev)?;

        for c in &self.cooked {
            if mat.metric(&c.key).is_none() {
                continue;
            }
            skips += mat.delta(&c.key, prev)?;
        }

        for c in &self.cooked {
            if !matches!(c.property, Property::Average | Property::Percent) {
                continue;
            }
            let Some(den) = c.denominator.as_deref() else {
                warn!(object = mat.object(), metric = %c.key, "no denominator, value left as delta");
                continue;
            };
            if mat.metric(den).is_none() {
                warn!(object = mat.object(), metric = %c.key, denominator = den, "denominator not collected");
                continue;
            }
            skips += if c.key.ends_with("latency") {
                mat.divide_with_threshold(&c.key, den, self.latency_io_reqd, Some(raw), Some(prev), TIMESTAMP_KEY)?
            } else {
                mat.divide(&c.key, den)?
            };
            if c.property == Property::Percent {
                skips += mat.multiply_by_scalar(&c.key, 100.0)?;
            }
        }

        for c in &self.cooked {
            if c.property == Property::Rate && mat.metric(&c.key).is_some() {
                skips += mat.divide(&c.key, TIMESTAMP_KEY)?;
            }
        }
        Ok(skips)
    }

    /// Runs one poll over already fetched records. `timestamp` overrides the
    /// wall clock for records that carry none.
    #[instrument(skip_all, fields(object = %self.template.object))]
    pub fn poll_records(
        &mut self,
        records: &[Record],
        partial: bool,
        transport: &mut dyn Transport,
        timestamp: Option<f64>,
    ) -> Result<PollOutput, PipelineError> {
        let start = Instant::now();
        let mut metadata = Metadata {
            object: self.template.object.clone(),
            partial,
            ..Metadata::default()
        };

        let mut data = self.shape.clone_with(With::default());
        let summary = ingest::ingest(&mut data, &self.template.counters, records, IngestMode::Create);
        trace!(records = summary.records, new = summary.new_instances, errors = summary.errors, "ingested");
        self.ingest_endpoints(&mut data, transport);

        if self.is_perf() {
            ingest::apply_partial_aggregation(
                &mut data,
                &self.template.counters,
                records,
                self.allow_partial_aggregation,
            );
        }
        if partial {
            data.mark_partial();
        }

        if self.is_perf() {
            self.set_timestamps(&mut data, records, timestamp.unwrap_or_else(now_seconds))?;
            let raw = data.clone_with(With::default());
            let Some(prev) = self.cache.replace(raw.clone()) else {
                debug!(instances = data.instances().len(), "first poll, cached");
                metadata.instances = data.instances().len();
                metadata.calc_time = start.elapsed();
                return Ok(PollOutput {
                    matrices: Vec::new(),
                    metadata,
                });
            };
            metadata.skips += self.cook(&mut data, &raw, &prev)?;
        }

        let mut extra = Vec::new();
        for plugin in &mut self.plugins {
            match plugin.run(&mut data, transport) {
                Ok(out) => {
                    metadata.skips += out.skips;
                    extra.extend(out.matrices);
                }
                Err(e) => error!(plugin = plugin.name(), error = %e, "plugin failed"),
            }
        }

        metadata.instances = data.instances().len();
        metadata.metrics = count_valid(&data);
        metadata.calc_time = start.elapsed();
        debug!(
            instances = metadata.instances,
            metrics = metadata.metrics,
            skips = metadata.skips,
            extra = extra.len(),
            "poll done"
        );

        let mut matrices = Vec::with_capacity(extra.len() + 1);
        matrices.push(data);
        matrices.extend(extra);
        Ok(PollOutput { matrices, metadata })
    }
}
