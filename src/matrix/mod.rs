//! The per-poll data table.
//!
//! A [`Matrix`] holds one object's counters for one poll of one cluster:
//! instances (rows, keyed by string) and typed metrics (columns, keyed by
//! string), plus global labels and export options. Instances and metrics live
//! in ordered maps so every iteration is deterministic.
//!
//! The arithmetic operators used to cook raw counters into rates, averages
//! and percentages live in [`ops`].

mod instance;
mod metric;
pub mod ops;

pub use instance::Instance;
pub use metric::{Metric, MetricType, ValueState, Values};

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised by matrix mutators and accessors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatrixError {
    #[error("metric [{0}] already exists")]
    DuplicateMetric(String),

    #[error("instance [{0}] already exists")]
    DuplicateInstance(String),

    #[error("invalid metric type [{0}]")]
    InvalidType(String),

    #[error("metric [{0}] not found")]
    InvalidMetricKey(String),

    #[error("instance [{0}] not found")]
    InvalidInstanceKey(String),

    #[error("value [{value}] overflows metric [{metric}]")]
    Overflow { metric: String, value: String },

    #[error("value [{value}] is not numeric for metric [{metric}]")]
    InvalidValue { metric: String, value: String },
}

/// Which labels flow through to exporters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    #[serde(default)]
    pub include_all_labels: bool,
    /// Labels attached to every series, empty values included.
    #[serde(default)]
    pub instance_keys: Vec<String>,
    /// Labels attached once per instance on the `<object>_labels` series,
    /// and only when non-empty.
    #[serde(default)]
    pub instance_labels: Vec<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_all_labels: true,
            instance_keys: Vec::new(),
            instance_labels: Vec::new(),
        }
    }
}

/// What to carry over when cloning a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct With {
    pub data: bool,
    pub metrics: bool,
    pub instances: bool,
    /// Exportable flag given to every cloned instance.
    pub export_instances: bool,
    /// Keep the partial flag of cloned instances.
    pub partial_instances: bool,
}

impl Default for With {
    fn default() -> Self {
        Self {
            data: true,
            metrics: true,
            instances: true,
            export_instances: true,
            partial_instances: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    uuid: String,
    object: String,
    identifier: String,
    global_labels: HashMap<String, String>,
    instances: BTreeMap<String, Instance>,
    metrics: BTreeMap<String, Metric>,
    export_options: ExportOptions,
    exportable: bool,
    slots: usize,
}

impl Matrix {
    pub fn new(uuid: impl Into<String>, object: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            object: object.into(),
            identifier: identifier.into(),
            global_labels: HashMap::new(),
            instances: BTreeMap::new(),
            metrics: BTreeMap::new(),
            export_options: ExportOptions::default(),
            exportable: true,
            slots: 0,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn set_object(&mut self, object: impl Into<String>) {
        self.object = object.into();
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn set_identifier(&mut self, identifier: impl Into<String>) {
        self.identifier = identifier.into();
    }

    pub fn exportable(&self) -> bool {
        self.exportable
    }

    /// A non-exportable matrix is only consumed by plugins.
    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    pub fn export_options(&self) -> &ExportOptions {
        &self.export_options
    }

    pub fn set_export_options(&mut self, options: ExportOptions) {
        self.export_options = options;
    }

    /// Duplicates the matrix. Metric and instance state of the clone is fully
    /// independent of the source.
    pub fn clone_with(&self, with: With) -> Matrix {
        let mut clone = Matrix {
            uuid: self.uuid.clone(),
            object: self.object.clone(),
            identifier: self.identifier.clone(),
            global_labels: self.global_labels.clone(),
            instances: BTreeMap::new(),
            metrics: BTreeMap::new(),
            export_options: self.export_options.clone(),
            exportable: self.exportable,
            slots: 0,
        };

        if with.instances {
            clone.slots = self.slots;
            for (key, instance) in &self.instances {
                let mut inst = instance.clone();
                inst.set_exportable(with.export_instances);
                if !with.partial_instances {
                    inst.set_partial(false);
                }
                clone.instances.insert(key.clone(), inst);
            }
        }

        if with.metrics {
            for (key, metric) in &self.metrics {
                let m = if with.data && with.instances {
                    metric.clone()
                } else {
                    metric.empty_like(clone.slots)
                };
                clone.metrics.insert(key.clone(), m);
            }
        }
        clone
    }

    // ---- instances -------------------------------------------------------

    pub fn new_instance(&mut self, key: &str) -> Result<&mut Instance, MatrixError> {
        if self.instances.contains_key(key) {
            return Err(MatrixError::DuplicateInstance(key.to_string()));
        }
        let index = self.slots;
        self.slots += 1;
        for metric in self.metrics.values_mut() {
            metric.resize(self.slots);
        }
        Ok(self
            .instances
            .entry(key.to_string())
            .or_insert_with(|| Instance::new(index)))
    }

    pub fn instance(&self, key: &str) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn instance_mut(&mut self, key: &str) -> Option<&mut Instance> {
        self.instances.get_mut(key)
    }

    pub fn instances(&self) -> &BTreeMap<String, Instance> {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = (&String, &mut Instance)> {
        self.instances.iter_mut()
    }

    pub fn instance_keys(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    /// Removes one instance and compacts every metric store.
    pub fn remove_instance(&mut self, key: &str) -> Option<Instance> {
        let removed = self.instances.remove(key)?;
        let idx = removed.index();
        for metric in self.metrics.values_mut() {
            metric.remove_slot(idx);
        }
        for inst in self.instances.values_mut() {
            if inst.index() > idx {
                let i = inst.index() - 1;
                inst.set_index(i);
            }
        }
        self.slots -= 1;
        Some(removed)
    }

    /// Drops every instance; metrics keep their shape with empty stores.
    pub fn purge_instances(&mut self) {
        self.instances.clear();
        self.slots = 0;
        for metric in self.metrics.values_mut() {
            metric.resize(0);
        }
    }

    /// Marks every instance partial, for a poll the transport truncated.
    pub fn mark_partial(&mut self) {
        for inst in self.instances.values_mut() {
            inst.set_partial(true);
        }
    }

    // ---- metrics ---------------------------------------------------------

    pub fn new_metric(&mut self, key: &str, metric_type: MetricType) -> Result<&mut Metric, MatrixError> {
        if self.metrics.contains_key(key) {
            return Err(MatrixError::DuplicateMetric(key.to_string()));
        }
        let slots = self.slots;
        Ok(self
            .metrics
            .entry(key.to_string())
            .or_insert_with(|| Metric::new(key, metric_type, slots)))
    }

    /// Like [`Matrix::new_metric`] but parses the type name first.
    pub fn new_metric_typed(&mut self, key: &str, type_name: &str) -> Result<&mut Metric, MatrixError> {
        let metric_type = type_name.parse::<MetricType>()?;
        self.new_metric(key, metric_type)
    }

    /// Returns the existing metric or creates it with the given type.
    pub fn metric_or_insert(&mut self, key: &str, metric_type: MetricType) -> &mut Metric {
        let slots = self.slots;
        self.metrics
            .entry(key.to_string())
            .or_insert_with(|| Metric::new(key, metric_type, slots))
    }

    pub fn metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    pub fn metric_mut(&mut self, key: &str) -> Option<&mut Metric> {
        self.metrics.get_mut(key)
    }

    pub fn metrics(&self) -> &BTreeMap<String, Metric> {
        &self.metrics
    }

    pub fn metric_keys(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }

    pub fn remove_metric(&mut self, key: &str) -> Option<Metric> {
        self.metrics.remove(key)
    }

    /// Types are immutable, so a type change drops the old store.
    pub fn change_metric_type(&mut self, key: &str, metric_type: MetricType) -> Result<&mut Metric, MatrixError> {
        let old = self
            .metrics
            .remove(key)
            .ok_or_else(|| MatrixError::InvalidMetricKey(key.to_string()))?;
        let metric = self.new_metric(key, metric_type)?;
        if old.display() != old.name() {
            metric.set_display(old.display());
        }
        metric.set_exportable(old.exportable());
        metric.set_property(old.property());
        metric.set_comment(old.comment());
        Ok(metric)
    }

    // ---- values by key ---------------------------------------------------

    fn slot(&self, metric: &str, instance: &str) -> Result<usize, MatrixError> {
        if !self.metrics.contains_key(metric) {
            return Err(MatrixError::InvalidMetricKey(metric.to_string()));
        }
        self.instances
            .get(instance)
            .map(Instance::index)
            .ok_or_else(|| MatrixError::InvalidInstanceKey(instance.to_string()))
    }

    /// `(value, ok)` of one cell; unknown keys read as not-ok.
    pub fn get_value(&self, metric: &str, instance: &str) -> (f64, bool) {
        match (self.metrics.get(metric), self.instances.get(instance)) {
            (Some(m), Some(i)) => m.get_f64(i.index()),
            _ => (0.0, false),
        }
    }

    pub fn value_state(&self, metric: &str, instance: &str) -> Result<ValueState, MatrixError> {
        let idx = self.slot(metric, instance)?;
        Ok(self.metrics[metric].state(idx))
    }

    pub fn set_value(&mut self, metric: &str, instance: &str, v: f64) -> Result<(), MatrixError> {
        let idx = self.slot(metric, instance)?;
        self.metric_or_err(metric)?.set_f64(idx, v)
    }

    pub fn set_value_u64(&mut self, metric: &str, instance: &str, v: u64) -> Result<(), MatrixError> {
        let idx = self.slot(metric, instance)?;
        self.metric_or_err(metric)?.set_u64(idx, v)
    }

    pub fn set_value_i64(&mut self, metric: &str, instance: &str, v: i64) -> Result<(), MatrixError> {
        let idx = self.slot(metric, instance)?;
        self.metric_or_err(metric)?.set_i64(idx, v)
    }

    pub fn set_value_str(&mut self, metric: &str, instance: &str, v: &str) -> Result<(), MatrixError> {
        let idx = self.slot(metric, instance)?;
        self.metric_or_err(metric)?.set_str(idx, v)
    }

    fn metric_or_err(&mut self, key: &str) -> Result<&mut Metric, MatrixError> {
        self.metrics
            .get_mut(key)
            .ok_or_else(|| MatrixError::InvalidMetricKey(key.to_string()))
    }

    /// Zeros every value and clears skip state; keys are kept.
    pub fn reset(&mut self) {
        for metric in self.metrics.values_mut() {
            metric.reset();
        }
    }

    // ---- global labels ---------------------------------------------------

    pub fn global_labels(&self) -> &HashMap<String, String> {
        &self.global_labels
    }

    pub fn set_global_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.global_labels.insert(name.into(), value.into());
    }

    pub fn clear_global_labels(&mut self) {
        self.global_labels.clear();
    }

    /// Adds labels that are not already set; existing values are never
    /// overwritten.
    pub fn set_global_labels<'a, I>(&mut self, labels: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (k, v) in labels {
            self.global_labels
                .entry(k.clone())
                .or_insert_with(|| v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Matrix {
        let mut m = Matrix::new("Rest", "volume", "volume");
        m.new_metric("read_ops", MetricType::Float64).unwrap();
        m.new_instance("vol1").unwrap().set_label("volume", "vol1");
        m.new_instance("vol2").unwrap().set_label("volume", "vol2");
        m.set_value("read_ops", "vol1", 1.0).unwrap();
        m.set_value("read_ops", "vol2", 2.0).unwrap();
        m
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut m = sample();
        assert_eq!(
            m.new_metric("read_ops", MetricType::Float64).unwrap_err(),
            MatrixError::DuplicateMetric("read_ops".into())
        );
        assert_eq!(
            m.new_instance("vol1").unwrap_err(),
            MatrixError::DuplicateInstance("vol1".into())
        );
        assert!(matches!(
            m.new_metric_typed("x", "complex"),
            Err(MatrixError::InvalidType(_))
        ));
    }

    #[test]
    fn test_metric_created_after_instances_is_sized() {
        let mut m = sample();
        m.new_metric("write_ops", MetricType::Uint64).unwrap();
        m.set_value_u64("write_ops", "vol2", 9).unwrap();
        assert_eq!(m.get_value("write_ops", "vol2"), (9.0, true));
        assert_eq!(m.get_value("write_ops", "vol1"), (0.0, false));
    }

    #[test]
    fn test_unknown_keys() {
        let mut m = sample();
        assert_eq!(
            m.set_value("nope", "vol1", 1.0).unwrap_err(),
            MatrixError::InvalidMetricKey("nope".into())
        );
        assert_eq!(
            m.value_state("read_ops", "nope").unwrap_err(),
            MatrixError::InvalidInstanceKey("nope".into())
        );
        assert_eq!(m.get_value("nope", "vol1"), (0.0, false));
    }

    #[test]
    fn test_remove_instance_compacts() {
        let mut m = sample();
        m.new_instance("vol3").unwrap();
        m.set_value("read_ops", "vol3", 3.0).unwrap();
        m.remove_instance("vol1");
        assert_eq!(m.instance("vol2").unwrap().index(), 0);
        assert_eq!(m.instance("vol3").unwrap().index(), 1);
        assert_eq!(m.get_value("read_ops", "vol3"), (3.0, true));
        assert_eq!(m.metric("read_ops").unwrap().len(), 2);
    }

    #[test]
    fn test_clone_without_data() {
        let m = sample();
        let c = m.clone_with(With {
            data: false,
            ..With::default()
        });
        assert_eq!(c.instances().len(), 2);
        assert_eq!(c.get_value("read_ops", "vol1"), (0.0, false));
        let bare = m.clone_with(With {
            instances: false,
            ..With::default()
        });
        assert!(bare.instances().is_empty());
        assert_eq!(bare.metric("read_ops").unwrap().len(), 0);
    }

    #[test]
    fn test_reset_keeps_keys() {
        let mut m = sample();
        m.reset();
        assert_eq!(m.instances().len(), 2);
        assert!(matches!(
            m.value_state("read_ops", "vol1").unwrap(),
            ValueState::Absent
        ));
    }

    #[test]
    fn test_global_labels_set_if_absent() {
        let mut m = sample();
        m.set_global_label("cluster", "c1");
        let mut more = HashMap::new();
        more.insert("cluster".to_string(), "other".to_string());
        more.insert("datacenter".to_string(), "dc1".to_string());
        m.set_global_labels(&more);
        assert_eq!(m.global_labels()["cluster"], "c1");
        assert_eq!(m.global_labels()["datacenter"], "dc1");
    }

    #[test]
    fn test_change_metric_type() {
        let mut m = sample();
        m.metric_mut("read_ops").unwrap().set_property("rate");
        let metric = m.change_metric_type("read_ops", MetricType::Uint64).unwrap();
        assert_eq!(metric.metric_type(), MetricType::Uint64);
        assert_eq!(metric.property(), "rate");
        assert_eq!(m.get_value("read_ops", "vol1"), (0.0, false));
    }
}
