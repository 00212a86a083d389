//! Typed metric columns.
//!
//! A metric stores one value per instance slot in a dense vector of its own
//! numeric type, together with a `present` and a `skip` flag per slot. A slot
//! is therefore in exactly one of three states: absent (never set this poll),
//! valid, or skipped (set, but arithmetic made it unfit for export).

use super::MatrixError;
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage type of a metric. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Int64,
    Uint8,
    Uint64,
    Float64,
}

impl FromStr for MetricType {
    type Err = MatrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int64" | "int" => Ok(MetricType::Int64),
            "uint8" => Ok(MetricType::Uint8),
            "uint64" | "uint" => Ok(MetricType::Uint64),
            "float64" | "float" => Ok(MetricType::Float64),
            other => Err(MatrixError::InvalidType(other.to_string())),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricType::Int64 => "int64",
            MetricType::Uint8 => "uint8",
            MetricType::Uint64 => "uint64",
            MetricType::Float64 => "float64",
        };
        f.write_str(s)
    }
}

/// Dense per-slot value store, tagged by numeric type.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Int64(Vec<i64>),
    Uint8(Vec<u8>),
    Uint64(Vec<u64>),
    Float64(Vec<f64>),
}

impl Values {
    fn new(metric_type: MetricType, len: usize) -> Self {
        match metric_type {
            MetricType::Int64 => Values::Int64(vec![0; len]),
            MetricType::Uint8 => Values::Uint8(vec![0; len]),
            MetricType::Uint64 => Values::Uint64(vec![0; len]),
            MetricType::Float64 => Values::Float64(vec![0.0; len]),
        }
    }

    pub fn metric_type(&self) -> MetricType {
        match self {
            Values::Int64(_) => MetricType::Int64,
            Values::Uint8(_) => MetricType::Uint8,
            Values::Uint64(_) => MetricType::Uint64,
            Values::Float64(_) => MetricType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Values::Int64(v) => v.len(),
            Values::Uint8(v) => v.len(),
            Values::Uint64(v) => v.len(),
            Values::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resize(&mut self, len: usize) {
        match self {
            Values::Int64(v) => v.resize(len, 0),
            Values::Uint8(v) => v.resize(len, 0),
            Values::Uint64(v) => v.resize(len, 0),
            Values::Float64(v) => v.resize(len, 0.0),
        }
    }

    fn remove(&mut self, idx: usize) {
        match self {
            Values::Int64(v) => {
                v.remove(idx);
            }
            Values::Uint8(v) => {
                v.remove(idx);
            }
            Values::Uint64(v) => {
                v.remove(idx);
            }
            Values::Float64(v) => {
                v.remove(idx);
            }
        }
    }

    fn zero(&mut self) {
        match self {
            Values::Int64(v) => v.iter_mut().for_each(|x| *x = 0),
            Values::Uint8(v) => v.iter_mut().for_each(|x| *x = 0),
            Values::Uint64(v) => v.iter_mut().for_each(|x| *x = 0),
            Values::Float64(v) => v.iter_mut().for_each(|x| *x = 0.0),
        }
    }

    fn as_f64(&self, idx: usize) -> f64 {
        match self {
            Values::Int64(v) => v[idx] as f64,
            Values::Uint8(v) => v[idx] as f64,
            Values::Uint64(v) => v[idx] as f64,
            Values::Float64(v) => v[idx],
        }
    }

    fn format(&self, idx: usize) -> String {
        match self {
            Values::Int64(v) => v[idx].to_string(),
            Values::Uint8(v) => v[idx].to_string(),
            Values::Uint64(v) => v[idx].to_string(),
            Values::Float64(v) => v[idx].to_string(),
        }
    }
}

/// State of one slot of a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueState {
    Absent,
    Valid(f64),
    Skipped(f64),
}

impl ValueState {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValueState::Valid(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ValueState::Skipped(_))
    }
}

/// One metric (column) of a matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    name: String,
    display: Option<String>,
    exportable: bool,
    property: String,
    comment: String,
    labels: HashMap<String, String>,
    pub(super) values: Values,
    pub(super) present: Vec<bool>,
    pub(super) skip: Vec<bool>,
}

impl Metric {
    pub(crate) fn new(name: impl Into<String>, metric_type: MetricType, len: usize) -> Self {
        Self {
            name: name.into(),
            display: None,
            exportable: true,
            property: String::new(),
            comment: String::new(),
            labels: HashMap::new(),
            values: Values::new(metric_type, len),
            present: vec![false; len],
            skip: vec![false; len],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display name used by exporters; falls back to the metric name.
    pub fn display(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.name)
    }

    pub fn set_display(&mut self, display: impl Into<String>) {
        self.display = Some(display.into());
    }

    pub fn metric_type(&self) -> MetricType {
        self.values.metric_type()
    }

    pub fn exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn set_property(&mut self, property: impl Into<String>) {
        self.property = property.into();
    }

    /// Companion metric key, e.g. the ops denominator of a latency.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    /// Metric-level labels, rendered on every series of this metric.
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Number of slots in the store.
    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    pub fn state(&self, idx: usize) -> ValueState {
        if idx >= self.present.len() || !self.present[idx] {
            return ValueState::Absent;
        }
        let v = self.values.as_f64(idx);
        if self.skip[idx] {
            ValueState::Skipped(v)
        } else {
            ValueState::Valid(v)
        }
    }

    /// Reads a slot as `(value, ok)` where `ok = present && !skip`.
    pub fn get_f64(&self, idx: usize) -> (f64, bool) {
        match self.state(idx) {
            ValueState::Valid(v) => (v, true),
            ValueState::Skipped(v) => (v, false),
            ValueState::Absent => (0.0, false),
        }
    }

    /// Exact textual form of a valid slot, used for exposition.
    pub fn format_value(&self, idx: usize) -> Option<String> {
        match self.state(idx) {
            ValueState::Valid(_) => Some(self.values.format(idx)),
            _ => None,
        }
    }

    pub fn is_present(&self, idx: usize) -> bool {
        idx < self.present.len() && self.present[idx]
    }

    /// Marks the slot as present-but-skipped without touching its value.
    pub fn set_skipped(&mut self, idx: usize) {
        if idx < self.present.len() {
            self.present[idx] = true;
            self.skip[idx] = true;
        }
    }

    /// Returns the slot to the absent state.
    pub fn clear(&mut self, idx: usize) {
        if idx < self.present.len() {
            self.present[idx] = false;
            self.skip[idx] = false;
        }
    }

    fn mark_set(&mut self, idx: usize) {
        self.present[idx] = true;
        self.skip[idx] = false;
    }

    fn overflow(&mut self, idx: usize, value: impl fmt::Display) -> MatrixError {
        self.set_skipped(idx);
        MatrixError::Overflow {
            metric: self.name.clone(),
            value: value.to_string(),
        }
    }

    fn check_slot(&self, idx: usize) -> Result<(), MatrixError> {
        if idx >= self.present.len() {
            return Err(MatrixError::InvalidInstanceKey(format!(
                "slot {idx} of metric {}",
                self.name
            )));
        }
        Ok(())
    }

    /// Stores a float. NaN marks the slot skipped; a value that does not fit an
    /// integer store is an overflow.
    pub fn set_f64(&mut self, idx: usize, v: f64) -> Result<(), MatrixError> {
        self.check_slot(idx)?;
        if v.is_nan() {
            if let Values::Float64(vals) = &mut self.values {
                vals[idx] = v;
                self.set_skipped(idx);
                return Ok(());
            }
            return Err(self.overflow(idx, v));
        }
        match &mut self.values {
            Values::Float64(vals) => vals[idx] = v,
            Values::Int64(vals) => {
                if v.is_finite() && v >= i64::MIN as f64 && v < i64::MAX as f64 {
                    vals[idx] = v as i64;
                } else {
                    return Err(self.overflow(idx, v));
                }
            }
            Values::Uint64(vals) => {
                if v.is_finite() && v >= 0.0 && v < u64::MAX as f64 {
                    vals[idx] = v as u64;
                } else {
                    return Err(self.overflow(idx, v));
                }
            }
            Values::Uint8(vals) => {
                if v.is_finite() && (0.0..=u8::MAX as f64).contains(&v) {
                    vals[idx] = v as u8;
                } else {
                    return Err(self.overflow(idx, v));
                }
            }
        }
        self.mark_set(idx);
        Ok(())
    }

    pub fn set_i64(&mut self, idx: usize, v: i64) -> Result<(), MatrixError> {
        self.check_slot(idx)?;
        match &mut self.values {
            Values::Int64(vals) => vals[idx] = v,
            Values::Float64(vals) => vals[idx] = v as f64,
            Values::Uint64(vals) => match u64::try_from(v) {
                Ok(x) => vals[idx] = x,
                Err(_) => return Err(self.overflow(idx, v)),
            },
            Values::Uint8(vals) => match u8::try_from(v) {
                Ok(x) => vals[idx] = x,
                Err(_) => return Err(self.overflow(idx, v)),
            },
        }
        self.mark_set(idx);
        Ok(())
    }

    pub fn set_u64(&mut self, idx: usize, v: u64) -> Result<(), MatrixError> {
        self.check_slot(idx)?;
        match &mut self.values {
            Values::Uint64(vals) => vals[idx] = v,
            Values::Float64(vals) => vals[idx] = v as f64,
            Values::Int64(vals) => match i64::try_from(v) {
                Ok(x) => vals[idx] = x,
                Err(_) => return Err(self.overflow(idx, v)),
            },
            Values::Uint8(vals) => match u8::try_from(v) {
                Ok(x) => vals[idx] = x,
                Err(_) => return Err(self.overflow(idx, v)),
            },
        }
        self.mark_set(idx);
        Ok(())
    }

    pub fn set_u8(&mut self, idx: usize, v: u8) -> Result<(), MatrixError> {
        self.set_u64(idx, u64::from(v))
    }

    /// Parses and stores a textual counter value.
    pub fn set_str(&mut self, idx: usize, s: &str) -> Result<(), MatrixError> {
        let s = s.trim();
        let name = self.name.clone();
        let invalid = || MatrixError::InvalidValue {
            metric: name.clone(),
            value: s.to_string(),
        };
        match self.values.metric_type() {
            MetricType::Float64 => {
                let v = s.parse::<f64>().map_err(|_| invalid())?;
                self.set_f64(idx, v)
            }
            MetricType::Uint64 | MetricType::Uint8 => {
                if let Ok(v) = s.parse::<u64>() {
                    self.set_u64(idx, v)
                } else if let Ok(v) = s.parse::<i64>() {
                    self.set_i64(idx, v)
                } else {
                    let v = s.parse::<f64>().map_err(|_| invalid())?;
                    self.set_f64(idx, v)
                }
            }
            MetricType::Int64 => {
                if let Ok(v) = s.parse::<i64>() {
                    self.set_i64(idx, v)
                } else {
                    let v = s.parse::<f64>().map_err(|_| invalid())?;
                    self.set_f64(idx, v)
                }
            }
        }
    }

    pub(super) fn resize(&mut self, len: usize) {
        self.values.resize(len);
        self.present.resize(len, false);
        self.skip.resize(len, false);
    }

    pub(super) fn remove_slot(&mut self, idx: usize) {
        if idx < self.present.len() {
            self.values.remove(idx);
            self.present.remove(idx);
            self.skip.remove(idx);
        }
    }

    /// Empties the store but keeps the metric's shape.
    pub(super) fn empty_like(&self, len: usize) -> Self {
        Self {
            name: self.name.clone(),
            display: self.display.clone(),
            exportable: self.exportable,
            property: self.property.clone(),
            comment: self.comment.clone(),
            labels: self.labels.clone(),
            values: Values::new(self.metric_type(), len),
            present: vec![false; len],
            skip: vec![false; len],
        }
    }

    pub(super) fn reset(&mut self) {
        self.values.zero();
        self.present.iter_mut().for_each(|p| *p = false);
        self.skip.iter_mut().for_each(|s| *s = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!("float64".parse::<MetricType>().unwrap(), MetricType::Float64);
        assert_eq!("int".parse::<MetricType>().unwrap(), MetricType::Int64);
        assert_eq!("UINT8".parse::<MetricType>().unwrap(), MetricType::Uint8);
        assert!(matches!(
            "decimal".parse::<MetricType>(),
            Err(MatrixError::InvalidType(_))
        ));
    }

    #[test]
    fn test_signed_into_unsigned_overflows() {
        let mut m = Metric::new("ops", MetricType::Uint64, 2);
        m.set_u64(0, 10).unwrap();
        let err = m.set_i64(0, -1).unwrap_err();
        assert!(matches!(err, MatrixError::Overflow { .. }));
        // old value kept, slot skipped
        assert_eq!(m.state(0), ValueState::Skipped(10.0));
        assert_eq!(m.get_f64(0), (10.0, false));
    }

    #[test]
    fn test_uint8_range() {
        let mut m = Metric::new("status", MetricType::Uint8, 1);
        assert!(m.set_f64(0, 256.0).is_err());
        m.set_f64(0, 255.0).unwrap();
        assert_eq!(m.get_f64(0), (255.0, true));
    }

    #[test]
    fn test_nan_is_skip_not_absent() {
        let mut m = Metric::new("read_latency", MetricType::Float64, 2);
        m.set_f64(0, f64::NAN).unwrap();
        assert!(m.state(0).is_skipped());
        assert_eq!(m.state(1), ValueState::Absent);
        assert!(m.format_value(0).is_none());
    }

    #[test]
    fn test_set_str() {
        let mut m = Metric::new("size", MetricType::Uint64, 1);
        m.set_str(0, " 18446744073709551615 ").unwrap();
        assert_eq!(m.format_value(0).as_deref(), Some("18446744073709551615"));
        assert!(matches!(
            m.set_str(0, "n/a"),
            Err(MatrixError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_reset_keeps_shape() {
        let mut m = Metric::new("ops", MetricType::Int64, 2);
        m.set_i64(1, 7).unwrap();
        m.reset();
        assert_eq!(m.len(), 2);
        assert_eq!(m.state(1), ValueState::Absent);
    }
}
