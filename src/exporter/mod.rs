//! What leaves the poller.
//!
//! Exporters render each instance of a matrix as a label set plus one value
//! per metric. This module holds the format-independent part of that
//! contract: which instances, metrics and labels are exported. The
//! exposition formats themselves live in submodules.

pub mod prometheus;

use crate::matrix::{Instance, Matrix, Metric};
use std::collections::BTreeMap;

/// Label set of one series, sorted by name.
pub type LabelSet = BTreeMap<String, String>;

/// Labels every series of `inst` carries: global labels, overridden by the
/// instance labels the export options select. Selected keys the instance
/// lacks are exported empty unless a global label fills them.
pub fn instance_labels(mat: &Matrix, inst: &Instance) -> LabelSet {
    let mut labels: LabelSet = mat
        .global_labels()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let options = mat.export_options();
    if options.include_all_labels {
        for (k, v) in inst.labels() {
            labels.insert(k.clone(), v.clone());
        }
    } else {
        for key in &options.instance_keys {
            let value = inst.label(key);
            // an empty key label does not hide a global label of the same name
            if !value.is_empty() || !labels.contains_key(key) {
                labels.insert(key.clone(), value.to_string());
            }
        }
    }
    labels
}

/// Labels of the `<object>_labels` info series, or `None` when the export
/// options select no instance labels or all of them are empty.
pub fn info_labels(mat: &Matrix, inst: &Instance) -> Option<LabelSet> {
    let options = mat.export_options();
    if options.include_all_labels || options.instance_labels.is_empty() {
        return None;
    }
    let extra: Vec<(&String, &str)> = options
        .instance_labels
        .iter()
        .map(|k| (k, inst.label(k)))
        .filter(|(_, v)| !v.is_empty())
        .collect();
    if extra.is_empty() {
        return None;
    }
    let mut labels = instance_labels(mat, inst);
    for (k, v) in extra {
        labels.insert(k.clone(), v.to_string());
    }
    Some(labels)
}

/// Instances that are exported, in key order.
pub fn exported_instances(mat: &Matrix) -> impl Iterator<Item = (&String, &Instance)> {
    mat.instances().iter().filter(|(_, i)| i.exportable())
}

/// Metrics that are exported, in key order.
pub fn exported_metrics(mat: &Matrix) -> impl Iterator<Item = (&String, &Metric)> {
    mat.metrics().iter().filter(|(_, m)| m.exportable())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::ExportOptions;

    fn volume() -> Matrix {
        let mut m = Matrix::new("Rest", "volume", "volume");
        m.set_global_label("cluster", "c1");
        m.set_global_label("volume", "global");
        let inst = m.new_instance("vs1.v1").unwrap();
        inst.set_label("volume", "v1");
        inst.set_label("svm", "vs1");
        inst.set_label("style", "");
        m
    }

    #[test]
    fn test_instance_wins_over_global() {
        let m = volume();
        let labels = instance_labels(&m, m.instance("vs1.v1").unwrap());
        assert_eq!(labels["volume"], "v1");
        assert_eq!(labels["cluster"], "c1");
        assert!(info_labels(&m, m.instance("vs1.v1").unwrap()).is_none());
    }

    #[test]
    fn test_keys_and_info_labels() {
        let mut m = volume();
        m.set_export_options(ExportOptions {
            include_all_labels: false,
            instance_keys: vec!["volume".into(), "aggr".into()],
            instance_labels: vec!["svm".into(), "style".into()],
        });
        let inst = m.instance("vs1.v1").unwrap();
        let labels = instance_labels(&m, inst);
        assert_eq!(labels["aggr"], "");
        assert!(!labels.contains_key("svm"));

        let info = info_labels(&m, inst).unwrap();
        assert_eq!(info["svm"], "vs1");
        assert!(!info.contains_key("style"));

        m.set_global_label("aggr", "aggr0");
        let labels = instance_labels(&m, m.instance("vs1.v1").unwrap());
        assert_eq!(labels["aggr"], "aggr0");
    }
}
