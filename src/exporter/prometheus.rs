//! Prometheus text exposition of matrices.
//!
//! Every metric is rendered as a gauge named `<object>_<display>`. Output is
//! stable: instances and metrics come out in key order, labels sorted by
//! name.

use super::{exported_instances, exported_metrics, info_labels, instance_labels, LabelSet};
use crate::matrix::Matrix;
use ahash::AHashMap as HashMap;
use std::fmt::Write as FmtWrite;

/// Replaces characters Prometheus does not allow in metric and label names.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn format_labels(labels: &LabelSet) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", sanitize_name(k), escape_label_value(v)))
        .collect();
    format!("{{{}}}", parts.join(","))
}

fn format_value(raw: String) -> String {
    match raw.as_str() {
        "inf" => "+Inf".to_string(),
        "-inf" => "-Inf".to_string(),
        _ => raw,
    }
}

/// Series grouped by family, in first-seen order.
#[derive(Default)]
struct Families {
    order: Vec<String>,
    lines: HashMap<String, Vec<String>>,
}

impl Families {
    fn push(&mut self, family: &str, line: String) {
        if !self.lines.contains_key(family) {
            self.order.push(family.to_string());
        }
        self.lines.entry(family.to_string()).or_default().push(line);
    }

    fn write(self, out: &mut String) {
        for family in &self.order {
            writeln!(out, "# TYPE {family} gauge").ok();
            for line in self.lines.get(family).into_iter().flatten() {
                writeln!(out, "{line}").ok();
            }
        }
    }
}

/// Renders one matrix. A non-exportable matrix renders nothing.
pub fn render(mat: &Matrix) -> String {
    render_all(std::slice::from_ref(mat))
}

/// Renders every matrix of a poll. Matrices sharing an object share their
/// families, so each `# TYPE` header appears once.
pub fn render_all(matrices: &[Matrix]) -> String {
    let mut families = Families::default();
    for mat in matrices {
        collect(mat, &mut families);
    }
    let mut out = String::new();
    families.write(&mut out);
    out
}

fn collect(mat: &Matrix, families: &mut Families) {
    if !mat.exportable() {
        return;
    }
    let object = sanitize_name(mat.object());

    let info_family = format!("{object}_labels");
    for (_, inst) in exported_instances(mat) {
        if let Some(labels) = info_labels(mat, inst) {
            families.push(&info_family, format!("{info_family}{} 1", format_labels(&labels)));
        }
    }

    let bases: Vec<(usize, LabelSet)> = exported_instances(mat)
        .map(|(_, inst)| (inst.index(), instance_labels(mat, inst)))
        .collect();
    for (_, metric) in exported_metrics(mat) {
        let family = format!("{object}_{}", sanitize_name(metric.display()));
        for (idx, base) in &bases {
            let Some(value) = metric.format_value(*idx) else {
                continue;
            };
            let mut labels = base.clone();
            for (k, v) in metric.labels() {
                labels.insert(k.clone(), v.clone());
            }
            families.push(&family, format!("{family}{} {}", format_labels(&labels), format_value(value)));
        }
    }
}
