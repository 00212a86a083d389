//! Per-qtree quota usage from the quota report.

use super::{Plugin, PluginError, PluginOutput};
use crate::matrix::{ExportOptions, Matrix, MetricType};
use crate::record::{HrefBuilder, Transport};
use ahash::AHashMap as HashMap;
use serde_json::Value;
use tracing::{debug, warn};

pub const QUOTA_REPORT_QUERY: &str = "api/storage/quota/reports";

/// Record path → exported name.
pub const QUOTA_METRICS: [(&str, &str); 5] = [
    ("space.hard_limit", "disk_limit"),
    ("space.used.total", "disk_used"),
    ("space.used.hard_limit_percent", "disk_used_pct_disk_limit"),
    ("space.used.soft_limit_percent", "disk_used_pct_soft_disk_limit"),
    ("space.soft_limit", "soft_disk_limit"),
];

pub struct Qtree {
    data: Matrix,
}

impl Qtree {
    pub fn new(_params: &serde_yaml::Value) -> Result<Self, PluginError> {
        let mut data = Matrix::new("Rest.Qtree", "qtree", "qtree");
        for (path, display) in QUOTA_METRICS {
            data.new_metric(path, MetricType::Float64)?.set_display(display);
        }
        Ok(Self { data })
    }
}

/// `-` means unlimited and reads as 0; strings keep only their first word.
fn quota_value(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => {
            let first = s.split(' ').next().unwrap_or_default();
            match first {
                "" => None,
                "-" => Some("0".to_string()),
                v => Some(v.to_string()),
            }
        }
        _ => None,
    }
}

impl Plugin for Qtree {
    fn name(&self) -> &str {
        "Qtree"
    }

    fn run(&mut self, data: &mut Matrix, transport: &mut dyn Transport) -> Result<PluginOutput, PluginError> {
        self.data.purge_instances();
        self.data.reset();
        self.data.set_global_labels(data.global_labels());

        let parent_options = data.export_options();
        let mut keys = parent_options.instance_keys.clone();
        keys.extend(parent_options.instance_labels.iter().cloned());
        self.data.set_export_options(ExportOptions {
            include_all_labels: false,
            instance_keys: keys.clone(),
            instance_labels: Vec::new(),
        });

        // (qtree, volume, svm) → parent instance key
        let parents: HashMap<(String, String, String), String> = data
            .instances()
            .iter()
            .map(|(k, i)| {
                (
                    (
                        i.label("qtree").to_string(),
                        i.label("volume").to_string(),
                        i.label("svm").to_string(),
                    ),
                    k.clone(),
                )
            })
            .collect();

        let href = HrefBuilder::new().api_path(QUOTA_REPORT_QUERY).fields(["*"]).build();
        let records = transport.fetch(&href)?;
        if records.is_empty() {
            debug!("no quota report instances on cluster");
            return Ok(PluginOutput::default());
        }

        for quota in &records {
            let tree = quota.get("qtree.name").string();
            let volume = quota.get("volume.name").string();
            let svm = quota.get("svm.name").string();
            let index = quota.get("index").string();

            let Some(parent) = parents
                .get(&(tree.clone(), volume.clone(), svm.clone()))
                .and_then(|k| data.instance(k))
            else {
                warn!(tree = %tree, volume = %volume, svm = %svm, "no qtree instance for quota");
                continue;
            };
            if !parent.exportable() {
                continue;
            }

            let key = format!("{svm}.{volume}.{tree}.{index}");
            if self.data.instance(&key).is_none() {
                self.data.new_instance(&key)?;
            }
            if let Some(inst) = self.data.instance_mut(&key) {
                for label in &keys {
                    let value = parent.label(label);
                    if !value.is_empty() {
                        inst.set_label(label.clone(), value);
                    }
                }
                inst.set_label("svm", svm.clone());
                inst.set_label("volume", volume.clone());
                inst.set_label("qtree", tree.clone());
                inst.set_label("index", index.clone());
            }

            for (path, _) in QUOTA_METRICS {
                let Some(value) = quota.get(path).raw().and_then(quota_value) else {
                    continue;
                };
                if let Err(e) = self.data.set_value_str(path, &key, &value) {
                    debug!(error = %e, attribute = path, value = %value, "failed to parse value");
                }
            }
        }

        Ok(PluginOutput {
            matrices: vec![self.data.clone()],
            skips: 0,
        })
    }
}
