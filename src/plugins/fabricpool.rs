//! Rolls FabricPool cloud-bin statistics up to their FlexGroup volume.
//!
//! Bins are reported per constituent as `<volume>__<NNNN>_bin_<n>_cfg_id_<n>`
//! (or as plain constituents `<volume>__<NNNN>`); they are grouped per
//! `svm.volume.cloud_target`. Latency metrics are the ones whose key starts
//! with `cloud_bin_op_latency_average`, weighted by the matching
//! `<op_name>` counter.

use super::flexgroup::CONSTITUENT_RE;
use super::rollup::{self, LatencyRule};
use super::{Plugin, PluginEnv, PluginError, PluginOutput};
use crate::matrix::{Matrix, With};
use crate::record::Transport;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

static BIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)__(\d{4})_bin_(\d)_cfg_id_(\d)$").expect("fabricpool bin regex"));

pub const LATENCY_PREFIX: &str = "cloud_bin_op_latency_average";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FabricPoolParams {
    pub include_constituents: bool,
    pub op_name: String,
}

impl Default for FabricPoolParams {
    fn default() -> Self {
        Self {
            include_constituents: false,
            op_name: "cloud_bin_operation".to_string(),
        }
    }
}

pub struct FabricPool {
    params: FabricPoolParams,
}

/// Parent volume name of a bin or constituent.
fn parent_volume(volume: &str) -> Option<&str> {
    BIN_RE
        .captures(volume)
        .or_else(|| CONSTITUENT_RE.captures(volume))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

impl FabricPool {
    pub fn new(params: &serde_yaml::Value, env: &PluginEnv) -> Result<Self, PluginError> {
        let params = super::params::<FabricPoolParams>("FabricPool", params)?;
        debug!(object = %env.object, op_name = %params.op_name, "fabricpool plugin");
        Ok(Self { params })
    }

    pub fn aggregate(&self, data: &mut Matrix) -> Result<(Matrix, usize), PluginError> {
        let mut cache = data.clone_with(With {
            data: false,
            instances: false,
            ..With::default()
        });
        let mut members = Vec::new();

        for (key, inst) in data.instances() {
            if !inst.exportable() {
                continue;
            }
            let Some(parent) = parent_volume(inst.label("volume")) else {
                continue;
            };
            let parent_key = format!("{}.{}.{}", inst.label("svm"), parent, inst.label("cloud_target"));
            if cache.instance(&parent_key).is_none() {
                let fg = cache.new_instance(&parent_key)?;
                fg.set_labels(inst.labels().clone());
                fg.set_label("volume", parent);
            }
            members.push((key.clone(), parent_key));
        }
        debug!(volumes = cache.instances().len(), "extracted flexgroup volumes");

        for (child, _) in &members {
            if let Some(inst) = data.instance_mut(child) {
                inst.set_exportable(self.params.include_constituents);
            }
        }

        let rule = LatencyRule::Prefix {
            prefix: LATENCY_PREFIX.to_string(),
            op_name: self.params.op_name.clone(),
        };
        let skips = rollup::roll_up(data, &mut cache, &members, &rule)?;
        Ok((cache, skips))
    }
}

impl Plugin for FabricPool {
    fn name(&self) -> &str {
        "FabricPool"
    }

    fn run(&mut self, data: &mut Matrix, _transport: &mut dyn Transport) -> Result<PluginOutput, PluginError> {
        let (cache, skips) = self.aggregate(data)?;
        Ok(PluginOutput {
            matrices: vec![cache],
            skips,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::MetricType;

    #[test]
    fn test_parent_volume() {
        assert_eq!(parent_volume("fg__0001_bin_0_cfg_id_1"), Some("fg"));
        assert_eq!(parent_volume("fg__0002"), Some("fg"));
        assert_eq!(parent_volume("plain"), None);
    }

    #[test]
    fn test_bins_weighted_per_cloud_target() {
        let mut m = Matrix::new("RestPerf", "fabricpool", "fabricpool");
        m.new_metric("cloud_bin_operation.GET", MetricType::Float64).unwrap();
        m.new_metric("cloud_bin_op_latency_average.GET", MetricType::Float64)
            .unwrap();
        for (vol, target, lat, ops) in [
            ("fg__0001_bin_0_cfg_id_0", "s3", 10.0, 1.0),
            ("fg__0002_bin_0_cfg_id_0", "s3", 40.0, 3.0),
            ("fg__0001_bin_1_cfg_id_0", "azure", 0.0, 0.0),
        ] {
            let key = format!("{vol}.{target}");
            let inst = m.new_instance(&key).unwrap();
            inst.set_label("svm", "vs1");
            inst.set_label("volume", vol);
            inst.set_label("cloud_target", target);
            m.set_value("cloud_bin_op_latency_average.GET", &key, lat).unwrap();
            m.set_value("cloud_bin_operation.GET", &key, ops).unwrap();
        }
        let p = FabricPool::new(&serde_yaml::Value::Null, &PluginEnv::default()).unwrap();
        let (cache, skips) = p.aggregate(&mut m).unwrap();
        assert_eq!(cache.instances().len(), 2);
        assert_eq!(cache.get_value("cloud_bin_op_latency_average.GET", "vs1.fg.s3"), (32.5, true));
        assert_eq!(cache.get_value("cloud_bin_operation.GET", "vs1.fg.s3"), (4.0, true));
        assert!(cache
            .value_state("cloud_bin_op_latency_average.GET", "vs1.fg.azure")
            .unwrap()
            .is_skipped());
        assert_eq!(skips, 1);
        assert_eq!(cache.instance("vs1.fg.s3").unwrap().label("volume"), "fg");
        assert!(m.instances().values().all(|i| !i.exportable()));
    }
}
