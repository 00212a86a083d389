//! Rebuilds FlexGroup volumes from their constituents.
//!
//! ONTAP reports a FlexGroup as N constituents named `<volume>__<NNNN>`. Each
//! poll the plugin groups them by `svm.volume`, creates one parent instance
//! per group in a separate matrix and rolls the constituent metrics up into
//! it (see [`super::rollup`]).
//!
//! Two optional outputs ride along. With `footprint` set the plugin works on
//! a capacity (non-perf) volume matrix instead: the FlexGroup parents already
//! exist there, so only the footprint metrics are summed into a separate
//! matrix. With `zombie_metric` set, every flexvol whose `total_ops` has moved
//! by less than [`ZOMBIE_OPS_DELTA`] for longer than [`ZOMBIE_AFTER_SECS`] is
//! flagged with 1 in a zombie matrix, every other flexvol with 0.

use super::rollup::{self, LatencyRule};
use super::{Plugin, PluginEnv, PluginError, PluginOutput};
use crate::matrix::{ExportOptions, Instance, Matrix, MetricType, With};
use crate::pipeline::TIMESTAMP_KEY;
use crate::record::{HrefBuilder, Transport};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub static CONSTITUENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)__(\d{4})$").expect("constituent regex"));

pub const VOLUME_STYLE_QUERY: &str = "api/private/cli/volume";
pub const STYLE_CONSTITUENT: &str = "flexgroup_constituent";
pub const STYLE_FLEXVOL: &str = "flexvol";
pub const STYLE_FLEXGROUP: &str = "flexgroup";

pub const FOOTPRINT_METRICS: &[&str] = &[
    "capacity_tier_footprint",
    "delayed_free_footprint",
    "flexvol_metadata_footprint",
    "guarantee_footprint",
    "metadata_footprint",
    "performance_tier_footprint",
    "total_footprint",
    "total_metadata_footprint",
    "volume_blocks_footprint_bin0",
    "volume_blocks_footprint_bin1",
    "volume_guarantee_footprint",
];

pub const TOTAL_OPS_KEY: &str = "total_ops";
pub const ZOMBIE_OPS_DELTA: f64 = 10.0;
pub const ZOMBIE_AFTER_SECS: f64 = 60.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlexGroupParams {
    pub include_constituents: bool,
    pub enable_volume_aggr_matrix: bool,
    pub style_label: String,
    /// Roll up footprint metrics of a capacity matrix instead of perf metrics.
    pub footprint: bool,
    pub zombie_metric: Option<String>,
}

impl Default for FlexGroupParams {
    fn default() -> Self {
        Self {
            include_constituents: false,
            enable_volume_aggr_matrix: false,
            style_label: "style".to_string(),
            footprint: false,
            zombie_metric: None,
        }
    }
}

/// Last seen `total_ops` of a flexvol and how long it has stayed flat.
#[derive(Debug, Clone, Copy)]
struct Quiet {
    ops: f64,
    seconds: f64,
}

pub struct FlexGroup {
    params: FlexGroupParams,
    /// `svm + volume` → extended style, kept across polls when a refresh fails.
    styles: HashMap<String, String>,
    quiet: HashMap<String, Quiet>,
}

impl FlexGroup {
    pub fn new(params: &serde_yaml::Value, env: &PluginEnv) -> Result<Self, PluginError> {
        let params = super::params::<FlexGroupParams>("FlexGroup", params)?;
        debug!(object = %env.object, include_constituents = params.include_constituents, "flexgroup plugin");
        Ok(Self {
            params,
            styles: HashMap::new(),
            quiet: HashMap::new(),
        })
    }

    fn refresh_styles(&mut self, transport: &mut dyn Transport) {
        let href = HrefBuilder::new()
            .api_path(VOLUME_STYLE_QUERY)
            .fields(["volume", "vserver", "volume_style_extended"])
            .filter(["is_constituent=*"])
            .build();
        match transport.fetch(&href) {
            Ok(records) => {
                self.styles = records
                    .iter()
                    .map(|r| {
                        let key = format!("{}{}", r.get("vserver").string(), r.get("volume").string());
                        (key, r.get("volume_style_extended").string())
                    })
                    .collect();
                debug!(volumes = self.styles.len(), "refreshed volume styles");
            }
            Err(e) => debug!(error = %e, "volume style query failed, keeping cached styles"),
        }
    }

    /// Style of one volume instance: the fetched style, else its own label.
    fn style_of<'a>(&'a self, svm: &str, volume: &str, label: &'a str) -> &'a str {
        self.styles
            .get(&format!("{svm}{volume}"))
            .map(String::as_str)
            .unwrap_or(label)
    }

    /// Creates the parent instance of constituent `inst` in `cache` unless it
    /// exists. Returns the parent key, `None` for a malformed constituent name.
    fn ensure_parent(&self, cache: &mut Matrix, inst: &Instance) -> Result<Option<String>, PluginError> {
        let volume = inst.label("volume");
        let Some(caps) = CONSTITUENT_RE.captures(volume) else {
            warn!(volume, "constituent name does not match <volume>__NNNN");
            return Ok(None);
        };
        let parent = caps.get(1).map_or("", |m| m.as_str());
        let parent_key = format!("{}.{parent}", inst.label("svm"));
        if cache.instance(&parent_key).is_none() {
            let fg = cache.new_instance(&parent_key)?;
            fg.set_labels(inst.labels().clone());
            fg.set_label("volume", parent);
            fg.set_label("node", "");
            fg.set_label("uuid", "");
            fg.set_label(&self.params.style_label, STYLE_FLEXGROUP);
        }
        Ok(Some(parent_key))
    }

    /// Sums the footprint metrics of constituents into one instance per
    /// FlexGroup. Constituents are left untouched.
    pub fn footprint(&self, data: &Matrix) -> Result<Matrix, PluginError> {
        let mut cache = Matrix::new(format!("{}.FlexGroupFootprint", data.uuid()), data.object(), data.object());
        cache.set_global_labels(data.global_labels());
        // a second labels series per parent would clash with the capacity matrix
        cache.set_export_options(ExportOptions {
            instance_labels: Vec::new(),
            ..data.export_options().clone()
        });
        let footprints: Vec<&String> = data
            .metrics()
            .keys()
            .filter(|k| FOOTPRINT_METRICS.contains(&k.as_str()))
            .collect();
        for key in &footprints {
            if let Some(source) = data.metric(key) {
                let target = cache.new_metric(key, source.metric_type())?;
                target.set_display(source.display());
                target.set_exportable(source.exportable());
            }
        }

        let mut aggrs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for inst in data.instances().values() {
            let style = self.style_of(inst.label("svm"), inst.label("volume"), inst.label(&self.params.style_label));
            if style != STYLE_CONSTITUENT {
                continue;
            }
            let Some(parent_key) = self.ensure_parent(&mut cache, inst)? else {
                continue;
            };
            aggrs.entry(parent_key.clone()).or_default().insert(inst.label("aggr").to_string());
            let Some(parent_idx) = cache.instance(&parent_key).map(|i| i.index()) else {
                continue;
            };
            for key in &footprints {
                let (Some(source), Some(target)) = (data.metric(key), cache.metric_mut(key)) else {
                    continue;
                };
                if source.get_f64(inst.index()).1 {
                    rollup::add_into(target, parent_idx, source, inst.index())?;
                }
            }
        }
        set_aggr_labels(&mut cache, &aggrs);
        debug!(object = data.object(), flexgroups = cache.instances().len(), "rolled up flexgroup footprints");
        Ok(cache)
    }

    /// Flags flexvols whose `total_ops` stayed flat for too long. Flat time
    /// accrues from the cooked timestamp, i.e. the seconds between polls.
    pub fn zombies(&mut self, data: &Matrix, metric_name: &str) -> Result<Matrix, PluginError> {
        let mut zombies = Matrix::new(format!("{}.Zombie", data.uuid()), data.object(), data.object());
        zombies.set_global_labels(data.global_labels());
        zombies.set_export_options(ExportOptions {
            instance_labels: Vec::new(),
            ..data.export_options().clone()
        });
        zombies.new_metric(metric_name, MetricType::Float64)?;

        let Some(total_ops) = data.metric(TOTAL_OPS_KEY) else {
            debug!(object = data.object(), "no total_ops, zombie tracking off");
            return Ok(zombies);
        };
        let style_label = self.params.style_label.clone();
        let mut seen: HashSet<String> = HashSet::new();
        for inst in data.instances().values() {
            let (svm, volume) = (inst.label("svm"), inst.label("volume"));
            if self.style_of(svm, volume, inst.label(&style_label)) != STYLE_FLEXVOL {
                continue;
            }
            let (ops, ok) = total_ops.get_f64(inst.index());
            if !ok {
                continue;
            }
            let key = format!("{svm}.{volume}");
            let elapsed = data
                .metric(TIMESTAMP_KEY)
                .map(|m| m.get_f64(inst.index()))
                .filter(|(_, ok)| *ok)
                .map_or(0.0, |(v, _)| v);
            let quiet = match self.quiet.get(&key) {
                Some(prev) if (prev.ops - ops).abs() < ZOMBIE_OPS_DELTA => Quiet {
                    ops,
                    seconds: prev.seconds + elapsed,
                },
                _ => Quiet { ops, seconds: 0.0 },
            };
            self.quiet.insert(key.clone(), quiet);

            let row = zombies.new_instance(&key)?;
            row.set_labels(inst.labels().clone());
            row.set_label(&style_label, STYLE_FLEXVOL);
            let flag = if quiet.seconds > ZOMBIE_AFTER_SECS { 1.0 } else { 0.0 };
            zombies.set_value(metric_name, &key, flag)?;
            seen.insert(key);
        }
        self.quiet.retain(|k, _| seen.contains(k));
        Ok(zombies)
    }

    /// Builds the parent matrix and the optional per-volume matrix.
    pub fn aggregate(&self, data: &mut Matrix) -> Result<(Vec<Matrix>, usize), PluginError> {
        let style_label = self.params.style_label.as_str();
        let mut cache = data.clone_with(With {
            data: false,
            instances: false,
            ..With::default()
        });
        let mut volume_aggr = Matrix::new(data.uuid(), "volume_aggr", "volume_aggr");
        volume_aggr.set_global_labels(data.global_labels());
        volume_aggr.new_metric("labels", MetricType::Float64)?;

        let mut aggrs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut members: Vec<(String, String)> = Vec::new();
        let mut flexvols: Vec<String> = Vec::new();

        for (key, inst) in data.instances() {
            let svm = inst.label("svm");
            let volume = inst.label("volume");
            match self.style_of(svm, volume, inst.label(style_label)) {
                STYLE_CONSTITUENT => {
                    let Some(parent_key) = self.ensure_parent(&mut cache, inst)? else {
                        continue;
                    };
                    aggrs.entry(parent_key.clone()).or_default().insert(inst.label("aggr").to_string());
                    members.push((key.clone(), parent_key));
                }
                STYLE_FLEXVOL => flexvols.push(key.clone()),
                _ => {}
            }
        }

        for (child, _) in &members {
            if let Some(inst) = data.instance_mut(child) {
                inst.set_label(style_label, STYLE_CONSTITUENT);
                inst.set_exportable(self.params.include_constituents);
            }
        }
        for key in &flexvols {
            if let Some(inst) = data.instance_mut(key) {
                inst.set_label(style_label, STYLE_FLEXVOL);
            }
        }

        set_aggr_labels(&mut cache, &aggrs);
        debug!(object = data.object(), flexgroups = cache.instances().len(), "extracted flexgroup volumes");

        let skips = rollup::roll_up(data, &mut cache, &members, &LatencyRule::Suffix)?;

        let mut out = vec![cache];
        if self.params.enable_volume_aggr_matrix {
            for (parent_key, inst) in out[0].instances() {
                let row = volume_aggr.new_instance(parent_key)?;
                row.set_labels(inst.labels().clone());
            }
            for key in &flexvols {
                if let Some(inst) = data.instance(key) {
                    let svm_volume = format!("{}.{}", inst.label("svm"), inst.label("volume"));
                    match volume_aggr.new_instance(&svm_volume) {
                        Ok(row) => row.set_labels(inst.labels().clone()),
                        Err(e) => warn!(error = %e, "duplicate flexvol in volume_aggr"),
                    }
                }
            }
            let keys = volume_aggr.instance_keys();
            for key in keys {
                volume_aggr.set_value("labels", &key, 1.0)?;
            }
            out.push(volume_aggr);
        }
        Ok((out, skips))
    }
}

impl Plugin for FlexGroup {
    fn name(&self) -> &str {
        "FlexGroup"
    }

    fn run(&mut self, data: &mut Matrix, transport: &mut dyn Transport) -> Result<PluginOutput, PluginError> {
        self.refresh_styles(transport);
        if self.params.footprint {
            let matrices = vec![self.footprint(data)?];
            return Ok(PluginOutput { matrices, skips: 0 });
        }
        let (mut matrices, skips) = self.aggregate(data)?;
        if let Some(name) = self.params.zombie_metric.clone() {
            matrices.push(self.zombies(data, &name)?);
        }
        Ok(PluginOutput { matrices, skips })
    }
}

fn set_aggr_labels(cache: &mut Matrix, aggrs: &BTreeMap<String, BTreeSet<String>>) {
    for (parent_key, set) in aggrs {
        let joined = set.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        if let Some(fg) = cache.instance_mut(parent_key) {
            fg.set_label("aggr", joined);
        }
    }
}
