//! QoS policy helpers: throughput-string parsing, the adaptive-policy IOPS
//! ceiling, and the two plugins built on them.

use super::{Plugin, PluginError, PluginOutput};
use crate::matrix::{Instance, Matrix, MetricType};
use crate::plugins::flexgroup::CONSTITUENT_RE;
use crate::record::{HrefBuilder, Record, Transport};
use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

static IOPS_PER_UNIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)iops/(tb|gb)").expect("iops per unit regex"));
static IOPS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)iops").expect("iops regex"));
static BPS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(\.\d+)?)(\w+)/s").expect("bps regex"));

pub const ADAPTIVE_POLICY_QUERY: &str = "api/private/cli/qos/adaptive-policy-group";
pub const VOLUME_SPACE_QUERY: &str = "api/storage/volumes";

const BYTES_PER_TB: f64 = 1e12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QosParseError {
    #[error("unknown qos-policy format [{0}]")]
    Format(String),

    #[error("unknown qos-policy unit [{unit}] of [{input}]")]
    Unit { unit: String, input: String },

    #[error("invalid number [{number}] in [{input}]")]
    Number { number: String, input: String },

    #[error("unknown iops allocation [{0}]")]
    Allocation(String),
}

/// A throughput limit split into its IOPS and MB/s parts; empty when unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Throughput {
    pub iops: String,
    pub mbps: String,
}

fn unit_to_mb(unit: &str) -> Option<f64> {
    match unit {
        "b" => Some(1e-6),
        "kb" => Some(1e-3),
        "mb" => Some(1.0),
        "gb" => Some(1e3),
        "tb" => Some(1e6),
        _ => None,
    }
}

/// Parses ONTAP throughput strings such as `1000iops`, `500iops/gb`,
/// `150MB/s` or `1000iops,150MB/s`.
pub fn zapi_to_rest(input: &str) -> Result<Throughput, QosParseError> {
    let lower = input.trim().to_lowercase();
    if lower.is_empty() || lower == "inf" || lower == "0" {
        return Ok(Throughput::default());
    }

    if let Some((before, after)) = lower.split_once(',') {
        let left = zapi_to_rest(before)?;
        let right = zapi_to_rest(after)?;
        return Ok(Throughput {
            iops: left.iops,
            mbps: right.mbps,
        });
    }

    if let Some(caps) = IOPS_PER_UNIT_RE.captures(&lower) {
        let number = &caps[1];
        let mut iops = number.parse::<u64>().map_err(|_| QosParseError::Number {
            number: number.to_string(),
            input: input.to_string(),
        })?;
        if &caps[2] == "gb" {
            iops *= 1000;
        }
        return Ok(Throughput {
            iops: iops.to_string(),
            mbps: String::new(),
        });
    }

    if let Some(caps) = IOPS_RE.captures(&lower) {
        return Ok(Throughput {
            iops: caps[1].to_string(),
            mbps: String::new(),
        });
    }

    let caps = BPS_RE
        .captures(&lower)
        .ok_or_else(|| QosParseError::Format(input.to_string()))?;
    let unit = &caps[3];
    let multiple = unit_to_mb(unit).ok_or_else(|| QosParseError::Unit {
        unit: unit.to_string(),
        input: input.to_string(),
    })?;
    let number = &caps[1];
    let value = number.parse::<f64>().map_err(|_| QosParseError::Number {
        number: number.to_string(),
        input: input.to_string(),
    })?;
    Ok(Throughput {
        iops: String::new(),
        mbps: (value * multiple).to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    UsedSpace,
    AllocatedSpace,
}

impl FromStr for Allocation {
    type Err = QosParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "used_space" | "used-space" => Ok(Allocation::UsedSpace),
            "allocated_space" | "allocated-space" => Ok(Allocation::AllocatedSpace),
            other => Err(QosParseError::Allocation(other.to_string())),
        }
    }
}

/// An adaptive QoS policy; IOPS figures are per TB except `absolute_min_iops`.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptivePolicy {
    pub policy_group: String,
    pub absolute_min_iops: f64,
    pub expected_iops: f64,
    pub expected_iops_allocation: Allocation,
    pub peak_iops: f64,
    pub peak_iops_allocation: Allocation,
    /// Block size in KB, `None` for `any`.
    pub block_size: Option<f64>,
}

fn parse_iops(value: &str) -> Result<f64, QosParseError> {
    let t = zapi_to_rest(value)?;
    if t.iops.is_empty() {
        return Ok(0.0);
    }
    t.iops.parse::<f64>().map_err(|_| QosParseError::Number {
        number: t.iops.clone(),
        input: value.to_string(),
    })
}

/// `4k`, `32K` or `any`.
pub fn parse_block_size(value: &str) -> Result<Option<f64>, QosParseError> {
    let v = value.trim();
    if v.is_empty() || v.eq_ignore_ascii_case("any") {
        return Ok(None);
    }
    let digits = v.to_uppercase().replace('K', "");
    digits
        .trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|_| QosParseError::Number {
            number: digits.clone(),
            input: value.to_string(),
        })
}

impl AdaptivePolicy {
    /// Reads a policy record of the adaptive policy-group query.
    pub fn from_record(record: &Record) -> Result<Self, QosParseError> {
        Ok(Self {
            policy_group: record.get("policy_group").string(),
            absolute_min_iops: parse_iops(&record.get("absolute_min_iops").string())?,
            expected_iops: parse_iops(&record.get("expected_iops").string())?,
            expected_iops_allocation: record.get("expected_iops_allocation").string().parse()?,
            peak_iops: parse_iops(&record.get("peak_iops").string())?,
            peak_iops_allocation: record.get("peak_iops_allocation").string().parse()?,
            block_size: parse_block_size(&record.get("block_size").string())?,
        })
    }

    /// Peak IOPS the policy allows a workload of `size_tb`, `used_tb` of
    /// which is used.
    pub fn peak_allowed_iops(&self, size_tb: f64, used_tb: f64) -> f64 {
        let space = |a: Allocation| match a {
            Allocation::UsedSpace => used_tb,
            Allocation::AllocatedSpace => size_tb,
        };
        let min = self
            .absolute_min_iops
            .max(space(self.expected_iops_allocation) * self.expected_iops);
        let peak = min.max(space(self.peak_iops_allocation) * self.peak_iops);
        peak.round()
    }
}

pub fn used_percent(ops: f64, peak_allowed_iops: f64) -> f64 {
    if peak_allowed_iops == 0.0 {
        return 0.0;
    }
    ops * 100.0 / peak_allowed_iops
}

pub fn throughput_percent(total_bps: f64, block_size_kb: f64, peak_iops: f64) -> f64 {
    let limit = (peak_iops * block_size_kb / 1000.0) * 1_000_000.0;
    if total_bps <= 0.0 || limit == 0.0 {
        return 0.0;
    }
    total_bps / limit
}

/// Stores a parsed throughput part as a label, and as a metric when the
/// matrix has one of that name.
fn set_part(data: &mut Matrix, key: &str, name: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    if let Some(inst) = data.instance_mut(key) {
        inst.set_label(name, value);
    }
    if data.metric(name).is_some() {
        if let Err(e) = data.set_value_str(name, key, value) {
            warn!(error = %e, metric = name, value, "unable to set metric");
        }
    }
}

pub const FIXED_METRICS: [&str; 4] = [
    "max_throughput_iops",
    "max_throughput_mbps",
    "min_throughput_iops",
    "min_throughput_mbps",
];

/// Splits fixed-policy throughput limits into IOPS and MB/s parts.
///
/// Reads `throughput_policy` (`MIN-MAX`), or else the `min_throughput` and
/// `max_throughput` labels.
pub struct QosPolicyFixed;

impl QosPolicyFixed {
    pub fn new(_params: &serde_yaml::Value) -> Result<Self, PluginError> {
        Ok(Self)
    }

    fn limits(inst: &Instance) -> Option<(String, String)> {
        let policy = inst.label("throughput_policy");
        if !policy.is_empty() {
            let Some((min, max)) = policy.split_once('-') else {
                warn!(label = policy, "unable to parse fixed xput label");
                return None;
            };
            return Some((min.to_string(), max.to_string()));
        }
        let (min, max) = (inst.label("min_throughput"), inst.label("max_throughput"));
        (!min.is_empty() || !max.is_empty()).then(|| (min.to_string(), max.to_string()))
    }
}

impl Plugin for QosPolicyFixed {
    fn name(&self) -> &str {
        "QosPolicyFixed"
    }

    fn run(&mut self, data: &mut Matrix, _transport: &mut dyn Transport) -> Result<PluginOutput, PluginError> {
        for key in FIXED_METRICS {
            data.metric_or_insert(key, MetricType::Float64);
        }
        let limits: Vec<(String, String, String)> = data
            .instances()
            .iter()
            .filter_map(|(k, i)| Self::limits(i).map(|(min, max)| (k.clone(), min, max)))
            .collect();

        for (key, min, max) in limits {
            let (min, max) = match (zapi_to_rest(&min), zapi_to_rest(&max)) {
                (Ok(min), Ok(max)) => (min, max),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(instance = %key, error = %e, "failed to parse fixed xput label");
                    continue;
                }
            };
            set_part(data, &key, "min_throughput_iops", &min.iops);
            set_part(data, &key, "max_throughput_iops", &max.iops);
            set_part(data, &key, "min_throughput_mbps", &min.mbps);
            set_part(data, &key, "max_throughput_mbps", &max.mbps);
        }
        Ok(PluginOutput::default())
    }
}

/// Fills `used_ops_percent` and `used_throughput_percent` of volume
/// workloads governed by an adaptive policy.
pub struct Workload;

impl Workload {
    pub fn new(_params: &serde_yaml::Value) -> Result<Self, PluginError> {
        Ok(Self)
    }

    fn fetch_policies(transport: &mut dyn Transport) -> Result<HashMap<String, AdaptivePolicy>, PluginError> {
        let href = HrefBuilder::new()
            .api_path(ADAPTIVE_POLICY_QUERY)
            .fields([
                "policy_group",
                "absolute_min_iops",
                "expected_iops",
                "expected_iops_allocation",
                "peak_iops",
                "peak_iops_allocation",
                "block_size",
                "vserver",
            ])
            .build();
        let mut map = HashMap::new();
        for record in transport.fetch(&href)? {
            match AdaptivePolicy::from_record(&record) {
                Ok(p) => {
                    map.insert(p.policy_group.clone(), p);
                }
                Err(e) => warn!(error = %e, "adaptive policy dropped"),
            }
        }
        Ok(map)
    }

    /// `svm.volume` → `(size_tb, used_tb)`.
    fn fetch_volume_space(transport: &mut dyn Transport) -> Result<HashMap<String, (f64, f64)>, PluginError> {
        let href = HrefBuilder::new()
            .api_path(VOLUME_SPACE_QUERY)
            .fields(["name", "svm.name", "space.size", "space.used"])
            .build();
        Ok(transport
            .fetch(&href)?
            .iter()
            .map(|r| {
                let key = format!("{}.{}", r.get("svm.name").string(), r.get("name").string());
                let size = r.get("space.size").float() / BYTES_PER_TB;
                let used = r.get("space.used").float() / BYTES_PER_TB;
                (key, (size, used))
            })
            .collect())
    }
}

impl Plugin for Workload {
    fn name(&self) -> &str {
        "Workload"
    }

    fn run(&mut self, data: &mut Matrix, transport: &mut dyn Transport) -> Result<PluginOutput, PluginError> {
        data.metric_or_insert("used_ops_percent", MetricType::Float64);
        data.metric_or_insert("used_throughput_percent", MetricType::Float64);

        let policies = Self::fetch_policies(transport)?;
        if policies.is_empty() {
            debug!("no adaptive qos policies");
            return Ok(PluginOutput::default());
        }
        let space = Self::fetch_volume_space(transport)?;

        let mut updates: Vec<(String, Option<f64>, Option<f64>)> = Vec::new();
        for (key, inst) in data.instances() {
            let volume = inst.label("volume");
            if CONSTITUENT_RE.is_match(volume)
                || !inst.label("qtree").is_empty()
                || !inst.label("lun").is_empty()
                || !inst.label("file").is_empty()
            {
                continue;
            }
            let Some(policy) = policies.get(inst.label("policy_group")) else {
                continue;
            };
            let Some((size_tb, used_tb)) = space.get(&format!("{}.{}", inst.label("svm"), volume)) else {
                continue;
            };
            let peak = policy.peak_allowed_iops(*size_tb, *used_tb);
            let idx = inst.index();
            let ops = data
                .metric("ops")
                .map(|m| m.get_f64(idx))
                .and_then(|(v, ok)| ok.then(|| used_percent(v, peak)));
            let xput = policy.block_size.and_then(|block| {
                data.metric("total_data")
                    .map(|m| m.get_f64(idx))
                    .and_then(|(v, ok)| ok.then(|| throughput_percent(v, block, policy.peak_iops)))
            });
            updates.push((key.clone(), ops, xput));
        }

        for (key, ops, xput) in updates {
            if let Some(v) = ops {
                data.set_value("used_ops_percent", &key, v)?;
            }
            if let Some(v) = xput {
                data.set_value("used_throughput_percent", &key, v)?;
            }
        }
        Ok(PluginOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(peak_alloc: Allocation, expected_alloc: Allocation, expected: f64) -> AdaptivePolicy {
        AdaptivePolicy {
            policy_group: "group1".into(),
            absolute_min_iops: 75.0,
            expected_iops: expected,
            expected_iops_allocation: expected_alloc,
            peak_iops: 512.0,
            peak_iops_allocation: peak_alloc,
            block_size: None,
        }
    }

    #[test]
    fn test_zapi_to_rest() {
        let t = |iops: &str, mbps: &str| Throughput {
            iops: iops.into(),
            mbps: mbps.into(),
        };
        assert_eq!(zapi_to_rest("1000iops,150MB/s").unwrap(), t("1000", "150"));
        assert_eq!(zapi_to_rest("500iops/gb").unwrap(), t("500000", ""));
        assert_eq!(zapi_to_rest("6144IOPS/TB").unwrap(), t("6144", ""));
        assert_eq!(zapi_to_rest("100IOPS").unwrap(), t("100", ""));
        assert_eq!(zapi_to_rest("1.5GB/s").unwrap(), t("", "1500"));
        assert_eq!(zapi_to_rest("500KB/s").unwrap(), t("", "0.5"));
        assert_eq!(zapi_to_rest("").unwrap(), Throughput::default());
        assert_eq!(zapi_to_rest("INF").unwrap(), Throughput::default());
        assert_eq!(zapi_to_rest("0").unwrap(), Throughput::default());
        assert!(zapi_to_rest("garbage").is_err());
        assert!(matches!(zapi_to_rest("5pb/s"), Err(QosParseError::Unit { .. })));
    }

    #[test]
    fn test_peak_allowed_iops() {
        use Allocation::*;
        let p = policy(UsedSpace, AllocatedSpace, 128.0);
        assert_eq!(p.peak_allowed_iops(1.0, 0.5), 256.0);
        assert_eq!(p.peak_allowed_iops(0.001, 0.0), 75.0);
        assert_eq!(p.peak_allowed_iops(1.0, 0.0), 128.0);
        assert_eq!(p.peak_allowed_iops(1.0, 0.3), 154.0);
        assert_eq!(p.peak_allowed_iops(2.0, 2.0), 1024.0);
        let p = policy(AllocatedSpace, AllocatedSpace, 128.0);
        assert_eq!(p.peak_allowed_iops(1.0, 0.0), 512.0);
        let p = policy(UsedSpace, UsedSpace, 50.0);
        assert_eq!(p.peak_allowed_iops(1.5, 0.3), 154.0);
        let p = policy(UsedSpace, UsedSpace, 128.0);
        assert_eq!(p.peak_allowed_iops(1.0, 0.2), 102.0);
    }

    #[test]
    fn test_percentages() {
        assert_eq!(used_percent(64.0, 256.0), 25.0);
        assert_eq!(used_percent(64.0, 0.0), 0.0);
        assert_eq!(throughput_percent(0.0, 4.0, 512.0), 0.0);
        assert!((throughput_percent(2048.0, 4.0, 512.0) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_block_size() {
        assert_eq!(parse_block_size("any").unwrap(), None);
        assert_eq!(parse_block_size("32K").unwrap(), Some(32.0));
        assert_eq!(parse_block_size("4k").unwrap(), Some(4.0));
        assert!(parse_block_size("big").is_err());
    }
}
