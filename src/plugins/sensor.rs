//! Node-level power, temperature and fan metrics from raw environment sensors.
//!
//! Every sensor instance carries `node`, `sensor` (its name), `type` and
//! `unit` labels and one value metric. Sensors are classified by name and
//! type, then folded into one `environment_sensor` instance per node.

use super::{Plugin, PluginError, PluginOutput};
use crate::matrix::{Matrix, MetricType};
use crate::record::{HrefBuilder, Transport};
use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

static AMBIENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(Ambient Temp|Ambient Temp \d|PSU\d AmbTemp|PSU\d Inlet|PSU\d Inlet Temp|In Flow Temp|Front Temp|Bat_Ambient \d|Riser Inlet Temp)$",
    )
    .expect("ambient sensor regex")
});
static POWER_IN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PSU\d (InPwr Monitor|InPower|PIN|Power In|In Pwr)$").expect("power sensor regex")
});
static VOLTAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PSU\d (\d+V|InVoltage|VIN|AC In Volt|In Volt)$").expect("voltage sensor regex"));
static CURRENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^PSU\d (\d+V Curr|Curr|InCurrent|Curr IIN|AC In Curr|In Curr)$").expect("current sensor regex")
});

pub const CHASSIS_FRU_QUERY: &str = "api/private/cli/system/chassis/fru";

/// PSU efficiency used when only output-side voltage and current are known.
pub const PSU_EFFICIENCY: f64 = 0.93;

pub const ENVIRONMENT_METRICS: [&str; 9] = [
    "average_ambient_temperature",
    "average_fan_speed",
    "average_temperature",
    "max_fan_speed",
    "max_temperature",
    "min_ambient_temperature",
    "min_fan_speed",
    "min_temperature",
    "power",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorParams {
    pub value_key: String,
}

impl Default for SensorParams {
    fn default() -> Self {
        Self {
            value_key: "value".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Reading {
    name: String,
    value: f64,
    unit: String,
}

#[derive(Debug, Default)]
struct NodeSensors {
    ambient: Vec<f64>,
    thermal: Vec<f64>,
    fan: Vec<f64>,
    // keyed by instance key so V and I pair up deterministically
    power: BTreeMap<String, Reading>,
    voltage: BTreeMap<String, Reading>,
    current: BTreeMap<String, Reading>,
}

fn avg(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn min(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

fn has_in_token(name: &str) -> bool {
    name.contains("in") || name.contains("In")
}

impl NodeSensors {
    fn power(&self, node: &str) -> Option<f64> {
        if !self.power.is_empty() {
            let mut sum = 0.0;
            for r in self.power.values() {
                match r.unit.as_str() {
                    "mW" | "mW*hr" => sum += r.value / 1000.0,
                    "W" | "W*hr" => sum += r.value,
                    unit => warn!(node, name = %r.name, unit, value = r.value, "unknown power unit"),
                }
                if r.unit.ends_with("*hr") {
                    info!(node, name = %r.name, unit = %r.unit, "hourly power sensor");
                }
            }
            return Some(sum);
        }

        if !self.voltage.is_empty() && self.voltage.len() == self.current.len() {
            let mut sum = 0.0;
            for (v, i) in self.voltage.values().zip(self.current.values()) {
                let volts = match v.unit.as_str() {
                    "mV" => v.value / 1000.0,
                    "V" => v.value,
                    unit => {
                        warn!(node, unit, value = v.value, "unknown voltage unit");
                        v.value
                    }
                };
                let amps = match i.unit.as_str() {
                    "mA" => i.value / 1000.0,
                    "A" => i.value,
                    unit => {
                        warn!(node, unit, value = i.value, "unknown current unit");
                        i.value
                    }
                };
                let mut watts = volts * amps;
                if !has_in_token(&v.name) && !has_in_token(&i.name) {
                    watts /= PSU_EFFICIENCY;
                }
                sum += watts;
            }
            return Some(sum);
        }

        warn!(
            node,
            voltage = self.voltage.len(),
            current = self.current.len(),
            "current and voltage sensors are ignored"
        );
        None
    }
}

/// Folds the sensor instances of `data` into `out`, one instance per node.
/// `num_nodes` maps a node to the number of nodes sharing its PSUs.
pub fn calculate(data: &Matrix, value_key: &str, num_nodes: &HashMap<String, u32>, out: &mut Matrix) {
    let Some(metric) = data.metric(value_key) else {
        debug!(value_key, "sensor value metric missing");
        return;
    };
    let mut nodes: BTreeMap<String, NodeSensors> = BTreeMap::new();
    let mut excluded: Vec<(String, String, f64)> = Vec::new();

    for (key, inst) in data.instances() {
        if !inst.exportable() {
            continue;
        }
        let node = inst.label("node");
        if node.is_empty() {
            warn!(key = %key, "missing node label for instance");
            continue;
        }
        let name = inst.label("sensor");
        if name.is_empty() {
            warn!(key = %key, "missing sensor name for instance");
            continue;
        }
        let sensors = nodes.entry(node.to_string()).or_default();
        let sensor_type = inst.label("type");
        let (value, ok) = metric.get_f64(inst.index());
        let reading = || Reading {
            name: name.to_string(),
            value,
            unit: inst.label("unit").to_string(),
        };

        let ambient = AMBIENT_RE.is_match(name);
        match sensor_type {
            "thermal" if ambient => {
                if ok {
                    sensors.ambient.push(value);
                }
            }
            "thermal" => {
                if value > 0.0 && !name.contains("Margin") {
                    if ok {
                        sensors.thermal.push(value);
                    }
                } else {
                    excluded.push((node.to_string(), name.to_string(), value));
                }
            }
            "fan" if ok => sensors.fan.push(value),
            _ => {}
        }
        if !ok {
            continue;
        }
        if POWER_IN_RE.is_match(name) {
            sensors.power.insert(key.clone(), reading());
        }
        if VOLTAGE_RE.is_match(name) {
            sensors.voltage.insert(key.clone(), reading());
        }
        if CURRENT_RE.is_match(name) {
            sensors.current.insert(key.clone(), reading());
        }
    }

    if !excluded.is_empty() {
        info!(sensors = ?excluded, "sensors excluded");
    }

    for (node, sensors) in &nodes {
        let idx = match out.new_instance(node) {
            Ok(inst) => {
                inst.set_label("node", node.clone());
                inst.index()
            }
            Err(e) => {
                warn!(error = %e, node = %node, "failed to add node instance");
                continue;
            }
        };
        let power = sensors.power(node).map(|p| {
            let shared = num_nodes.get(node).copied().unwrap_or_else(|| {
                debug!(node = %node, "node not in chassis map, assuming one node per PSU");
                1
            });
            p / f64::from(shared.max(1))
        });
        let values = [
            ("power", power),
            ("average_ambient_temperature", avg(&sensors.ambient)),
            ("min_ambient_temperature", min(&sensors.ambient)),
            ("average_temperature", avg(&sensors.thermal)),
            ("min_temperature", min(&sensors.thermal)),
            ("max_temperature", max(&sensors.thermal)),
            ("average_fan_speed", avg(&sensors.fan)),
            ("min_fan_speed", min(&sensors.fan)),
            ("max_fan_speed", max(&sensors.fan)),
        ];
        for (key, value) in values {
            if let Some(v) = value {
                let m = out.metric_or_insert(key, MetricType::Float64);
                if let Err(e) = m.set_f64(idx, v) {
                    debug!(error = %e, metric = key, "failed to set environment metric");
                }
            }
        }
    }
}

pub struct Sensor {
    params: SensorParams,
    data: Matrix,
}

impl Sensor {
    pub fn new(params: &serde_yaml::Value) -> Result<Self, PluginError> {
        let mut data = Matrix::new("Rest.Sensor", "environment_sensor", "environment_sensor");
        for key in ENVIRONMENT_METRICS {
            data.new_metric(key, MetricType::Float64)?;
        }
        Ok(Self {
            params: super::params::<SensorParams>("Sensor", params)?,
            data,
        })
    }

    /// `node → number of nodes sharing its PSUs` from the chassis FRU table.
    fn chassis_fru(transport: &mut dyn Transport) -> HashMap<String, u32> {
        let href = HrefBuilder::new()
            .api_path(CHASSIS_FRU_QUERY)
            .fields(["fru-name", "type", "status", "connected-nodes", "num-nodes"])
            .filter(["type=psu"])
            .build();
        let records = match transport.fetch(&href) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "chassis fru query failed");
                return HashMap::new();
            }
        };
        let mut map = HashMap::new();
        for r in records {
            let nodes = r.get("connected_nodes");
            if !nodes.exists() {
                warn!(fru = %r.get("fru_name").string(), "fru has no connected nodes");
                continue;
            }
            let n = u32::try_from(r.get("num_nodes").int()).unwrap_or(1);
            for node in nodes.array() {
                map.insert(node.string(), n);
            }
        }
        map
    }
}

impl Plugin for Sensor {
    fn name(&self) -> &str {
        "Sensor"
    }

    fn run(&mut self, data: &mut Matrix, transport: &mut dyn Transport) -> Result<PluginOutput, PluginError> {
        self.data.purge_instances();
        self.data.reset();
        self.data.set_global_labels(data.global_labels());

        let num_nodes = Self::chassis_fru(transport);
        if num_nodes.is_empty() {
            debug!("no chassis field replaceable units found");
        }
        calculate(data, &self.params.value_key, &num_nodes, &mut self.data);
        Ok(PluginOutput {
            matrices: vec![self.data.clone()],
            skips: 0,
        })
    }
}
