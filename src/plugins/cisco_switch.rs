//! Moves interfaces of Cisco NX-OS switches into their own matrices.
//!
//! Interfaces whose `switch` label names an NX-OS switch are removed from the
//! data matrix and exported as `cisco_interface` with an `admin_up` metric;
//! each such switch also gets a `cisco_switch` labels row carrying its OS
//! version.

use super::{Plugin, PluginError, PluginOutput};
use crate::matrix::{Matrix, MetricType, With};
use crate::record::{HrefBuilder, Transport};
use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(\.\d+)+\(([0-9]+?)\)").expect("switch version regex"));

pub const SWITCHES_QUERY: &str = "api/network/ethernet/switches";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchData {
    pub is_cisco: bool,
    pub admin_up: bool,
    pub os_version: String,
}

/// Reads the switch version string: NX-OS marks a Cisco switch and the last
/// `x.y(z)` token is its OS version.
pub fn parse_version(version: &str) -> (bool, String) {
    if !version.contains("NX-OS") {
        return (false, String::new());
    }
    let os = VERSION_RE
        .find_iter(version)
        .last()
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    (true, os)
}

pub struct CiscoSwitch;

impl CiscoSwitch {
    pub fn new(_params: &serde_yaml::Value) -> Result<Self, PluginError> {
        Ok(Self)
    }

    fn collect_switches(transport: &mut dyn Transport) -> HashMap<String, SwitchData> {
        let href = HrefBuilder::new()
            .api_path(SWITCHES_QUERY)
            .fields(["name", "version", "monitoring.enabled"])
            .build();
        let records = match transport.fetch(&href) {
            Ok(r) => r,
            Err(e) => {
                warn!(href = %href, error = %e, "failed to fetch switches");
                return HashMap::new();
            }
        };
        records
            .iter()
            .map(|r| {
                let version = r.get("version");
                let (is_cisco, os_version) = if version.exists() {
                    parse_version(&version.string())
                } else {
                    (false, String::new())
                };
                let data = SwitchData {
                    is_cisco,
                    admin_up: r.get("monitoring.enabled").bool(),
                    os_version,
                };
                (r.get("name").string(), data)
            })
            .collect()
    }

    pub fn split(data: &mut Matrix, switches: &HashMap<String, SwitchData>) -> Result<Vec<Matrix>, PluginError> {
        let datacenter = data.global_labels().get("datacenter").cloned().unwrap_or_default();
        let mut interfaces = data.clone_with(With::default());
        interfaces.set_object("cisco_interface");
        interfaces.set_identifier("cisco_interface");
        interfaces.clear_global_labels();
        interfaces.set_global_label("datacenter", datacenter);
        interfaces.metric_or_insert("admin_up", MetricType::Float64);

        let mut labels = Matrix::new(format!("{}.Cisco_interface", data.uuid()), "cisco_switch", "cisco_switch");
        labels.set_global_labels(interfaces.global_labels());
        labels.new_metric("labels", MetricType::Float64)?;

        for key in interfaces.instance_keys() {
            let switch = interfaces
                .instance(&key)
                .map(|i| i.label("switch").to_string())
                .unwrap_or_default();
            let Some(sw) = switches.get(&switch).filter(|s| s.is_cisco) else {
                interfaces.remove_instance(&key);
                continue;
            };
            data.remove_instance(&key);
            interfaces.set_value("admin_up", &key, if sw.admin_up { 1.0 } else { 0.0 })?;

            if labels.instance(&switch).is_none() {
                let row = labels.new_instance(&switch)?;
                row.set_label("switch", switch.clone());
                row.set_label("osVersion", sw.os_version.clone());
                labels.set_value("labels", &switch, 1.0)?;
            }
        }

        if interfaces.instances().is_empty() {
            debug!("no cisco switches found");
            return Ok(Vec::new());
        }
        info!(interfaces = interfaces.instances().len(), switches = labels.instances().len(), "cisco switches found");
        Ok(vec![interfaces, labels])
    }
}

impl Plugin for CiscoSwitch {
    fn name(&self) -> &str {
        "CiscoSwitch"
    }

    fn run(&mut self, data: &mut Matrix, transport: &mut dyn Transport) -> Result<PluginOutput, PluginError> {
        let switches = Self::collect_switches(transport);
        let matrices = Self::split(data, &switches)?;
        Ok(PluginOutput { matrices, skips: 0 })
    }
}
