//! Post-processing plugins.
//!
//! A plugin runs once per poll on the object's data matrix, after the raw
//! counters were cooked. It may rewrite the matrix in place and may return
//! additional matrices to export next to it.

pub mod cisco_switch;
pub mod fabricpool;
pub mod flexgroup;
pub mod label_agent;
pub mod metric_agent;
pub mod qos;
pub mod qtree;
pub mod rollup;
pub mod sensor;

use crate::matrix::{Matrix, MatrixError};
use crate::record::{Transport, TransportError};
use crate::template::PluginSpec;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {plugin}: invalid parameters: {reason}")]
    Params { plugin: String, reason: String },

    #[error("plugin {plugin}: no valid rules")]
    NoRules { plugin: String },

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result of one plugin run.
#[derive(Debug, Default)]
pub struct PluginOutput {
    /// Extra matrices to export alongside the data matrix.
    pub matrices: Vec<Matrix>,
    /// Values the plugin marked skipped.
    pub skips: usize,
}

impl PluginOutput {
    pub fn skips(skips: usize) -> Self {
        Self {
            matrices: Vec::new(),
            skips,
        }
    }
}

pub trait Plugin {
    fn name(&self) -> &str;

    fn run(&mut self, data: &mut Matrix, transport: &mut dyn Transport) -> Result<PluginOutput, PluginError>;
}

/// What a plugin may know about the object it is attached to.
#[derive(Debug, Clone, Default)]
pub struct PluginEnv {
    pub object: String,
}

/// Deserializes plugin parameters; a missing block yields the defaults.
pub(crate) fn params<T: DeserializeOwned + Default>(plugin: &str, value: &serde_yaml::Value) -> Result<T, PluginError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(value.clone()).map_err(|e| PluginError::Params {
        plugin: plugin.to_string(),
        reason: e.to_string(),
    })
}

/// Builds the plugin named by `spec`. Unknown names are logged and skipped.
pub fn build(spec: &PluginSpec, env: &PluginEnv) -> Result<Option<Box<dyn Plugin>>, PluginError> {
    let plugin: Box<dyn Plugin> = match spec.name.as_str() {
        "LabelAgent" => Box::new(label_agent::LabelAgent::new(&spec.params)?),
        "MetricAgent" => Box::new(metric_agent::MetricAgent::new(&spec.params)?),
        "FlexGroup" => Box::new(flexgroup::FlexGroup::new(&spec.params, env)?),
        "FabricPool" => Box::new(fabricpool::FabricPool::new(&spec.params, env)?),
        "Sensor" => Box::new(sensor::Sensor::new(&spec.params)?),
        "QosPolicyFixed" => Box::new(qos::QosPolicyFixed::new(&spec.params)?),
        "Workload" => Box::new(qos::Workload::new(&spec.params)?),
        "Qtree" => Box::new(qtree::Qtree::new(&spec.params)?),
        "CiscoSwitch" => Box::new(cisco_switch::CiscoSwitch::new(&spec.params)?),
        other => {
            warn!(plugin = other, object = %env.object, "unknown plugin, skipped");
            return Ok(None);
        }
    };
    Ok(Some(plugin))
}
