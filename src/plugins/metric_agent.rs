//! Synthesises metrics from arithmetic over existing ones.
//!
//! ```text
//! compute_metric:
//!   - space_total ADD space_available space_used
//!   - inode_used_percent PERCENT inode_used inode_total
//! ```
//!
//! Operands are metric keys (or display names) or integer literals, folded
//! left to right.

use super::{Plugin, PluginError, PluginOutput};
use crate::matrix::{Matrix, Metric, MetricType};
use crate::plugins::label_agent::rules::RuleError;
use crate::record::Transport;
use std::str::FromStr;
use tracing::{debug, trace, warn};

pub const COMPUTE_METRIC_PROPERTY: &str = "compute_metric mapping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Percent,
}

impl FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Operation::Add),
            "SUBTRACT" => Ok(Operation::Subtract),
            "MULTIPLY" => Ok(Operation::Multiply),
            "DIVIDE" => Ok(Operation::Divide),
            "PERCENT" => Ok(Operation::Percent),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Metric(String),
    Literal(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeRule {
    pub target: String,
    pub operation: Operation,
    pub operands: Vec<Operand>,
}

impl ComputeRule {
    pub fn parse(rule: &str) -> Result<Self, RuleError> {
        let invalid = || RuleError::InvalidFormat {
            kind: "compute_metric".to_string(),
            rule: rule.to_string(),
        };
        let fields: Vec<&str> = rule.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(invalid());
        }
        let operation = fields[1].parse::<Operation>().map_err(|_| invalid())?;
        let operands = fields[2..]
            .iter()
            .map(|f| match f.parse::<i64>() {
                Ok(n) => Operand::Literal(n as f64),
                Err(_) => Operand::Metric((*f).to_string()),
            })
            .collect();
        Ok(Self {
            target: fields[0].to_string(),
            operation,
            operands,
        })
    }
}

/// Finds a metric by display name first, then by key.
fn lookup<'a>(data: &'a Matrix, name: &str) -> Option<&'a Metric> {
    data.metrics()
        .values()
        .find(|m| m.display() == name)
        .or_else(|| data.metric(name))
}

pub struct MetricAgent {
    rules: Vec<ComputeRule>,
}

impl MetricAgent {
    pub fn new(params: &serde_yaml::Value) -> Result<Self, PluginError> {
        let mut rules = Vec::new();
        if let Some(map) = params.as_mapping() {
            for (kind, value) in map {
                match kind.as_str() {
                    Some("compute_metric") => {
                        let items: Vec<&str> = match value {
                            serde_yaml::Value::Sequence(seq) => seq.iter().filter_map(|v| v.as_str()).collect(),
                            serde_yaml::Value::String(s) => vec![s.as_str()],
                            _ => Vec::new(),
                        };
                        for item in items {
                            match ComputeRule::parse(item.trim()) {
                                Ok(r) => {
                                    debug!(rule = item, "parsed compute_metric rule");
                                    rules.push(r);
                                }
                                Err(e) => warn!(error = %e, "rule dropped"),
                            }
                        }
                    }
                    other => warn!(kind = ?other, "unknown rule kind"),
                }
            }
        }
        Self::from_rules(rules)
    }

    pub fn from_rules(rules: Vec<ComputeRule>) -> Result<Self, PluginError> {
        if rules.is_empty() {
            return Err(PluginError::NoRules {
                plugin: "MetricAgent".to_string(),
            });
        }
        Ok(Self { rules })
    }

    fn compute(rule: &ComputeRule, data: &Matrix, idx: usize) -> Option<f64> {
        let mut values = rule.operands.iter().map(|op| match op {
            Operand::Literal(v) => Some(*v),
            Operand::Metric(name) => {
                let metric = lookup(data, name)?;
                let (v, ok) = metric.get_f64(idx);
                ok.then_some(v)
            }
        });
        let mut result = values.next()??;
        for v in values {
            let v = v?;
            result = match rule.operation {
                Operation::Add => result + v,
                Operation::Subtract => result - v,
                Operation::Multiply => result * v,
                Operation::Divide | Operation::Percent if v == 0.0 => {
                    trace!(target_metric = %rule.target, "division by zero, result set to 0");
                    0.0
                }
                Operation::Divide => result / v,
                Operation::Percent => result / v * 100.0,
            };
        }
        Some(result)
    }
}

impl Plugin for MetricAgent {
    fn name(&self) -> &str {
        "MetricAgent"
    }

    fn run(&mut self, data: &mut Matrix, _transport: &mut dyn Transport) -> Result<PluginOutput, PluginError> {
        for rule in &self.rules {
            for op in &rule.operands {
                if let Operand::Metric(name) = op {
                    if lookup(data, name).is_none() {
                        warn!(metric = %name, target_metric = %rule.target, "operand metric not found");
                    }
                }
            }

            let results: Vec<(usize, f64)> = data
                .instances()
                .values()
                .filter_map(|inst| Self::compute(rule, data, inst.index()).map(|v| (inst.index(), v)))
                .collect();

            let metric = match data.metric(&rule.target) {
                Some(_) => data
                    .metric_mut(&rule.target)
                    .ok_or_else(|| crate::matrix::MatrixError::InvalidMetricKey(rule.target.clone()))?,
                None => {
                    let m = data.new_metric(&rule.target, MetricType::Float64)?;
                    m.set_property(COMPUTE_METRIC_PROPERTY);
                    m
                }
            };
            for (idx, v) in results {
                if let Err(e) = metric.set_f64(idx, v) {
                    debug!(error = %e, "failed to set computed value");
                }
            }
        }
        Ok(PluginOutput::default())
    }
}
