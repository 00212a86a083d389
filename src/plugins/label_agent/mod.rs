//! Declarative per-instance label rewriting.
//!
//! Rules are compiled once when the plugin is built and applied every poll
//! in a fixed order: split, split_regex, split_pairs, join, replace,
//! replace_regex, include, exclude. Value-mapping rules then run as a
//! matrix-wide pass since they create metrics.

pub mod rules;

use super::{Plugin, PluginError, PluginOutput};
use crate::matrix::{Instance, Matrix, MetricType};
use crate::record::Transport;
use rules::{MatchRule, RuleSet};
use tracing::{debug, warn};

pub struct LabelAgent {
    rules: RuleSet,
}

fn rule_strings(value: &serde_yaml::Value) -> Vec<String> {
    match value {
        serde_yaml::Value::String(s) => vec![s.clone()],
        serde_yaml::Value::Sequence(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

impl LabelAgent {
    /// Compiles the rules in `params`. Malformed rules are logged and
    /// dropped; an agent without any valid rule is an error.
    pub fn new(params: &serde_yaml::Value) -> Result<Self, PluginError> {
        let mut rules = RuleSet::default();
        if let Some(map) = params.as_mapping() {
            for (kind, value) in map {
                let Some(kind) = kind.as_str() else {
                    continue;
                };
                for rule in rule_strings(value) {
                    match rules.add(kind, &rule) {
                        Ok(()) => debug!(kind, rule = %rule, "parsed rule"),
                        Err(e) => warn!(error = %e, "rule dropped"),
                    }
                }
            }
        }
        Self::from_rules(rules)
    }

    pub fn from_rules(rules: RuleSet) -> Result<Self, PluginError> {
        if rules.is_empty() {
            return Err(PluginError::NoRules {
                plugin: "LabelAgent".to_string(),
            });
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    fn rewrite(&self, instance: &mut Instance) {
        for r in &self.rules.split {
            let value = instance.label(&r.source).to_string();
            let pieces: Vec<&str> = value.split(r.sep.as_str()).collect();
            if pieces.len() >= r.targets.len() {
                for (target, piece) in r.targets.iter().zip(&pieces) {
                    if !target.is_empty() && !piece.is_empty() {
                        instance.set_label(target.clone(), *piece);
                    }
                }
            }
        }

        for r in &self.rules.split_regex {
            let value = instance.label(&r.source).to_string();
            if let Some(caps) = r.regex.captures(&value) {
                if caps.len() == r.targets.len() + 1 {
                    for (i, target) in r.targets.iter().enumerate() {
                        let piece = caps.get(i + 1).map_or("", |m| m.as_str());
                        if !target.is_empty() && !piece.is_empty() {
                            instance.set_label(target.clone(), piece);
                        }
                    }
                }
            }
        }

        for r in &self.rules.split_pairs {
            let value = instance.label(&r.source).to_string();
            for pair in value.split(r.outer.as_str()) {
                let kv: Vec<&str> = pair.split(r.inner.as_str()).collect();
                if let [k, v] = kv.as_slice() {
                    if !k.is_empty() {
                        instance.set_label(*k, *v);
                    }
                }
            }
        }

        for r in &self.rules.join {
            let joined = r
                .sources
                .iter()
                .map(|s| instance.label(s))
                .filter(|v| !v.is_empty())
                .collect::<Vec<_>>()
                .join(&r.sep);
            if !joined.is_empty() {
                instance.set_label(r.target.clone(), joined);
            }
        }

        for r in &self.rules.replace {
            let old = instance.label(&r.source).to_string();
            let value = old.replace(r.old.as_str(), &r.new);
            if value != old {
                instance.set_label(r.target.clone(), value);
            }
        }

        for r in &self.rules.replace_regex {
            let old = instance.label(&r.source).to_string();
            if let Some(value) = r.apply(&old) {
                if !value.is_empty() && value != old {
                    instance.set_label(r.target.clone(), value);
                }
            }
        }

        for include in [
            &self.rules.include_equals,
            &self.rules.include_contains,
            &self.rules.include_regex,
        ] {
            if !include.is_empty() && instance.exportable() {
                let matched = include.iter().any(|r| matches_present(instance, r));
                instance.set_exportable(matched);
            }
        }

        for exclude in [
            &self.rules.exclude_equals,
            &self.rules.exclude_contains,
            &self.rules.exclude_regex,
        ] {
            if instance.exportable() && exclude.iter().any(|r| r.matcher.matches(instance.label(&r.label))) {
                instance.set_exportable(false);
            }
        }
    }

    fn map_values(&self, data: &mut Matrix) -> Result<(), PluginError> {
        for r in &self.rules.value_maps {
            let targets: Vec<(usize, Option<u8>)> = data
                .instances()
                .values()
                .map(|inst| (inst.index(), r.map(inst.label(&r.label))))
                .collect();
            let metric = data.metric_or_insert(&r.metric, MetricType::Uint8);
            if metric.property().is_empty() {
                metric.set_property(r.property());
            }
            for (idx, value) in targets {
                if let Some(v) = value {
                    metric.set_u8(idx, v)?;
                }
            }
        }
        Ok(())
    }
}

/// Include rules never match a label the instance does not carry.
fn matches_present(instance: &Instance, rule: &MatchRule) -> bool {
    instance.has_label(&rule.label) && rule.matcher.matches(instance.label(&rule.label))
}

impl Plugin for LabelAgent {
    fn name(&self) -> &str {
        "LabelAgent"
    }

    fn run(&mut self, data: &mut Matrix, _transport: &mut dyn Transport) -> Result<PluginOutput, PluginError> {
        for (_, instance) in data.instances_mut() {
            self.rewrite(instance);
        }
        self.map_values(data)?;
        Ok(PluginOutput::default())
    }
}
