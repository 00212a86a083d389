//! Typed object templates.
//!
//! A template names the object, the query that fetches it, its counters and
//! the plugin chain that post-processes it. Counters use the compact grammar
//! `name [=> display] [(type)]`, where a `^` prefix makes the counter a label
//! and `^^` a label that is also part of the instance key. Perf counters may
//! instead be given as a map carrying their property and denominator.

use crate::matrix::{ExportOptions, MatrixError, MetricType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

static COUNTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\^{0,2})\s*([^\s=()]+)\s*(?:=>\s*([^\s()]+))?\s*(?:\(\s*(\w+)\s*\))?$")
        .expect("counter grammar regex")
});

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid counter [{0}]")]
    InvalidCounter(String),

    #[error("counter [{counter}]: {source}")]
    InvalidType {
        counter: String,
        #[source]
        source: MatrixError,
    },

    #[error("invalid property [{0}]")]
    InvalidProperty(String),

    #[error("invalid plugin entry: {0}")]
    InvalidPlugin(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How a perf counter is cooked between two polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Property {
    #[default]
    Raw,
    Rate,
    Delta,
    Average,
    Percent,
    /// Textual counter, never cooked.
    String,
}

impl FromStr for Property {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "raw" => Ok(Property::Raw),
            "rate" => Ok(Property::Rate),
            "delta" => Ok(Property::Delta),
            "average" => Ok(Property::Average),
            "percent" => Ok(Property::Percent),
            "string" => Ok(Property::String),
            other => Err(TemplateError::InvalidProperty(other.to_string())),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Property::Raw => "raw",
            Property::Rate => "rate",
            Property::Delta => "delta",
            Property::Average => "average",
            Property::Percent => "percent",
            Property::String => "string",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Label,
    /// Label that is also a component of the instance key.
    KeyLabel,
    Metric(MetricType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    /// Record path the value is read from.
    pub name: String,
    /// Label or metric key in the matrix.
    pub display: String,
    pub kind: CounterKind,
    pub property: Property,
    pub denominator: Option<String>,
}

impl Counter {
    /// Parses `[^|^^]name [=> display] [(type)]`.
    pub fn parse(s: &str) -> Result<Self, TemplateError> {
        let caps = COUNTER_RE
            .captures(s.trim())
            .ok_or_else(|| TemplateError::InvalidCounter(s.to_string()))?;
        let prefix = caps.get(1).map_or("", |m| m.as_str());
        let name = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| TemplateError::InvalidCounter(s.to_string()))?;
        let display = caps
            .get(3)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| default_display(&name));

        let kind = match prefix {
            "^^" => CounterKind::KeyLabel,
            "^" => CounterKind::Label,
            _ => {
                let metric_type = match caps.get(4) {
                    Some(t) => t.as_str().parse::<MetricType>().map_err(|source| {
                        TemplateError::InvalidType {
                            counter: name.clone(),
                            source,
                        }
                    })?,
                    None => MetricType::Float64,
                };
                CounterKind::Metric(metric_type)
            }
        };

        Ok(Self {
            name,
            display,
            kind,
            property: Property::Raw,
            denominator: None,
        })
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, CounterKind::Label | CounterKind::KeyLabel)
    }
}

fn default_display(name: &str) -> String {
    name.split('.')
        .filter(|s| *s != "#")
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCounter {
    Short(String),
    Detailed {
        name: String,
        display: Option<String>,
        #[serde(rename = "type")]
        metric_type: Option<String>,
        property: Option<String>,
        denominator: Option<String>,
    },
}

impl RawCounter {
    fn into_counter(self) -> Result<Counter, TemplateError> {
        match self {
            RawCounter::Short(s) => Counter::parse(&s),
            RawCounter::Detailed {
                name,
                display,
                metric_type,
                property,
                denominator,
            } => {
                let mut counter = Counter::parse(&name)?;
                if let Some(d) = display {
                    counter.display = d;
                }
                if let (Some(t), CounterKind::Metric(_)) = (metric_type, counter.kind) {
                    let parsed = t.parse::<MetricType>().map_err(|source| TemplateError::InvalidType {
                        counter: counter.name.clone(),
                        source,
                    })?;
                    counter.kind = CounterKind::Metric(parsed);
                }
                if let Some(p) = property {
                    counter.property = p.parse()?;
                }
                counter.denominator = denominator.filter(|d| !d.is_empty());
                Ok(counter)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    query: String,
    #[serde(default)]
    counters: Vec<RawCounter>,
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    #[serde(default)]
    name: String,
    object: String,
    query: String,
    #[serde(default)]
    counters: Vec<RawCounter>,
    #[serde(default)]
    endpoints: Vec<RawEndpoint>,
    export_options: Option<ExportOptions>,
    #[serde(default)]
    plugins: Vec<serde_yaml::Value>,
}

/// Auxiliary query whose counters are merged into the same matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub query: String,
    pub counters: Vec<Counter>,
}

/// One entry of the plugin chain.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSpec {
    pub name: String,
    pub params: serde_yaml::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub object: String,
    pub query: String,
    pub counters: Vec<Counter>,
    pub endpoints: Vec<Endpoint>,
    pub export_options: Option<ExportOptions>,
    pub plugins: Vec<PluginSpec>,
}

impl Template {
    pub fn from_yaml(content: &str) -> Result<Self, TemplateError> {
        let raw: RawTemplate = serde_yaml::from_str(content)?;
        let counters = raw
            .counters
            .into_iter()
            .map(RawCounter::into_counter)
            .collect::<Result<Vec<_>, _>>()?;
        let endpoints = raw
            .endpoints
            .into_iter()
            .map(|e| {
                Ok(Endpoint {
                    query: e.query,
                    counters: e
                        .counters
                        .into_iter()
                        .map(RawCounter::into_counter)
                        .collect::<Result<Vec<_>, TemplateError>>()?,
                })
            })
            .collect::<Result<Vec<_>, TemplateError>>()?;
        let plugins = raw
            .plugins
            .into_iter()
            .map(plugin_spec)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: if raw.name.is_empty() {
                raw.object.clone()
            } else {
                raw.name
            },
            object: raw.object,
            query: raw.query,
            counters,
            endpoints,
            export_options: raw.export_options,
            plugins,
        })
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Display names of the `^^` counters, in declaration order.
    pub fn instance_keys(&self) -> Vec<String> {
        self.counters
            .iter()
            .filter(|c| c.kind == CounterKind::KeyLabel)
            .map(|c| c.display.clone())
            .collect()
    }

    /// True when any counter needs cooking across polls.
    pub fn is_perf(&self) -> bool {
        self.counters
            .iter()
            .any(|c| !matches!(c.property, Property::Raw | Property::String))
    }
}

fn plugin_spec(value: serde_yaml::Value) -> Result<PluginSpec, TemplateError> {
    match value {
        serde_yaml::Value::String(name) => Ok(PluginSpec {
            name,
            params: serde_yaml::Value::Null,
        }),
        serde_yaml::Value::Mapping(map) if map.len() == 1 => {
            let (k, v) = map
                .into_iter()
                .next()
                .ok_or_else(|| TemplateError::InvalidPlugin("empty mapping".into()))?;
            let name = k
                .as_str()
                .ok_or_else(|| TemplateError::InvalidPlugin(format!("{k:?}")))?
                .to_string();
            Ok(PluginSpec { name, params: v })
        }
        other => Err(TemplateError::InvalidPlugin(format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_grammar() {
        let c = Counter::parse("^^svm.name => svm").unwrap();
        assert_eq!(c.kind, CounterKind::KeyLabel);
        assert_eq!(c.name, "svm.name");
        assert_eq!(c.display, "svm");

        let c = Counter::parse("^style").unwrap();
        assert_eq!(c.kind, CounterKind::Label);
        assert_eq!(c.display, "style");

        let c = Counter::parse("space.used => size_used (uint64)").unwrap();
        assert_eq!(c.kind, CounterKind::Metric(MetricType::Uint64));
        assert_eq!(c.display, "size_used");

        let c = Counter::parse("statistics.iops_raw.read").unwrap();
        assert_eq!(c.kind, CounterKind::Metric(MetricType::Float64));
        assert_eq!(c.display, "statistics_iops_raw_read");

        assert!(matches!(
            Counter::parse("size (decimal)"),
            Err(TemplateError::InvalidType { .. })
        ));
        assert!(Counter::parse("a => b => c").is_err());
    }

    #[test]
    fn test_template_yaml() {
        let yaml = r#"
name: Volume
object: volume
query: api/storage/volumes
counters:
  - ^^svm.name => svm
  - ^^name => volume
  - ^style
  - name: read_latency
    property: average
    denominator: read_ops
  - name: read_ops
    property: rate
endpoints:
  - query: api/private/cli/volume
    counters:
      - ^^vserver => svm
      - ^^volume
      - ^is_sis_volume
export_options:
  instance_keys:
    - svm
    - volume
plugins:
  - LabelAgent:
      exclude_equals:
        - volume `vol0`
  - FlexGroup
"#;
        let t = Template::from_yaml(yaml).unwrap();
        assert_eq!(t.object, "volume");
        assert_eq!(t.instance_keys(), vec!["svm", "volume"]);
        assert!(t.is_perf());
        assert_eq!(t.counters[3].property, Property::Average);
        assert_eq!(t.counters[3].denominator.as_deref(), Some("read_ops"));
        assert_eq!(t.endpoints[0].counters.len(), 3);
        let opts = t.export_options.unwrap();
        assert!(!opts.include_all_labels);
        assert_eq!(t.plugins.len(), 2);
        assert_eq!(t.plugins[0].name, "LabelAgent");
        assert_eq!(t.plugins[1].name, "FlexGroup");
        assert!(t.plugins[1].params.is_null());
    }
}
