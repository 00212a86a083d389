//! Configuration management for harvest-poller.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats.

use crate::cli::{Args, ConfigFormat};
use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_POLLER_NAME: &str = "local";
/// Minimum ops per second below which a latency is reported as zero.
pub const DEFAULT_LATENCY_IO_REQD: u32 = 10;

/// Poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Poller name, attached as the `poller` label to health metrics
    pub poller: Option<String>,

    /// Global labels attached to every exported instance
    pub datacenter: Option<String>,
    pub cluster: Option<String>,
    #[serde(alias = "global-labels")]
    pub global_labels: Option<BTreeMap<String, String>>,

    // Arithmetic
    #[serde(alias = "latency-io-reqd")]
    pub latency_io_reqd: Option<u32>,
    #[serde(alias = "allow-partial-aggregation")]
    pub allow_partial_aggregation: Option<bool>,

    // Logging
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poller: Some(DEFAULT_POLLER_NAME.into()),
            datacenter: None,
            cluster: None,
            global_labels: None,
            latency_io_reqd: Some(DEFAULT_LATENCY_IO_REQD),
            allow_partial_aggregation: Some(false),
            log_level: Some("info".into()),
        }
    }
}

impl Config {
    pub fn poller_name(&self) -> &str {
        self.poller.as_deref().unwrap_or(DEFAULT_POLLER_NAME)
    }

    pub fn latency_io_reqd(&self) -> u32 {
        self.latency_io_reqd.unwrap_or(DEFAULT_LATENCY_IO_REQD)
    }

    pub fn allow_partial_aggregation(&self) -> bool {
        self.allow_partial_aggregation.unwrap_or(false)
    }

    /// Effective global labels: `datacenter` and `cluster` plus the explicit
    /// map, which wins on conflict.
    pub fn global_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        if let Some(dc) = &self.datacenter {
            labels.insert("datacenter".to_string(), dc.clone());
        }
        if let Some(cluster) = &self.cluster {
            labels.insert("cluster".to_string(), cluster.clone());
        }
        if let Some(extra) = &self.global_labels {
            for (k, v) in extra {
                labels.insert(k.clone(), v.clone());
            }
        }
        labels
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<()> {
    if cfg.poller_name().trim().is_empty() {
        bail!("poller name must not be empty");
    }

    if let Some(level) = cfg.log_level.as_deref() {
        match level.to_ascii_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => {}
            other => bail!(
                "Invalid log_level '{}', expected off/error/warn/info/debug/trace",
                other
            ),
        }
    }

    if let Some(labels) = &cfg.global_labels {
        for name in labels.keys() {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit());
            if !valid {
                bail!("Invalid global label name '{}'", name);
            }
        }
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if let Some(poller) = &args.poller {
        config.poller = Some(poller.clone());
    }
    if let Some(dc) = &args.datacenter {
        config.datacenter = Some(dc.clone());
    }
    if let Some(n) = args.latency_io_reqd {
        config.latency_io_reqd = Some(n);
    }
    if args.allow_partial_aggregation {
        config.allow_partial_aggregation = Some(true);
    }

    Ok(config)
}

/// Loads a config file, picking the format from its extension. A missing
/// path falls back to the default locations, then to defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = if let Some(p) = path {
        PathBuf::from(p)
    } else {
        let defaults = [
            "/etc/harvest/poller.yaml",
            "/etc/harvest/poller.yml",
            "./harvest-poller.yaml",
            "./harvest-poller.yml",
            "./harvest-poller.json",
        ];

        match defaults.iter().find(|p| Path::new(p).exists()) {
            Some(p) => PathBuf::from(p),
            None => return Ok(Config::default()),
        }
    };

    if !path.exists() {
        bail!("config file not found: {}", path.display());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("parsing JSON config {}", path.display()))?,
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("parsing TOML config {}", path.display()))?,
        // Default to YAML
        _ => serde_yaml::from_str(&content)
            .with_context(|| format!("parsing YAML config {}", path.display()))?,
    };
    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

/// Renders configuration in the requested format.
pub fn render_config(config: &Config, format: ConfigFormat) -> Result<String> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };
    Ok(output)
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<()> {
    println!("{}", render_config(config, format)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml() {
        let f = write_temp(
            ".yaml",
            "poller: cluster-01\ndatacenter: dc1\nlatency_io_reqd: 5\nglobal_labels:\n  site: east\n",
        );
        let cfg = load_config(Some(f.path())).unwrap();
        assert_eq!(cfg.poller_name(), "cluster-01");
        assert_eq!(cfg.latency_io_reqd(), 5);
        let labels = cfg.global_labels();
        assert_eq!(labels["datacenter"], "dc1");
        assert_eq!(labels["site"], "east");
    }

    #[test]
    fn test_load_json_and_toml() {
        let f = write_temp(".json", r#"{"poller": "p1", "allow_partial_aggregation": true}"#);
        let cfg = load_config(Some(f.path())).unwrap();
        assert!(cfg.allow_partial_aggregation());
        assert_eq!(cfg.latency_io_reqd(), DEFAULT_LATENCY_IO_REQD);

        let f = write_temp(".toml", "poller = \"p2\"\ncluster = \"c2\"\n");
        let cfg = load_config(Some(f.path())).unwrap();
        assert_eq!(cfg.poller_name(), "p2");
        assert_eq!(cfg.global_labels()["cluster"], "c2");
    }

    #[test]
    fn test_validate() {
        assert!(validate_effective_config(&Config::default()).is_ok());

        let cfg = Config {
            poller: Some(" ".into()),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());

        let mut labels = BTreeMap::new();
        labels.insert("bad-name".to_string(), "x".to_string());
        let cfg = Config {
            global_labels: Some(labels),
            ..Config::default()
        };
        assert!(validate_effective_config(&cfg).is_err());
    }

    #[test]
    fn test_render_round_trips_through_yaml() {
        let text = render_config(&Config::default(), ConfigFormat::Yaml).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.poller_name(), DEFAULT_POLLER_NAME);
    }
}
