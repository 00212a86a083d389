//! Harvest poller core library
//!
//! The storage-agnostic core of a telemetry poller: a typed per-poll
//! counter [`matrix`], the arithmetic that turns raw counters into rates and
//! averages, a chain of post-processing [`plugins`], and rendering for
//! export. Transports are consumed through the narrow [`record::Transport`]
//! trait so the core never touches the network itself.
//!
//! # Usage
//!
//! ```rust
//! use harvest_poller::config::Config;
//! use harvest_poller::exporter::prometheus::render_all;
//! use harvest_poller::pipeline::Pipeline;
//! use harvest_poller::record::{Record, ReplayTransport};
//! use harvest_poller::template::Template;
//! use serde_json::json;
//!
//! let template = Template::from_yaml(
//!     "object: volume\nquery: api/storage/volumes\ncounters:\n  - ^^name => volume\n  - space.size => size (uint64)\n",
//! )
//! .unwrap();
//! let mut pipeline = Pipeline::new(template, &Config::default());
//!
//! let mut transport = ReplayTransport::new();
//! transport.insert(
//!     "api/storage/volumes",
//!     vec![Record::new(json!({"name": "vol1", "space": {"size": 1024}}))],
//! );
//! let out = pipeline.poll(&mut transport).unwrap();
//! assert!(render_all(&out.matrices).contains("volume_size{volume=\"vol1\"} 1024"));
//! ```

pub mod cli;
pub mod config;
pub mod exporter;
pub mod health_stats;
pub mod ingest;
pub mod matrix;
pub mod pipeline;
pub mod plugins;
pub mod record;
pub mod template;

// Re-export main types for convenience
pub use matrix::{ExportOptions, Instance, Matrix, MatrixError, Metric, MetricType};
pub use pipeline::{Metadata, Pipeline, PipelineError, PollOutput};
pub use record::{Record, Transport, TransportError};
pub use template::Template;
