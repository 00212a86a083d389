//! harvest-poller - version 0.1.0
//!
//! Replays recorded storage API responses through one object's pipeline and
//! prints the Prometheus exposition of every poll.

use anyhow::{bail, Context, Result};
use clap::Parser;
use harvest_poller::cli::{Args, LogLevel};
use harvest_poller::config::{resolve_config, show_config, validate_effective_config, Config};
use harvest_poller::exporter::prometheus::render_all;
use harvest_poller::health_stats::CollectorHealth;
use harvest_poller::pipeline::Pipeline;
use harvest_poller::record::{load_records, ReplayTransport};
use harvest_poller::template::Template;
use tracing::{debug, info, Level};

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(args: &Args) {
    let log_level = match args.log_level {
        LogLevel::Off => return,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {:?}", args.log_level);
}

fn load_template(args: &Args) -> Result<Template> {
    let Some(path) = &args.template else {
        bail!("--template is required");
    };
    Template::load(path).with_context(|| format!("loading template {}", path.display()))
}

/// Recordings for the endpoint and plugin queries.
fn load_aux(args: &Args) -> Result<ReplayTransport> {
    let mut transport = ReplayTransport::new();
    for (api_path, file) in &args.aux {
        let records = load_records(file).with_context(|| format!("loading recording {}", file.display()))?;
        debug!(api_path = %api_path, records = records.len(), "auxiliary recording");
        transport.insert(api_path.clone(), records);
    }
    Ok(transport)
}

fn run(args: &Args, config: &Config) -> Result<()> {
    let template = load_template(args)?;
    let mut pipeline = Pipeline::new(template, config);
    let mut health = CollectorHealth::new(config.poller_name()).context("registering health metrics")?;

    for (i, file) in args.polls.iter().enumerate() {
        let poll = i + 1;
        let records = load_records(file).with_context(|| format!("loading poll {}", file.display()))?;
        let partial = args.partial_poll == Some(poll);

        let mut transport = load_aux(args)?;
        // Recorded polls are spaced by the configured interval
        let timestamp = (poll as u64 * args.interval) as f64;
        let out = pipeline
            .poll_records(&records, partial, &mut transport, Some(timestamp))
            .with_context(|| format!("poll {poll} of {}", pipeline.object()))?;

        println!("# poll {poll} ({})", file.display());
        print!("{}", render_all(&out.matrices));
        health.record(&out.metadata);
    }

    if !args.disable_health {
        print!("{}", health.encode());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = resolve_config(&args)?;

    if args.check_config {
        if let Err(e) = validate_effective_config(&config) {
            eprintln!("❌ Configuration invalid: {}", e);
            std::process::exit(1);
        }
        if args.template.is_some() {
            if let Err(e) = load_template(&args) {
                eprintln!("❌ Template invalid: {:#}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Configuration is valid");
        return Ok(());
    }

    if args.show_config {
        return show_config(&config, args.config_format);
    }

    setup_logging(&args);
    validate_effective_config(&config)?;
    run(&args, &config)
}
