//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;

use coalesce_service::config::Config;
use coalesce_service::metrics;
use coalesce_service::quakes::QuakeClient;

use crate::logging;
use crate::output;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Prints one quake per line.
    Table,
    /// Prints all quakes as a JSON array.
    Json,
}

/// Lists the earthquakes of the past day.
///
/// The locations of recent quakes are looked up concurrently, with every detail document
/// downloaded at most once.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Overrides the log level from the configuration file.
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// The output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Only print the most recent quakes.
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    // SAFETY: No other threads have been spawned at this point.
    unsafe { logging::init_logging(&config) };

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        let hostname = config.metrics.hostname_tag.clone().and_then(|tag| {
            hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .map(|name| (tag, name))
        });
        tags.extend(hostname);
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    let client = QuakeClient::from_config(&config, runtime.handle().clone())
        .context("failed to create http client")?;
    let mut quakes = runtime
        .block_on(client.quakes())
        .context("failed to load quakes")?;
    tracing::info!(count = quakes.len(), "Loaded quakes");

    if let Some(limit) = cli.limit {
        quakes.truncate(limit);
    }

    match cli.format {
        OutputFormat::Table => output::print_table(&quakes),
        OutputFormat::Json => output::print_json(&quakes)?,
    }

    Ok(())
}
