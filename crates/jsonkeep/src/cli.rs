//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jsonkeep_service::config::Config;
use jsonkeep_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// jsonkeep commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the web server.
    #[command(name = "run")]
    Run,

    /// Check the health of a running server.
    #[command(name = "healthcheck")]
    Healthcheck {
        /// The address of the server, defaults to the configured bind address.
        #[arg(long, value_name = "ADDR")]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "jsonkeep", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
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
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(concat!("jsonkeep@", env!("CARGO_PKG_VERSION")).into()),
        ..Default::default()
    });

    // SAFETY: we are still single-threaded at this point, no runtime has been started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            } else {
                tracing::error!("could not read host name");
            }
        }

        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to set up metrics")?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Healthcheck { addr, timeout } => healthcheck::healthcheck(config, addr, timeout)?,
    }

    Ok(())
}
