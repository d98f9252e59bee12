mod config;

use clap::{Args, Parser};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use idempotency::config::ValidationError;
use idempotency::errors::GatewayError;
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(version, about = "Idempotency gateway for mutating HTTP requests")]
enum CliCommand {
    /// Serve traffic
    Run(ConfigArgs),
    /// Load and validate the config file, then exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, default_value = "gateway.yaml")]
    config_file: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

fn main() -> Result<(), CliError> {
    let cli = CliCommand::parse();

    match cli {
        CliCommand::CheckConfig(args) => {
            let config = Config::from_file(&args.config_file)?;
            config.gateway.validate()?;
            println!("{}: ok", args.config_file.display());
            Ok(())
        }
        CliCommand::Run(args) => {
            let config = Config::from_file(&args.config_file)?;
            config.gateway.validate()?;

            let _sentry = init_logging(config.common.logging.as_ref());
            if let Some(metrics_config) = &config.common.metrics {
                init_metrics(metrics_config)?;
            }

            tracing::info!(config_file = %args.config_file.display(), "starting gateway");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(idempotency::run(config.gateway))?;
            Ok(())
        }
    }
}

// The returned guard flushes pending Sentry events when dropped.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let logging = logging.cloned().unwrap_or_default();

    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = if logging.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(metrics_config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(metrics_config.statsd_host.clone(), metrics_config.statsd_port)
        .build(Some(&metrics_config.prefix))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe_all(idempotency::metrics_defs::ALL_METRICS);
    Ok(())
}
