//! Logging, error reporting and metrics for the daemon.
//!
//! Logs go to stderr. Stdout carries the event status lines.

use crate::config::{Config, MetricsConfig};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const METRICS_PREFIX: &str = "bouncerd";

#[derive(thiserror::Error, Debug)]
enum MetricsInitError {
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Keeps the error reporting client alive; events are flushed on drop.
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

pub fn init(config: &Config) -> TelemetryGuard {
    let sentry = config.logging.as_ref().map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = sentry
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_layer)
        .init();

    if let Some(metrics) = &config.metrics
        && let Err(err) = init_metrics(metrics)
    {
        warn!(error = %err, "metrics disabled");
    }

    TelemetryGuard { _sentry: sentry }
}

fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsInitError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(METRICS_PREFIX))?;
    metrics::set_global_recorder(recorder).map_err(|_| MetricsInitError::AlreadyInstalled)?;

    shared::metrics_defs::describe_all(reconciler::metrics_defs::ALL_METRICS);
    Ok(())
}
