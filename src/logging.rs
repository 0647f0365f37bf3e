use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::settings::{LogFormat, Settings};

/// Overrides `log_level` from settings, e.g. `LEDGERSYNC_LOG=ledgersync=debug`.
pub const LOG_ENV: &str = "LEDGERSYNC_LOG";

pub fn init(settings: &Settings) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    // try_init: a second call (tests, re-entry) keeps the first subscriber.
    let _ = match settings.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_file(true)
                    .with_line_number(true)
                    .json()
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init(),
    };
}
