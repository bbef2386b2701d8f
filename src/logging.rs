use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{fmt::time::ChronoUtc, FmtSubscriber};

use crate::settings::LoggingSettings;

/// Install the global subscriber, printing events that pass the configured filter.
pub fn configure(settings: LoggingSettings) -> Result<(), SetGlobalDefaultError> {
    let fmt_subscriber = FmtSubscriber::builder()
        .with_ansi(true)
        .with_timer(ChronoUtc::rfc3339())
        .with_env_filter(settings.filter)
        .finish();
    tracing::subscriber::set_global_default(fmt_subscriber)
}
