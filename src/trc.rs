//! Tracing configuration and initialization.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

/// Environment variable holding the log filter. `RUST_LOG` is consulted when it is unset.
pub const LOG_ENV: &str = "DRIVEFS_LOG";

enum TrcMode {
    /// Plain, verbose output with span timings. Picked whenever the user sets a filter.
    Plain,
    /// Compact output that plays nicely with progress spinners.
    Pretty,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            // Someone asking for a specific filter is debugging and wants every line verbatim.
            Ok(env_filter) => Self {
                mode: TrcMode::Plain,
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Pretty,
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    pub fn init(self) -> Result<(), TryInitError> {
        match self.mode {
            TrcMode::Plain => tracing_subscriber::fmt()
                .with_env_filter(self.env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr)
                .finish()
                .try_init(),
            TrcMode::Pretty => {
                let indicatif_layer = IndicatifLayer::new();
                tracing_subscriber::registry()
                    .with(self.env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(indicatif_layer.get_stderr_writer())
                            .with_target(false)
                            .without_time()
                            .compact(),
                    )
                    .with(indicatif_layer)
                    .try_init()
            }
        }
    }
}
