use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;

/// Logging setup for ngrpc processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_owned(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Map a `-v` count to a level: none → warn, 1 → info, 2 → debug, 3+ → trace.
    #[must_use]
    pub fn from_verbosity(verbose: u8, json: bool) -> Self {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        Self {
            level: level.to_owned(),
            json,
        }
    }

    fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .with_context(|| format!("invalid log level '{}'", self.level)),
        }
    }
}

/// Install the global tracing subscriber and route `log` records into it.
///
/// `RUST_LOG` overrides [`LoggingConfig::level`]. Output goes to stderr.
///
/// # Errors
/// Fails if the level directive is invalid or a global logger is already installed.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let filter = cfg.filter()?;

    let json_layer = cfg
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!cfg.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("a global tracing subscriber is already installed")?;
    tracing_log::LogTracer::init().context("a global log bridge is already installed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(LoggingConfig::from_verbosity(0, false).level, "warn");
        assert_eq!(LoggingConfig::from_verbosity(1, false).level, "info");
        assert_eq!(LoggingConfig::from_verbosity(2, true).level, "debug");
        assert_eq!(LoggingConfig::from_verbosity(9, false).level, "trace");
        assert!(LoggingConfig::from_verbosity(2, true).json);
    }

    #[test]
    fn rust_log_overrides_level() {
        temp_env::with_var("RUST_LOG", Some("ngrpc_host=trace"), || {
            let filter = LoggingConfig::default().filter().unwrap();
            assert_eq!(filter.to_string(), "ngrpc_host=trace");
        });
    }

    #[test]
    fn invalid_level_is_rejected() {
        temp_env::with_var_unset("RUST_LOG", || {
            let cfg = LoggingConfig {
                level: "ngrpc=loudest".to_owned(),
                json: false,
            };
            assert!(cfg.filter().is_err());
        });
    }
}
