//! Tracing initialization.
//!
//! One subscriber per process: a non-blocking rolling file layer, plus a
//! colored stdout layer in text mode. The executor's hot path logs under
//! [`TRACE_TARGET`]; `enable_tracing = false` silences that target while
//! leaving everything else at the configured level. An explicit
//! `RUST_LOG` always wins over the config file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

/// Target used by the dispatch/admission/retry hot path.
///
/// Scoping these events under one target lets operators raise or drop
/// the executor's verbosity independently of the rest of the process,
/// e.g. `RUST_LOG=info,FLOWGATE=trace`.
pub const TRACE_TARGET: &str = "FLOWGATE";

/// The filter directives implied by the config when `RUST_LOG` is unset.
fn filter_directives(config: &AppConfig) -> String {
    let mut directives = vec![config.log_level.clone()];
    if !config.enable_tracing {
        directives.push(format!("{TRACE_TARGET}=off"));
    }
    directives.join(",")
}

/// Map the configured rotation name; unknown names mean no rotation.
fn rotation(config: &AppConfig) -> Rotation {
    match config.rotation.as_str() {
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Install the process-wide subscriber. The returned guard owns the
/// background log writer; dropping it flushes and stops file logging.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let appender = RollingFileAppender::new(rotation(config), &config.log_dir, &config.log_file);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(config.use_json)
        .with_ansi(false);

    match config.use_json {
        true => tracing_subscriber::registry()
            .with(filter)
            .with(file_layer.json())
            .init(),
        false => tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(fmt::layer().compact().with_target(false).with_ansi(true))
            .init(),
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_respect_enable_tracing() {
        let mut config = AppConfig::default();
        config.log_level = "warn".to_string();
        assert_eq!(filter_directives(&config), "warn");

        config.enable_tracing = false;
        assert_eq!(filter_directives(&config), "warn,FLOWGATE=off");
    }

    #[test]
    fn test_unknown_rotation_falls_back_to_never() {
        let mut config = AppConfig::default();
        config.rotation = "weekly".to_string();
        assert_eq!(rotation(&config), Rotation::NEVER);
        config.rotation = "hourly".to_string();
        assert_eq!(rotation(&config), Rotation::HOURLY);
        config.rotation = "daily".to_string();
        assert_eq!(rotation(&config), Rotation::DAILY);
    }
}
