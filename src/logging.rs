//! Process-wide `tracing` subscriber setup.

use crate::config::LoggingConfig;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

/// Install a global fmt (or JSON) subscriber at `config.level`.
///
/// Returns `false` when a global subscriber was already installed, in which
/// case nothing changes. Safe to call from every test.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = LevelFilter::from_level(config.level.into());

    let result = if config.json_format {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.include_targets)
                    .flatten_event(true)
                    .with_filter(filter),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(config.include_targets)
                    .with_filter(filter),
            )
            .try_init()
    };

    match result {
        Ok(()) => {
            tracing::debug!("🔧 Tracing initialized at {:?}", config.level);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_second_init_is_a_no_op() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            ..Default::default()
        };

        // Another test may have installed one first
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
        assert!(!init_tracing(&LoggingConfig {
            json_format: true,
            ..config
        }));
    }
}
