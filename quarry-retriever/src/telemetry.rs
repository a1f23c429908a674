//! Log output for hosts embedding the engine.
//!
//! The library only emits `tracing` events; nothing is printed until the host installs a
//! subscriber, typically by calling [`init_tracing`] once at startup.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `quarry_retriever=debug`
    pub level: String,
    pub show_target: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_target: true,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => Ok(EnvFilter::try_new(&self.level)?),
        }
    }
}

/// Install a global fmt subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed (by an earlier call or a
/// test harness); that is not an error.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(config.filter()?)
        .with_target(config.show_target)
        .with_ansi(config.ansi)
        .try_init()
        .is_ok();
    Ok(installed)
}
