//! Leveled logging on top of `tracing`.
//!
//! Three levels are exposed: `none`, `info` and `debug`. The level is chosen
//! once at startup and carried around in a [`Logger`] handle so it can be
//! forwarded to worker processes. Debug events are compiled out of release
//! builds by tracing's `release_max_level_info` feature.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing_subscriber::EnvFilter;

/// Verbosity of the process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize, Serialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Quiet.
    None,
    /// Standard messages.
    #[default]
    Info,
    /// Everything, including per-connection detail.
    Debug,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::None => "none",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        })
    }
}

/// Handle to the installed subscriber.
#[derive(Debug, Clone, Copy)]
pub struct Logger {
    level: LogLevel,
}

impl Logger {
    /// The level the subscriber was installed with.
    pub fn level(&self) -> LogLevel {
        self.level
    }
}

/// Install the global subscriber writing to stdout.
///
/// `RUST_LOG` overrides `level` when set.
pub fn init(level: LogLevel) -> Logger {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    Logger { level }
}

/// Install the global subscriber writing to stderr, for programs whose
/// stdout carries data.
pub fn init_stderr(level: LogLevel) -> Logger {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Logger { level }
}

/// A handle for code paths that run without installing a subscriber, such as
/// tests driving the server in-process.
pub fn detached(level: LogLevel) -> Logger {
    Logger { level }
}
