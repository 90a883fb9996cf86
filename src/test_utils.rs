//! Shared helpers for the test suites.

use crate::observability::{self, LogLevel};
use std::sync::Once;

/// Initializes test logging once per process.
///
/// The level defaults to `Info`; set `FILAMENT_TEST_LOG` to `trace`,
/// `debug`, `warn`, or `off` to change it.
pub fn init_test_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let level = match std::env::var("FILAMENT_TEST_LOG").ok().as_deref() {
            Some("trace") => LogLevel::Trace,
            Some("debug") => LogLevel::Debug,
            Some("warn") => LogLevel::Warn,
            Some("off") => LogLevel::Off,
            _ => LogLevel::Info,
        };
        observability::set_min_level(level);
    });
}
