//! Minimal structured logging for the runtime.
//!
//! The runtime reports through a small hand-rolled logger rather than a
//! logging facade: a global maximum level and line-oriented stderr output.
//! The default unhandled-defect handler writes through [`log`].

pub mod level;

pub use self::level::LogLevel;

use std::sync::atomic::{AtomicU8, Ordering};

static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

/// Sets the minimum severity that is emitted.
pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Returns the minimum severity that is emitted.
#[must_use]
pub fn min_level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

/// Returns true if entries at `level` are currently emitted.
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level.is_at_least(min_level())
}

/// Writes a log line if `level` passes the global filter.
///
/// `target` names the runtime component (for example `"fiber"` or `"rts"`).
pub fn log(level: LogLevel, target: &str, args: std::fmt::Arguments<'_>) {
    if enabled(level) {
        eprintln!("{:5} filament::{target}: {args}", level.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_respects_min_level() {
        let previous = min_level();
        set_min_level(LogLevel::Warn);
        assert!(enabled(LogLevel::Error));
        assert!(enabled(LogLevel::Warn));
        assert!(!enabled(LogLevel::Info));
        set_min_level(previous);
    }

    #[test]
    fn off_is_never_enabled() {
        let previous = min_level();
        set_min_level(LogLevel::Trace);
        assert!(!enabled(LogLevel::Off));
        set_min_level(previous);
    }
}
