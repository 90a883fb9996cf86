//! Logging macros for the test suites.
//!
//! Tests announce phases and assert through the runtime's own logger so a
//! failing concurrent test leaves a readable trace of what ran before it
//! fell over.

/// Logs the start of a named test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::observability::log(
            $crate::observability::LogLevel::Info,
            "test",
            format_args!("=== {} ===", $name),
        )
    };
}

/// Logs successful completion of a named test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::observability::log(
            $crate::observability::LogLevel::Info,
            "test",
            format_args!("=== {} complete ===", $name),
        )
    };
}

/// Asserts a condition, logging the expected and actual values either way.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $why:expr, $expected:expr, $actual:expr) => {
        if $cond {
            $crate::observability::log(
                $crate::observability::LogLevel::Debug,
                "test",
                format_args!("ok: {}", $why),
            );
        } else {
            $crate::observability::log(
                $crate::observability::LogLevel::Error,
                "test",
                format_args!(
                    "FAILED: {} (expected {:?}, actual {:?})",
                    $why, $expected, $actual
                ),
            );
            panic!("{}: expected {:?}, actual {:?}", $why, $expected, $actual);
        }
    };
}
