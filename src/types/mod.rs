//! Core types for the filament runtime.
//!
//! - [`exit`]: fiber outcomes ([`Exit`]), defects, and host-facing errors
//! - [`config`]: runtime tuning knobs ([`RtsConfig`])

pub mod config;
pub mod exit;

pub use self::config::{
    DEFAULT_MAX_RESUMPTION_DEPTH, DEFAULT_YIELD_MAX_OP_COUNT, RtsConfig, default_pool_size,
};
pub use self::exit::{Defect, DefectOrigin, Exit, FiberError};

/// The uninhabited error type for effects that cannot fail.
pub type Never = std::convert::Infallible;
