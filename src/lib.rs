//! Filament: a fiber-based interpreter runtime for `IO` effect descriptions.
//!
//! # Overview
//!
//! A program is a value of [`IO<E, A>`]: an inert description that produces
//! an `A`, fails with a typed `E`, or is terminated by a [`Defect`]. The
//! [`Runtime`] executes descriptions on fibers: cooperatively scheduled,
//! independently interruptible units of work, each with its own evaluation
//! stack, finalizer discipline, and supervision state.
//!
//! # Core Guarantees
//!
//! - **Exactly-once finalizers**: an [`ensuring`](IO::ensuring) finalizer
//!   runs once on every exit path - success, failure, termination, or
//!   interrupt
//! - **Latched interruption**: once requested, an interrupt is never lost;
//!   [`uninterruptible`](IO::uninterruptible) regions defer it to the next
//!   interruptible point
//! - **Typed errors stay typed**: failures unwind to the nearest
//!   [`redeem`](IO::redeem) handler; defects bypass user handlers and are
//!   always reported to the unhandled handler
//! - **Stack safety**: deep sequences evaluate iteratively, and fibers
//!   yield their worker thread after a configurable operation budget
//!
//! # Module Structure
//!
//! - [`io`]: the `IO` description type and its combinators
//! - [`runtime`]: the fiber interpreter, scheduler pools, and [`Runtime`]
//! - [`types`]: outcomes ([`Exit`], [`Defect`]) and configuration
//! - [`observability`]: the runtime's minimal structured logger
//!
//! # Example
//!
//! ```
//! use filament::{IO, Never, Runtime};
//! use std::time::Duration;
//!
//! let rts = Runtime::new();
//! let program = IO::<Never, i32>::sync(|| 20).flat_map(|n| IO::now(n + 22));
//! assert_eq!(rts.run(program), Ok(42));
//! let _ = rts.shutdown_and_wait(Duration::from_secs(5));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod io;
pub mod observability;
pub mod runtime;
pub mod types;

// Test-only modules.
#[cfg(any(test, feature = "test-internals"))]
pub mod test_logging;
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to the core types.
pub use crate::io::{Async, AsyncCallback, Canceler, CancelerIo, Handler, IO};
pub use crate::runtime::{Fiber, Runtime};
pub use crate::types::{Defect, DefectOrigin, Exit, FiberError, Never, RtsConfig};
