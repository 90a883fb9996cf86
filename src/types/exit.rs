//! Fiber outcome types.
//!
//! Every fiber resolves to an [`Exit`]: it completed with a value, failed
//! with a typed error, or was terminated by a [`Defect`]. Typed failures are
//! recoverable through `redeem`; defects bypass user error handlers and are
//! always reported to the unhandled handler.

use core::fmt;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// The result of running a fiber to completion.
///
/// `Failed` is raised only by the fail constructor; `Terminated` arises from
/// explicit termination, panics caught inside the interpreter, and
/// interruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit<E, A> {
    /// The fiber produced a value.
    Completed(A),
    /// The fiber failed with a typed, recoverable error.
    Failed(E),
    /// The fiber was terminated by an unrecoverable defect.
    Terminated(Defect),
}

impl<E, A> Exit<E, A> {
    /// Returns true if the fiber completed with a value.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Returns true if the fiber failed with a typed error.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true if the fiber was terminated by a defect.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }

    /// Returns the completed value, if any.
    pub fn completed(self) -> Option<A> {
        match self {
            Self::Completed(a) => Some(a),
            _ => None,
        }
    }

    /// Maps the completed value, leaving failures and defects untouched.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Self::Completed(a) => Exit::Completed(f(a)),
            Self::Failed(e) => Exit::Failed(e),
            Self::Terminated(d) => Exit::Terminated(d),
        }
    }

    /// Maps the typed error, leaving values and defects untouched.
    pub fn map_err<E2>(self, f: impl FnOnce(E) -> E2) -> Exit<E2, A> {
        match self {
            Self::Completed(a) => Exit::Completed(a),
            Self::Failed(e) => Exit::Failed(f(e)),
            Self::Terminated(d) => Exit::Terminated(d),
        }
    }

    /// Converts the exit into a `Result`, folding both failure shapes into
    /// [`FiberError`].
    pub fn into_result(self) -> Result<A, FiberError<E>> {
        match self {
            Self::Completed(a) => Ok(a),
            Self::Failed(e) => Err(FiberError::Failed(e)),
            Self::Terminated(d) => Err(FiberError::Terminated(d)),
        }
    }
}

/// How a defect came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefectOrigin {
    /// Constructed directly by user or runtime code.
    Explicit,
    /// Recovered from a panic caught inside the interpreter.
    Panic,
    /// Wraps a typed failure that reached the top of a fiber uncaught.
    UncaughtFailure,
}

/// An untyped, unrecoverable cause of fiber termination.
///
/// Defects are cheap to clone; the same cause is shared between the fiber's
/// exit, its killers, and the unhandled-handler report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defect {
    origin: DefectOrigin,
    message: Arc<str>,
}

impl Defect {
    /// Creates a defect with an explicit message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            origin: DefectOrigin::Explicit,
            message: Arc::from(message.into()),
        }
    }

    /// Recovers a defect from a panic payload.
    ///
    /// Standard `&str` and `String` payloads keep their message; anything
    /// else is summarized opaquely.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            origin: DefectOrigin::Panic,
            message: Arc::from(message),
        }
    }

    /// Wraps the rendering of a typed failure that no handler caught.
    #[must_use]
    pub fn uncaught_failure(rendered: String) -> Self {
        Self {
            origin: DefectOrigin::UncaughtFailure,
            message: Arc::from(rendered),
        }
    }

    pub(crate) fn value_confusion(expected: &'static str) -> Self {
        Self::new(format!(
            "internal value confusion: expected {expected} on the evaluation stack"
        ))
    }

    /// Returns how the defect originated.
    #[must_use]
    pub const fn origin(&self) -> DefectOrigin {
        self.origin
    }

    /// Returns the defect message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            DefectOrigin::Explicit => write!(f, "{}", self.message),
            DefectOrigin::Panic => write!(f, "panic: {}", self.message),
            DefectOrigin::UncaughtFailure => write!(f, "uncaught failure: {}", self.message),
        }
    }
}

/// Host-facing error returned when a blocking run does not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiberError<E> {
    /// The fiber failed with a typed error that no handler caught.
    #[error("fiber completed with a typed failure")]
    Failed(E),
    /// The fiber was terminated by a defect.
    #[error("fiber terminated: {0}")]
    Terminated(Defect),
}
