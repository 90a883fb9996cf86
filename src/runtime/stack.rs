//! The per-fiber evaluation stack and its two unwinders.
//!
//! Frames are continuations, redeem frames (error + success handler),
//! finalizer markers, and the internal fold frame that captures a nested
//! exit during finalizer dispatch. Storage is a contiguous `Vec`, which
//! keeps push/pop O(1) amortized and deep programs off the host stack.

use crate::io::instr::{Cont, Instr, RawExit, opaque_err_render};

/// One entry on the evaluation stack.
pub(crate) enum Frame {
    /// A continuation awaiting the next produced value.
    Cont(Cont),
    /// An error handler and a success handler, installed by a redeem node.
    Redeem {
        /// Receives the typed error value when a failure unwinds to here.
        err: Cont,
        /// Receives the produced value on the success path.
        ok: Cont,
    },
    /// A pending finalizer, run on every exit path through its scope.
    Finalizer(Instr),
    /// Internal: capture the exit of the nested evaluation as a value.
    Fold,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cont(_) => f.write_str("Cont"),
            Self::Redeem { .. } => f.write_str("Redeem"),
            Self::Finalizer(_) => f.write_str("Finalizer"),
            Self::Fold => f.write_str("Fold"),
        }
    }
}

/// Result of unwinding on a typed failure.
pub(crate) enum ErrorUnwind {
    /// A handler was found; `finalizers` run first, innermost first.
    Handler {
        handler: Cont,
        finalizers: Vec<Instr>,
    },
    /// No handler: the stack is now empty and the failure is uncaught.
    Uncaught { finalizers: Vec<Instr> },
}

/// Result of unwinding on a defect.
pub(crate) enum InterruptUnwind {
    /// The whole stack was unwound.
    Empty { finalizers: Vec<Instr> },
    /// A fold frame bounded the unwind: the defect belongs to a nested
    /// finalizer evaluation, not the fiber.
    Fold { finalizers: Vec<Instr> },
}

/// The fiber's evaluation stack.
#[derive(Debug, Default)]
pub(crate) struct EvalStack {
    frames: Vec<Frame>,
}

impl EvalStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    /// Unwinds for a typed failure: stops at the nearest redeem (or fold)
    /// frame, collecting finalizers along the way and discarding plain
    /// continuations. If the result is `Uncaught`, the stack is empty.
    pub(crate) fn unwind_error(&mut self) -> ErrorUnwind {
        let mut finalizers = Vec::new();
        while let Some(frame) = self.frames.pop() {
            match frame {
                Frame::Redeem { err, .. } => {
                    return ErrorUnwind::Handler {
                        handler: err,
                        finalizers,
                    };
                }
                Frame::Fold => {
                    // A fold captures failures as values.
                    let handler: Cont = Box::new(|e| {
                        Instr::Pure(Box::new(RawExit::Failed(e, opaque_err_render())))
                    });
                    return ErrorUnwind::Handler {
                        handler,
                        finalizers,
                    };
                }
                Frame::Finalizer(fin) => finalizers.push(fin),
                Frame::Cont(_) => {}
            }
        }
        ErrorUnwind::Uncaught { finalizers }
    }

    /// Unwinds for a defect: pops everything, collecting finalizers and
    /// discarding error handlers. Stops early only at a fold frame, which
    /// bounds a nested finalizer evaluation.
    pub(crate) fn unwind_interrupt(&mut self) -> InterruptUnwind {
        let mut finalizers = Vec::new();
        while let Some(frame) = self.frames.pop() {
            match frame {
                Frame::Fold => return InterruptUnwind::Fold { finalizers },
                Frame::Finalizer(fin) => finalizers.push(fin),
                Frame::Cont(_) | Frame::Redeem { .. } => {}
            }
        }
        InterruptUnwind::Empty { finalizers }
    }
}
