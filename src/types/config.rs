//! Runtime configuration knobs.

use crate::io::UnhandledFn;

/// Default cooperative yield budget: operations per evaluator invocation.
pub const DEFAULT_YIELD_MAX_OP_COUNT: u32 = 1 << 20;

/// Default cap on inline async resumption nesting.
pub const DEFAULT_MAX_RESUMPTION_DEPTH: u32 = 10;

/// Tuning knobs for a [`Runtime`](crate::runtime::Runtime).
///
/// Defaults: a yield budget of 2^20 operations, an inline resumption cap
/// of 10, and a worker pool sized to `max(2, cores)`.
#[derive(Clone)]
pub struct RtsConfig {
    /// Operations a fiber may execute before yielding its worker thread.
    pub yield_max_op_count: u32,
    /// Nesting depth beyond which async resumptions are resubmitted to the
    /// pool instead of run inline.
    pub max_resumption_depth: u32,
    /// Number of worker threads in the fiber pool.
    pub thread_pool_size: usize,
    /// Number of threads servicing delayed submissions. Fixed at one.
    pub scheduled_pool_size: usize,
    pub(crate) unhandled: Option<UnhandledFn>,
}

impl RtsConfig {
    /// Creates a configuration with the default knobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cooperative yield budget.
    #[must_use]
    pub fn with_yield_max_op_count(mut self, ops: u32) -> Self {
        self.yield_max_op_count = ops.max(1);
        self
    }

    /// Sets the inline async resumption cap.
    #[must_use]
    pub fn with_max_resumption_depth(mut self, depth: u32) -> Self {
        self.max_resumption_depth = depth;
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size.max(1);
        self
    }

    /// Replaces the default unhandled-defect handler.
    ///
    /// The handler receives every defect that escapes a fiber (uncaught
    /// failures, terminations, finalizer defects) and returns an effect that
    /// is run on a fresh fiber.
    #[must_use]
    pub fn with_unhandled_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(crate::types::Defect) -> crate::io::IO<crate::types::Never, ()>
            + Send
            + Sync
            + 'static,
    {
        self.unhandled = Some(std::sync::Arc::new(move |defect| handler(defect).into_instr()));
        self
    }
}

impl Default for RtsConfig {
    fn default() -> Self {
        Self {
            yield_max_op_count: DEFAULT_YIELD_MAX_OP_COUNT,
            max_resumption_depth: DEFAULT_MAX_RESUMPTION_DEPTH,
            thread_pool_size: default_pool_size(),
            scheduled_pool_size: 1,
            unhandled: None,
        }
    }
}

impl std::fmt::Debug for RtsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtsConfig")
            .field("yield_max_op_count", &self.yield_max_op_count)
            .field("max_resumption_depth", &self.max_resumption_depth)
            .field("thread_pool_size", &self.thread_pool_size)
            .field("scheduled_pool_size", &self.scheduled_pool_size)
            .field("unhandled", &self.unhandled.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Default worker pool size: `max(2, available cores)`.
#[must_use]
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_knobs() {
        let config = RtsConfig::default();
        assert_eq!(config.yield_max_op_count, 1_048_576);
        assert_eq!(config.max_resumption_depth, 10);
        assert!(config.thread_pool_size >= 2);
        assert_eq!(config.scheduled_pool_size, 1);
    }

    #[test]
    fn builders_clamp_degenerate_values() {
        let config = RtsConfig::new()
            .with_yield_max_op_count(0)
            .with_thread_pool_size(0);
        assert_eq!(config.yield_max_op_count, 1);
        assert_eq!(config.thread_pool_size, 1);
    }
}
