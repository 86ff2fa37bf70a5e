//! Progress reporting and cancellation.
//!
//! Serialization, key derivation and merge are synchronous and may run long
//! on large databases. Every entry point takes a `StatusLogger`; the engine
//! polls it at least once per processed entry and stops promptly when it
//! returns `false`. The codec surfaces the stop as [`Error::Cancelled`]; the
//! merge engine returns early with the tree in a consistent state.

use crate::error::{Error, Result};

/// Receiver for progress updates. `set_progress` returns `false` to request
/// cancellation.
pub trait StatusLogger {
    fn set_progress(&self, percent: u32) -> bool;

    fn set_text(&self, _text: &str) -> bool {
        true
    }
}

/// Logger that reports nothing and never cancels.
pub struct NullStatusLogger;

impl StatusLogger for NullStatusLogger {
    fn set_progress(&self, _percent: u32) -> bool {
        true
    }
}

/// Map a cancellation request onto the codec error taxonomy.
pub(crate) fn check_continue(logger: &dyn StatusLogger, percent: u32) -> Result<()> {
    if logger.set_progress(percent) {
        Ok(())
    } else {
        Err(Error::Cancelled)
    }
}
