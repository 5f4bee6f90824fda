//! The streaming pipeline: sliding window, bookmark registry and the
//! bookmark-tracking byte encoder.
//!
//! Data flows one line at a time: raw bytes are split into lines by the
//! facade, pushed through the [`window::SlidingWindow`] where the action
//! layer sees them with bounded context, and emitted through the
//! [`encoder::BookmarkEncoder`] which tracks byte offsets for the lines
//! that will be rewritten in place after the stream ends.

pub mod bookmark;
pub mod encoder;
pub mod window;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ProcessError, Result};

pub use bookmark::{Bookmark, BookmarkKey, BookmarkRegistry};
pub use encoder::BookmarkEncoder;
pub use window::{LineContext, LineRecord, SlidingWindow};

/// Cooperative cancellation flag, polled at line boundaries in the window
/// and encoder and before each retro-patch write.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Every pipeline stage observes this at its next
    /// record boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Return `Err(Aborted)` when the token has tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ProcessError::Aborted)
        } else {
            Ok(())
        }
    }
}
