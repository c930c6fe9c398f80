//! Cooperative cancellation for long-running store operations.
//!
//! Blob streaming, hashing and merge passes poll a shared flag between
//! chunks (or between groups) and stop with [`StoreError::Cancelled`] once
//! the flag has been raised by another thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, StoreError};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every operation holding a clone of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` if cancellation was requested.
    pub fn check(&self, op: &'static str) -> Result<()> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled { op })
        } else {
            Ok(())
        }
    }
}
