//! Per-submission markers that steer retry, flush and enrichment behavior.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Completion signal for a caller waiting synchronously on one submission.
///
/// Completed exactly once: the first `complete` wins, later calls are ignored.
#[derive(Debug, Clone, Default)]
pub struct FlushSignal {
    inner: Arc<(Mutex<Option<bool>>, Condvar)>,
}

impl FlushSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome and wake waiters.
    pub fn complete(&self, success: bool) {
        let (lock, cond) = &*self.inner;
        let mut result = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if result.is_none() {
            *result = Some(success);
            cond.notify_all();
        }
    }

    /// The outcome, if the submission has finished.
    pub fn result(&self) -> Option<bool> {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until completed or `timeout` elapses. `None` means timed out.
    pub fn wait(&self, timeout: Duration) -> Option<bool> {
        let (lock, cond) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut result = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while result.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            result = cond
                .wait_timeout(result, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *result
    }
}

/// Markers attached to one submission
#[derive(Debug, Clone)]
pub struct Hint {
    retryable: bool,
    cached: bool,
    disk_flush: bool,
    flush: Option<FlushSignal>,
}

impl Hint {
    /// Hint for a normal submission: retryable, nothing else.
    pub fn new() -> Self {
        Self {
            retryable: true,
            cached: false,
            disk_flush: false,
            flush: None,
        }
    }

    /// Mark as loaded from the disk cache.
    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Mark as a crash-time flush: persist before sending and arm
    /// startup-crash detection.
    pub fn disk_flush_notification(mut self) -> Self {
        self.disk_flush = true;
        self
    }

    /// Attach a completion signal the caller can wait on.
    pub fn with_flush_signal(mut self, signal: FlushSignal) -> Self {
        self.flush = Some(signal);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn is_disk_flush(&self) -> bool {
        self.disk_flush
    }

    pub fn flush_signal(&self) -> Option<&FlushSignal> {
        self.flush.as_ref()
    }

    /// Complete the flush signal, if any.
    pub(crate) fn mark_done(&self, success: bool) {
        if let Some(signal) = &self.flush {
            signal.complete(success);
        }
    }

    /// Flags that survive a trip through the disk cache.
    pub fn persisted_flags(&self) -> HintFlags {
        HintFlags {
            retryable: self.retryable,
            disk_flush: self.disk_flush,
        }
    }

    /// Rebuild the hint of an entry loaded from the cache.
    pub fn from_cache(flags: HintFlags) -> Self {
        Self {
            retryable: flags.retryable,
            cached: true,
            disk_flush: flags.disk_flush,
            flush: None,
        }
    }
}

impl Default for Hint {
    fn default() -> Self {
        Self::new()
    }
}

/// Hint flags as stored next to a cached envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintFlags {
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    #[serde(default)]
    pub disk_flush: bool,
}

fn default_retryable() -> bool {
    true
}

impl Default for HintFlags {
    fn default() -> Self {
        Self {
            retryable: true,
            disk_flush: false,
        }
    }
}
