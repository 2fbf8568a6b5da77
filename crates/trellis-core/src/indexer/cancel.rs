//! Cooperative cancellation shared by extraction workers, merges, and
//! resolution batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{TrellisError, TrellisResult};

/// Clonable cancel handle. Trips on an explicit `cancel()` or once the
/// optional deadline passes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// `Err(Cancelled)` naming the phase when the token has tripped.
    pub fn check(&self, phase: &str) -> TrellisResult<()> {
        if self.is_cancelled() {
            return Err(TrellisError::Cancelled(phase.to_string()));
        }
        Ok(())
    }
}
