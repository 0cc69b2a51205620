use crate::models::RunState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared status handle for one run. Clones observe the same state, so the
/// caller that kicked off a run can poll progress and request cancellation
/// while the engine drives the replay.
#[derive(Clone, Default)]
pub struct RunStatus {
    inner: Arc<Mutex<RunStatusData>>,
    cancelled: Arc<AtomicBool>,
}

struct RunStatusData {
    state: RunState,
    bars_processed: usize,
    bars_total: usize,
}

impl Default for RunStatusData {
    fn default() -> Self {
        Self {
            state: RunState::Pending,
            bars_processed: 0,
            bars_total: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RunStatusSnapshot {
    pub state: RunState,
    pub bars_processed: usize,
    pub bars_total: usize,
}

impl RunStatusSnapshot {
    pub fn progress_pct(&self) -> f64 {
        if self.bars_total == 0 {
            0.0
        } else {
            self.bars_processed as f64 / self.bars_total as f64 * 100.0
        }
    }
}

impl RunStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: RunState) {
        if let Ok(mut data) = self.inner.lock() {
            data.state = state;
        }
    }

    pub fn set_total(&self, bars_total: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.bars_total = bars_total;
        }
    }

    pub fn set_processed(&self, bars_processed: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.bars_processed = bars_processed;
        }
    }

    /// Cooperative cancellation: the engine observes the flag at bar
    /// boundaries and discards the partial run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RunStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            RunStatusSnapshot {
                state: data.state,
                bars_processed: data.bars_processed,
                bars_total: data.bars_total,
            }
        } else {
            RunStatusSnapshot {
                state: RunState::Failed,
                bars_processed: 0,
                bars_total: 0,
            }
        }
    }
}
