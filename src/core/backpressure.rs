//! Backpressure governor for the pipeline provider.
//!
//! While a pipeline turn is generating text or synthesizing speech the
//! provider cannot take new caller audio. The RX loop consults the governor
//! and drops frames instead of buffering them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct BackpressureGovernor {
    active_turns: AtomicUsize,
    dropped_frames: AtomicU64,
    turns_started: AtomicU64,
}

impl BackpressureGovernor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a turn as processing until the returned guard is dropped.
    ///
    /// The guard clears the flag on every exit path, including early returns,
    /// errors and task cancellation.
    pub fn begin_turn(self: &Arc<Self>) -> TurnGuard {
        self.active_turns.fetch_add(1, Ordering::AcqRel);
        self.turns_started.fetch_add(1, Ordering::Relaxed);
        TurnGuard {
            governor: Arc::clone(self),
        }
    }

    pub fn is_processing_turn(&self) -> bool {
        self.active_turns.load(Ordering::Acquire) > 0
    }

    /// Returns true when the frame must be dropped, counting the drop.
    pub fn admit_or_drop(&self) -> bool {
        if self.is_processing_turn() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn turns_started(&self) -> u64 {
        self.turns_started.load(Ordering::Relaxed)
    }
}

/// RAII marker for an in-progress pipeline turn.
#[derive(Debug)]
pub struct TurnGuard {
    governor: Arc<BackpressureGovernor>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.governor.active_turns.fetch_sub(1, Ordering::AcqRel);
    }
}
